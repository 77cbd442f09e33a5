use std::fmt;
use std::str::FromStr;

/// The record kinds the resolver reasons about, plus a carry-through case
/// for every other assigned type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    AAAA,
    /// Leaf-level alias. Chased before CNAME only when no DNAME is present.
    CNAME,
    /// Subtree-level alias. Takes precedence over CNAME when both appear.
    DNAME,
    Other(u16),
}

impl RecordType {
    pub fn to_u16(&self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::CNAME => 5,
            RecordType::AAAA => 28,
            RecordType::DNAME => 39,
            RecordType::Other(code) => *code,
        }
    }

    /// Total mapping from type codes; the four distinguished kinds are
    /// canonicalized so `Other(1)` never exists.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            5 => RecordType::CNAME,
            28 => RecordType::AAAA,
            39 => RecordType::DNAME,
            code => RecordType::Other(code),
        }
    }

    /// CNAME or DNAME.
    pub fn is_alias(&self) -> bool {
        matches!(self, RecordType::CNAME | RecordType::DNAME)
    }

    pub fn is_address(&self) -> bool {
        matches!(self, RecordType::A | RecordType::AAAA)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::DNAME => write!(f, "DNAME"),
            // RFC 3597 presentation for codes we do not special-case.
            RecordType::Other(code) => write!(f, "TYPE{}", code),
        }
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            "DNAME" => Ok(RecordType::DNAME),
            other => {
                if let Some(code) = other.strip_prefix("TYPE") {
                    code.parse::<u16>()
                        .map(RecordType::from_u16)
                        .map_err(|e| format!("Invalid record type '{}': {}", s, e))
                } else {
                    Err(format!("Unknown record type: {}", s))
                }
            }
        }
    }
}
