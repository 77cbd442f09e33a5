//! Input classification: IP literals vs. host names.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Longest host name the resolver accepts, dots included.
pub const MAX_NAME_LEN: usize = 253;

const MAX_LABEL_LEN: usize = 63;

/// What an input string turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Ip4Literal,
    Ip6Literal,
    Hostname,
    Invalid,
}

/// Classifies an input string as an IPv4 literal, an IPv6 literal, a
/// candidate host name, or garbage. IP classification uses the standard
/// library's textual-address parsers.
pub fn classify(name: &str) -> NameKind {
    if name.parse::<Ipv4Addr>().is_ok() {
        return NameKind::Ip4Literal;
    }
    if name.parse::<Ipv6Addr>().is_ok() {
        return NameKind::Ip6Literal;
    }
    if is_valid_hostname(name) {
        return NameKind::Hostname;
    }
    NameKind::Invalid
}

/// Total length ≤ 253; one or more labels separated by `.`; each label is
/// alphanumeric, may contain interior hyphens, and is at most 63 octets.
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    name.split('.').all(valid_label)
}

fn valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_LABEL_LEN {
        return false;
    }
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// Lowercases a name and drops a trailing root dot. Names parsed off the
/// wire arrive fully qualified; everything downstream compares the
/// normalized form.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
