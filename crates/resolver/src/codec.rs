//! Boundary over the DNS wire codec.
//!
//! The resolver core never touches wire bytes itself; it builds queries and
//! reads responses through [`MessageCodec`]. The default implementation
//! wraps `hickory_proto`.

use std::net::IpAddr;
use std::str::FromStr;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType as HickoryRecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncodable, BinEncoder};
use tracing::debug;

use nimbus_dns_domain::hostname::normalize_name;
use nimbus_dns_domain::{RecordType, ResolveError};

/// DNAME has no first-class representation in hickory; it travels as an
/// unknown rdata with this type code.
const DNAME_CODE: u16 = 39;

/// One answer as it came off the wire.
#[derive(Debug, Clone)]
pub struct WireAnswer {
    pub record_type: RecordType,
    pub data: String,
    pub ttl: u32,
}

/// A decoded upstream reply, reduced to the fields the multiplexer acts on.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub id: u16,
    pub code: u8,
    pub is_response: bool,
    pub truncated: bool,
    pub answers: Vec<WireAnswer>,
}

pub trait MessageCodec: Send + Sync {
    /// Builds and encodes one query with recursion desired and no EDNS.
    fn encode_query(
        &self,
        id: u16,
        domain: &str,
        record_type: RecordType,
    ) -> Result<Vec<u8>, ResolveError>;

    /// Decodes one response message (a UDP datagram or a TCP frame).
    fn decode_response(&self, bytes: &[u8]) -> Result<DecodedResponse, ResolveError>;
}

/// `MessageCodec` over `hickory_proto`.
#[derive(Debug, Default)]
pub struct WireCodec;

impl WireCodec {
    pub fn new() -> Self {
        Self
    }

    fn to_hickory(record_type: RecordType) -> HickoryRecordType {
        match record_type {
            RecordType::A => HickoryRecordType::A,
            RecordType::AAAA => HickoryRecordType::AAAA,
            RecordType::CNAME => HickoryRecordType::CNAME,
            RecordType::DNAME => HickoryRecordType::Unknown(DNAME_CODE),
            RecordType::Other(code) => HickoryRecordType::Unknown(code),
        }
    }

    fn from_hickory(record_type: HickoryRecordType) -> RecordType {
        match record_type {
            HickoryRecordType::A => RecordType::A,
            HickoryRecordType::AAAA => RecordType::AAAA,
            HickoryRecordType::CNAME => RecordType::CNAME,
            other => RecordType::from_u16(u16::from(other)),
        }
    }

    fn serialize(message: &Message) -> Result<Vec<u8>, ResolveError> {
        let mut buf = Vec::with_capacity(512);
        let mut encoder = BinEncoder::new(&mut buf);
        message
            .emit(&mut encoder)
            .map_err(|e| ResolveError::Codec(format!("failed to serialize query: {}", e)))?;
        Ok(buf)
    }

    /// DNAME rdata is an uncompressed wire-format name.
    fn decode_wire_name(bytes: &[u8]) -> Result<String, ResolveError> {
        let mut decoder = BinDecoder::new(bytes);
        let name = Name::read(&mut decoder)
            .map_err(|e| ResolveError::Codec(format!("bad DNAME target: {}", e)))?;
        Ok(normalize_name(&name.to_utf8()))
    }
}

impl MessageCodec for WireCodec {
    fn encode_query(
        &self,
        id: u16,
        domain: &str,
        record_type: RecordType,
    ) -> Result<Vec<u8>, ResolveError> {
        let name = Name::from_str(domain)
            .map_err(|e| ResolveError::InvalidName(format!("{}: {}", domain, e)))?;

        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(Self::to_hickory(record_type));
        query.set_query_class(DNSClass::IN);

        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(query);

        Self::serialize(&message)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<DecodedResponse, ResolveError> {
        let message = Message::from_vec(bytes)
            .map_err(|e| ResolveError::Codec(format!("failed to parse response: {}", e)))?;

        let mut answers = Vec::with_capacity(message.answers().len());
        for record in message.answers() {
            let record_type = Self::from_hickory(record.record_type());
            let Some(rdata) = record.data() else {
                continue;
            };
            let data = match rdata {
                RData::A(a) => IpAddr::V4(a.0).to_string(),
                RData::AAAA(aaaa) => IpAddr::V6(aaaa.0).to_string(),
                RData::CNAME(target) => normalize_name(&target.to_utf8()),
                RData::Unknown { code, rdata } if *code == HickoryRecordType::Unknown(DNAME_CODE) => {
                    Self::decode_wire_name(rdata.anything())?
                }
                other => other.to_string(),
            };
            answers.push(WireAnswer {
                record_type,
                data,
                ttl: record.ttl(),
            });
        }

        let decoded = DecodedResponse {
            id: message.id(),
            code: message.response_code().low(),
            is_response: message.message_type() == MessageType::Response,
            truncated: message.truncated(),
            answers,
        };
        debug!(
            id = decoded.id,
            code = decoded.code,
            truncated = decoded.truncated,
            answers = decoded.answers.len(),
            "response decoded"
        );
        Ok(decoded)
    }
}
