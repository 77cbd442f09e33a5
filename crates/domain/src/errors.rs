use thiserror::Error;

use crate::dns_record::RecordType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid host name: {0}")]
    InvalidName(String),

    #[error("upstream returned error code {code}")]
    ServerFailure { code: u8 },

    #[error("no records of the requested type")]
    NoRecord,

    #[error("reply over TCP still truncated")]
    TruncatedTcpReply,

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("alias chain exceeded {0} hops")]
    ChainTooLong(usize),

    #[error("query timed out")]
    Timeout,

    #[error("cannot chase alias record type {0}")]
    AliasQuery(RecordType),

    #[error("invalid upstream server: {0}")]
    BadServer(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl ResolveError {
    /// True for faults that tear down the whole connection rather than a
    /// single request.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, ResolveError::Connection(_))
    }
}
