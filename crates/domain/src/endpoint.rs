//! Upstream server endpoints.
//!
//! Canonical forms are `udp://ip:port` and `tcp://ip:port` with IPv6
//! literals bracketed. The `Display` output of an endpoint is its canonical
//! URI and doubles as the connection-table key.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::config::DEFAULT_PORT;
use crate::errors::ResolveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamEndpoint {
    Udp { addr: SocketAddr },
    Tcp { addr: SocketAddr },
}

impl UpstreamEndpoint {
    pub fn udp(addr: SocketAddr) -> Self {
        UpstreamEndpoint::Udp { addr }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        UpstreamEndpoint::Tcp { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        match self {
            UpstreamEndpoint::Udp { addr } | UpstreamEndpoint::Tcp { addr } => *addr,
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, UpstreamEndpoint::Udp { .. })
    }

    pub fn protocol_name(&self) -> &'static str {
        match self {
            UpstreamEndpoint::Udp { .. } => "UDP",
            UpstreamEndpoint::Tcp { .. } => "TCP",
        }
    }

    /// The stream form of this endpoint, used when a datagram reply came
    /// back truncated.
    pub fn to_tcp(&self) -> Self {
        UpstreamEndpoint::Tcp { addr: self.addr() }
    }

    /// Parses a caller-supplied `server` option: `addr`, `addr:port`, or
    /// `[v6]:port`, with an optional `udp://` / `tcp://` scheme. A missing
    /// port defaults to 53.
    pub fn from_server_option(s: &str) -> Result<Self, ResolveError> {
        let (stream, rest) = if let Some(rest) = s.strip_prefix("udp://") {
            (false, rest)
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            (true, rest)
        } else {
            (false, s)
        };
        let addr = parse_addr(rest, DEFAULT_PORT)?;
        Ok(if stream {
            UpstreamEndpoint::Tcp { addr }
        } else {
            UpstreamEndpoint::Udp { addr }
        })
    }
}

fn parse_addr(s: &str, default_port: u16) -> Result<SocketAddr, ResolveError> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // Bracketed IPv6 without a port: "[2001:db8::1]".
    if let Some(inner) = s.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        if let Ok(ip) = inner.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, default_port));
        }
    }
    Err(ResolveError::BadServer(s.to_string()))
}

impl FromStr for UpstreamEndpoint {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("udp://") {
            let addr = rest
                .parse::<SocketAddr>()
                .map_err(|_| ResolveError::BadServer(s.to_string()))?;
            return Ok(UpstreamEndpoint::Udp { addr });
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let addr = rest
                .parse::<SocketAddr>()
                .map_err(|_| ResolveError::BadServer(s.to_string()))?;
            return Ok(UpstreamEndpoint::Tcp { addr });
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(UpstreamEndpoint::Udp { addr });
        }
        Err(ResolveError::BadServer(s.to_string()))
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamEndpoint::Udp { addr } => write!(f, "udp://{}", addr),
            UpstreamEndpoint::Tcp { addr } => write!(f, "tcp://{}", addr),
        }
    }
}
