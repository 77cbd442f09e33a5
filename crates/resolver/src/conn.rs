//! Per-upstream server connections.
//!
//! One connection per canonical URI owns the socket and a reader task that
//! feeds every datagram or TCP frame to the multiplexer's dispatch. Reader
//! tasks hold the multiplexer weakly so dropping the last resolver handle
//! tears everything down.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nimbus_dns_domain::{ResolveError, UpstreamEndpoint};

use crate::multiplex::Multiplexer;

/// Datagram responses are at most this large without EDNS.
pub(crate) const UDP_RECV_SIZE: usize = 512;

const TCP_READ_CHUNK: usize = 4096;

/// Incremental decoder for the TCP transport's 16-bit length-prefixed
/// framing. Reads are appended as they arrive; complete frames come out as
/// soon as the buffer holds them, however the stream was fragmented.
#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    expected: Option<usize>,
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.expected.is_none() && self.buf.len() >= 2 {
                let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
                self.buf.drain(..2);
                self.expected = Some(len);
            }
            match self.expected {
                Some(len) if self.buf.len() >= len => {
                    frames.push(self.buf.drain(..len).collect());
                    self.expected = None;
                }
                _ => break,
            }
        }
        frames
    }
}

enum ConnSocket {
    Udp(Arc<UdpSocket>),
    Tcp(tokio::sync::Mutex<OwnedWriteHalf>),
}

/// One upstream connection, keyed by its canonical URI.
pub(crate) struct ServerConnection {
    uri: String,
    socket: ConnSocket,
    idle_timeout: Duration,
    /// Request ids outstanding on this connection. Membership only; the
    /// global pending table is primary.
    pending: Mutex<HashSet<u16>>,
    /// Set exactly while `pending` is empty.
    idle_deadline: Mutex<Option<Instant>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ServerConnection {
    pub(crate) async fn open(
        endpoint: UpstreamEndpoint,
        idle_timeout: Duration,
        mux: Weak<Multiplexer>,
    ) -> Result<Arc<Self>, ResolveError> {
        let uri = endpoint.to_string();
        let addr = endpoint.addr();

        let (socket, tcp_read) = match endpoint {
            UpstreamEndpoint::Udp { .. } => {
                let socket = open_udp(addr).await.map_err(|e| {
                    ResolveError::Connection(format!("failed to open {}: {}", uri, e))
                })?;
                (ConnSocket::Udp(Arc::new(socket)), None)
            }
            UpstreamEndpoint::Tcp { .. } => {
                let stream = TcpStream::connect(addr).await.map_err(|e| {
                    ResolveError::Connection(format!("failed to open {}: {}", uri, e))
                })?;
                let (read_half, write_half) = stream.into_split();
                (
                    ConnSocket::Tcp(tokio::sync::Mutex::new(write_half)),
                    Some(read_half),
                )
            }
        };
        debug!(server = %uri, "connection opened");

        let conn = Arc::new(ServerConnection {
            uri,
            socket,
            idle_timeout,
            pending: Mutex::new(HashSet::new()),
            idle_deadline: Mutex::new(Some(Instant::now() + idle_timeout)),
            reader: Mutex::new(None),
        });

        let handle = match &conn.socket {
            ConnSocket::Udp(socket) => {
                tokio::spawn(udp_reader(mux, conn.clone(), socket.clone()))
            }
            ConnSocket::Tcp(_) => {
                // tcp_read is always present for stream endpoints.
                let read_half = tcp_read.expect("stream connection without read half");
                tokio::spawn(tcp_reader(mux, conn.clone(), read_half))
            }
        };
        *conn.reader.lock().unwrap() = Some(handle);

        Ok(conn)
    }

    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    /// Writes one encoded query. UDP payloads go out as-is; TCP payloads
    /// are length-prefixed and written as a single buffer.
    pub(crate) async fn send(&self, payload: &[u8]) -> Result<(), ResolveError> {
        match &self.socket {
            ConnSocket::Udp(socket) => {
                let sent = socket.send(payload).await.map_err(|e| {
                    ResolveError::Connection(format!("send failed on {}: {}", self.uri, e))
                })?;
                if sent != payload.len() {
                    return Err(ResolveError::Connection(format!(
                        "short write on {}: {} of {} bytes",
                        self.uri,
                        sent,
                        payload.len()
                    )));
                }
            }
            ConnSocket::Tcp(write_half) => {
                let mut framed = Vec::with_capacity(payload.len() + 2);
                framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                framed.extend_from_slice(payload);
                let mut guard = write_half.lock().await;
                guard.write_all(&framed).await.map_err(|e| {
                    ResolveError::Connection(format!("send failed on {}: {}", self.uri, e))
                })?;
                guard.flush().await.map_err(|e| {
                    ResolveError::Connection(format!("flush failed on {}: {}", self.uri, e))
                })?;
            }
        }
        Ok(())
    }

    /// Marks a request id outstanding, clearing the idle deadline.
    pub(crate) fn track(&self, id: u16) {
        self.pending.lock().unwrap().insert(id);
        *self.idle_deadline.lock().unwrap() = None;
    }

    /// Drops a request id; arms the idle deadline when the connection
    /// becomes quiescent.
    pub(crate) fn untrack(&self, id: u16) {
        let mut pending = self.pending.lock().unwrap();
        pending.remove(&id);
        if pending.is_empty() {
            *self.idle_deadline.lock().unwrap() = Some(Instant::now() + self.idle_timeout);
        }
    }

    pub(crate) fn drain_pending(&self) -> Vec<u16> {
        self.pending.lock().unwrap().drain().collect()
    }

    pub(crate) fn is_idle_expired(&self, now: Instant) -> bool {
        self.idle_deadline
            .lock()
            .unwrap()
            .map(|deadline| now >= deadline)
            .unwrap_or(false)
    }

    pub(crate) fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Opens a non-blocking, unbound-port UDP socket connected to `server`.
async fn open_udp(server: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if server.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    let bind_addr: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;
    socket.connect(server).await?;
    Ok(socket)
}

/// Each datagram is exactly one response message.
async fn udp_reader(weak: Weak<Multiplexer>, conn: Arc<ServerConnection>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; UDP_RECV_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                let Some(mux) = weak.upgrade() else { break };
                mux.dispatch(&conn, &buf[..len]);
            }
            Err(e) => {
                warn!(server = %conn.uri(), error = %e, "UDP read error");
                if let Some(mux) = weak.upgrade() {
                    mux.teardown(
                        &conn,
                        ResolveError::Connection(format!("read error on {}: {}", conn.uri(), e)),
                    );
                }
                break;
            }
        }
    }
}

/// Drains the stream into the frame decoder; a zero-byte read means the
/// peer closed the connection.
async fn tcp_reader(
    weak: Weak<Multiplexer>,
    conn: Arc<ServerConnection>,
    mut read_half: OwnedReadHalf,
) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; TCP_READ_CHUNK];
    loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                if let Some(mux) = weak.upgrade() {
                    mux.teardown(
                        &conn,
                        ResolveError::Connection(format!("{} closed by peer", conn.uri())),
                    );
                }
                break;
            }
            Ok(n) => {
                let Some(mux) = weak.upgrade() else { break };
                for frame in frames.extend(&chunk[..n]) {
                    mux.dispatch(&conn, &frame);
                }
            }
            Err(e) => {
                warn!(server = %conn.uri(), error = %e, "TCP read error");
                if let Some(mux) = weak.upgrade() {
                    mux.teardown(
                        &conn,
                        ResolveError::Connection(format!("read error on {}: {}", conn.uri(), e)),
                    );
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_single_frame_single_read() {
        let mut fb = FrameBuffer::new();
        let frames = fb.extend(&frame(b"hello"));
        assert_eq!(frames, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_two_frames_one_read() {
        let mut fb = FrameBuffer::new();
        let mut bytes = frame(b"one");
        bytes.extend_from_slice(&frame(b"three"));
        let frames = fb.extend(&bytes);
        assert_eq!(frames, vec![b"one".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut fb = FrameBuffer::new();
        let bytes = frame(b"fragmented");
        assert!(fb.extend(&bytes[..1]).is_empty()); // half the length prefix
        assert!(fb.extend(&bytes[1..4]).is_empty());
        let frames = fb.extend(&bytes[4..]);
        assert_eq!(frames, vec![b"fragmented".to_vec()]);
    }

    #[test]
    fn test_frame_larger_than_read_chunk() {
        let payload = vec![0xabu8; 1500];
        let bytes = frame(&payload);
        let mut fb = FrameBuffer::new();
        let mut collected = Vec::new();
        for chunk in bytes.chunks(512) {
            collected.extend(fb.extend(chunk));
        }
        assert_eq!(collected, vec![payload]);
    }

    #[test]
    fn test_empty_frame() {
        let mut fb = FrameBuffer::new();
        let frames = fb.extend(&frame(b""));
        assert_eq!(frames, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_trailing_partial_frame_kept() {
        let mut fb = FrameBuffer::new();
        let mut bytes = frame(b"done");
        bytes.extend_from_slice(&frame(b"pending")[..5]);
        let frames = fb.extend(&bytes);
        assert_eq!(frames, vec![b"done".to_vec()]);
        let rest = fb.extend(&frame(b"pending")[5..]);
        assert_eq!(rest, vec![b"pending".to_vec()]);
    }
}
