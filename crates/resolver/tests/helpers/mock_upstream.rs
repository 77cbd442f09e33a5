//! A scriptable upstream DNS server for integration tests.
//!
//! Listens on the same 127.0.0.1 port over both UDP and TCP. Each received
//! query is handed to the test's handler; returning `None` swallows the
//! query (for timeout scenarios).

#![allow(dead_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, NULL};
use hickory_proto::rr::{Name, RData, Record, RecordType as HickoryRecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

pub type Handler = Arc<dyn Fn(&Message, Transport) -> Option<Message> + Send + Sync>;

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub udp_queries: Arc<AtomicUsize>,
    pub tcp_queries: Arc<AtomicUsize>,
    udp_task: JoinHandle<()>,
    tcp_task: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn spawn(handler: Handler) -> Self {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let udp = UdpSocket::bind(addr).await.unwrap();

        let udp_queries = Arc::new(AtomicUsize::new(0));
        let tcp_queries = Arc::new(AtomicUsize::new(0));

        let udp_task = {
            let handler = handler.clone();
            let count = udp_queries.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                loop {
                    let Ok((n, peer)) = udp.recv_from(&mut buf).await else {
                        break;
                    };
                    let Ok(query) = Message::from_vec(&buf[..n]) else {
                        continue;
                    };
                    count.fetch_add(1, Ordering::SeqCst);
                    if let Some(response) = handler(&query, Transport::Udp) {
                        let bytes = response.to_vec().unwrap();
                        let _ = udp.send_to(&bytes, peer).await;
                    }
                }
            })
        };

        let tcp_task = {
            let handler = handler.clone();
            let count = tcp_queries.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((mut stream, _)) = tcp.accept().await else {
                        break;
                    };
                    let handler = handler.clone();
                    let count = count.clone();
                    tokio::spawn(async move {
                        loop {
                            let mut len_buf = [0u8; 2];
                            if stream.read_exact(&mut len_buf).await.is_err() {
                                break;
                            }
                            let len = u16::from_be_bytes(len_buf) as usize;
                            let mut msg = vec![0u8; len];
                            if stream.read_exact(&mut msg).await.is_err() {
                                break;
                            }
                            let Ok(query) = Message::from_vec(&msg) else {
                                break;
                            };
                            count.fetch_add(1, Ordering::SeqCst);
                            if let Some(response) = handler(&query, Transport::Tcp) {
                                let bytes = response.to_vec().unwrap();
                                let mut framed =
                                    (bytes.len() as u16).to_be_bytes().to_vec();
                                framed.extend_from_slice(&bytes);
                                if stream.write_all(&framed).await.is_err() {
                                    break;
                                }
                            }
                        }
                    });
                }
            })
        };

        MockUpstream {
            addr,
            udp_queries,
            tcp_queries,
            udp_task,
            tcp_task,
        }
    }

    /// The `server` option string pointing at this mock.
    pub fn server(&self) -> String {
        self.addr.to_string()
    }

    pub fn udp_count(&self) -> usize {
        self.udp_queries.load(Ordering::SeqCst)
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp_queries.load(Ordering::SeqCst)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.udp_task.abort();
        self.tcp_task.abort();
    }
}

/// An empty NOERROR response echoing the query's id and question.
pub fn response_to(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(true);
    response.set_recursion_available(true);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

pub fn qname(query: &Message) -> String {
    query.queries()[0]
        .name()
        .to_utf8()
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

pub fn qtype(query: &Message) -> HickoryRecordType {
    query.queries()[0].query_type()
}

pub const DNAME_QTYPE: HickoryRecordType = HickoryRecordType::Unknown(39);

pub fn a_record(name: &str, ip: &str, ttl: u32) -> Record {
    Record::from_rdata(
        Name::from_str(name).unwrap(),
        ttl,
        RData::A(A(ip.parse().unwrap())),
    )
}

pub fn aaaa_record(name: &str, ip: &str, ttl: u32) -> Record {
    Record::from_rdata(
        Name::from_str(name).unwrap(),
        ttl,
        RData::AAAA(AAAA(ip.parse().unwrap())),
    )
}

pub fn cname_record(name: &str, target: &str, ttl: u32) -> Record {
    Record::from_rdata(
        Name::from_str(name).unwrap(),
        ttl,
        RData::CNAME(CNAME(Name::from_str(target).unwrap())),
    )
}

/// DNAME carried as raw rdata: an uncompressed wire-format target name.
pub fn dname_record(name: &str, target: &str, ttl: u32) -> Record {
    let mut wire = Vec::new();
    for label in target.split('.') {
        wire.push(label.len() as u8);
        wire.extend_from_slice(label.as_bytes());
    }
    wire.push(0);
    Record::from_rdata(
        Name::from_str(name).unwrap(),
        ttl,
        RData::Unknown {
            code: HickoryRecordType::Unknown(39),
            rdata: NULL::with(wire),
        },
    )
}
