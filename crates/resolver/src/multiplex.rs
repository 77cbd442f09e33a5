//! The request multiplexer.
//!
//! Many in-flight questions share one connection per upstream. Requests are
//! identified by a process-wide 16-bit id; responses are routed back to the
//! originating waiter by that id alone. A truncated datagram reply is
//! transparently re-issued over the stream form of the same endpoint.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use nimbus_dns_domain::{AnswerRecord, RecordType, ResolveError, UpstreamEndpoint, MAX_REQUEST_ID};

use crate::cache::{CacheKey, CacheStore};
use crate::codec::MessageCodec;
use crate::conn::ServerConnection;

pub(crate) type ExchangeResult = Result<AnswerGroups, ResolveError>;

/// Answer records grouped by kind, preserving both response order within a
/// group and the order in which kinds first appeared.
#[derive(Debug, Clone, Default)]
pub struct AnswerGroups {
    groups: Vec<(RecordType, Vec<AnswerRecord>)>,
}

impl AnswerGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: AnswerRecord) {
        match self
            .groups
            .iter_mut()
            .find(|(kind, _)| *kind == record.record_type)
        {
            Some((_, records)) => records.push(record),
            None => self.groups.push((record.record_type, vec![record])),
        }
    }

    pub fn merge(&mut self, other: AnswerGroups) {
        for (_, records) in other.groups {
            for record in records {
                self.push(record);
            }
        }
    }

    pub fn get(&self, record_type: RecordType) -> Option<&[AnswerRecord]> {
        self.groups
            .iter()
            .find(|(kind, _)| *kind == record_type)
            .map(|(_, records)| records.as_slice())
    }

    pub fn contains(&self, record_type: RecordType) -> bool {
        self.get(record_type).is_some()
    }

    pub fn remove(&mut self, record_type: RecordType) -> Option<Vec<AnswerRecord>> {
        let idx = self
            .groups
            .iter()
            .position(|(kind, _)| *kind == record_type)?;
        Some(self.groups.remove(idx).1)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(RecordType, Vec<AnswerRecord>)> {
        self.groups.iter()
    }

    /// The target of the first record of an alias group.
    pub fn first_data(&self, record_type: RecordType) -> Option<&str> {
        self.get(record_type)
            .and_then(|records| records.first())
            .map(|record| record.data.as_str())
    }

    /// Flattens into the caller's answer order: for each type in
    /// `priority`, all records of that type, then whatever kinds remain in
    /// first-seen order.
    pub fn into_ordered(mut self, priority: &[RecordType]) -> Vec<AnswerRecord> {
        let mut out = Vec::new();
        for record_type in priority {
            if let Some(records) = self.remove(*record_type) {
                out.extend(records);
            }
        }
        for (_, records) in self.groups {
            out.extend(records);
        }
        out
    }
}

/// One question sent upstream whose answer has not yet been delivered.
pub(crate) struct PendingRequest {
    pub(crate) domain: String,
    pub(crate) record_type: RecordType,
    pub(crate) endpoint: UpstreamEndpoint,
    pub(crate) waiter: oneshot::Sender<ExchangeResult>,
    pub(crate) conn_uri: String,
}

/// Global multiplexer state: the pending table, the connection index, the
/// id counter, and the 1 Hz maintenance tick.
pub(crate) struct Multiplexer {
    codec: Arc<dyn MessageCodec>,
    cache: Arc<dyn CacheStore>,
    next_id: AtomicU32,
    pending: DashMap<u16, PendingRequest>,
    connections: DashMap<String, Arc<ServerConnection>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    idle_timeout: Duration,
    cache_sweep_secs: u64,
}

impl Multiplexer {
    pub(crate) fn new(
        codec: Arc<dyn MessageCodec>,
        cache: Arc<dyn CacheStore>,
        idle_timeout: Duration,
        cache_sweep_secs: u64,
    ) -> Self {
        Self {
            codec,
            cache,
            next_id: AtomicU32::new(0),
            pending: DashMap::new(),
            connections: DashMap::new(),
            sweeper: Mutex::new(None),
            idle_timeout,
            cache_sweep_secs,
        }
    }

    pub(crate) fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Monotonically increasing id wrapping within [1, MAX_REQUEST_ID);
    /// ids still pending are skipped.
    fn allocate_id(&self) -> u16 {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = (raw % (MAX_REQUEST_ID - 1)) as u16 + 1;
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn connection_for(&self, uri: &str) -> Option<Arc<ServerConnection>> {
        self.connections.get(uri).map(|entry| entry.value().clone())
    }

    /// Locates or lazily creates the connection for `endpoint`.
    async fn connection(self: &Arc<Self>, endpoint: UpstreamEndpoint) -> Result<Arc<ServerConnection>, ResolveError> {
        let uri = endpoint.to_string();
        if let Some(conn) = self.connection_for(&uri) {
            return Ok(conn);
        }
        let conn =
            ServerConnection::open(endpoint, self.idle_timeout, Arc::downgrade(self)).await?;
        let entry = self
            .connections
            .entry(uri)
            .or_insert_with(|| conn.clone())
            .clone();
        if !Arc::ptr_eq(&entry, &conn) {
            // Lost a creation race; keep the one in the table.
            conn.abort_reader();
        }
        self.ensure_sweeper();
        Ok(entry)
    }

    /// Sends one question upstream and returns the waiter end of its
    /// completion channel.
    pub(crate) async fn request(
        self: &Arc<Self>,
        endpoint: UpstreamEndpoint,
        domain: &str,
        record_type: RecordType,
    ) -> Result<oneshot::Receiver<ExchangeResult>, ResolveError> {
        let conn = self.connection(endpoint).await?;
        let id = self.allocate_id();
        let payload = self.codec.encode_query(id, domain, record_type)?;

        let (waiter, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                domain: domain.to_string(),
                record_type,
                endpoint,
                waiter,
                conn_uri: conn.uri().to_string(),
            },
        );
        conn.track(id);

        if let Err(e) = conn.send(&payload).await {
            self.remove_pending(id);
            return Err(e);
        }
        debug!(
            server = %conn.uri(),
            id,
            domain,
            record_type = %record_type,
            "query sent"
        );
        Ok(rx)
    }

    /// One complete exchange: send the question, await the routed reply,
    /// give up at `deadline`. A timed-out exchange stays in the pending
    /// table so its late reply still populates the cache.
    pub(crate) async fn exchange(
        self: &Arc<Self>,
        endpoint: UpstreamEndpoint,
        domain: &str,
        record_type: RecordType,
        deadline: tokio::time::Instant,
    ) -> ExchangeResult {
        let fut = async {
            let rx = self.request(endpoint, domain, record_type).await?;
            rx.await
                .unwrap_or_else(|_| Err(ResolveError::Connection("resolver shut down".to_string())))
        };
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout),
        }
    }

    fn remove_pending(&self, id: u16) -> Option<PendingRequest> {
        let (_, req) = self.pending.remove(&id)?;
        // The server entry goes before (or with) the global entry.
        if let Some(conn) = self.connection_for(&req.conn_uri) {
            conn.untrack(id);
        }
        Some(req)
    }

    /// Handles one decoded-or-not message from a connection's reader.
    pub(crate) fn dispatch(self: &Arc<Self>, conn: &Arc<ServerConnection>, bytes: &[u8]) {
        let decoded = match self.codec.decode_response(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.teardown(
                    conn,
                    ResolveError::Connection(format!("undecodable frame from {}: {}", conn.uri(), e)),
                );
                return;
            }
        };

        if !decoded.is_response {
            self.teardown(
                conn,
                ResolveError::Connection(format!("non-response message from {}", conn.uri())),
            );
            return;
        }

        // Late replies to completed requests and unknown ids drop silently.
        let Some(req) = self.remove_pending(decoded.id) else {
            debug!(server = %conn.uri(), id = decoded.id, "dropping reply with unknown id");
            return;
        };

        if decoded.code != 0 {
            warn!(
                server = %conn.uri(),
                domain = %req.domain,
                code = decoded.code,
                "upstream returned error code"
            );
            self.conclude(req, Err(ResolveError::ServerFailure { code: decoded.code }));
            return;
        }

        if decoded.truncated {
            if req.endpoint.is_udp() {
                self.reissue_over_tcp(req);
            } else {
                self.conclude(req, Err(ResolveError::TruncatedTcpReply));
            }
            return;
        }

        if decoded.answers.is_empty() {
            self.conclude(req, Err(ResolveError::NoRecord));
            return;
        }

        let mut groups = AnswerGroups::new();
        for answer in decoded.answers {
            groups.push(AnswerRecord::new(answer.data, answer.record_type, answer.ttl));
        }
        self.conclude(req, Ok(groups));
    }

    /// The same question goes out again on the stream form of the endpoint;
    /// the new exchange's outcome is chained to the original waiter.
    fn reissue_over_tcp(self: &Arc<Self>, req: PendingRequest) {
        let PendingRequest {
            domain,
            record_type,
            endpoint,
            waiter,
            ..
        } = req;
        let tcp = endpoint.to_tcp();
        debug!(server = %tcp, domain = %domain, "truncated reply, retrying over TCP");
        let mux = self.clone();
        tokio::spawn(async move {
            let result = match mux.request(tcp, &domain, record_type).await {
                Ok(rx) => match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(ResolveError::Connection("resolver shut down".to_string())),
                },
                Err(e) => Err(e),
            };
            let _ = waiter.send(result);
        });
    }

    /// Terminal transition for an already-removed request: cache the
    /// grouped answers and complete the waiter. A waiter abandoned by a
    /// timed-out caller drops the result silently.
    fn conclude(&self, req: PendingRequest, result: ExchangeResult) {
        if let Ok(groups) = &result {
            for (kind, records) in groups.iter() {
                self.cache
                    .set(CacheKey::new(req.domain.clone(), *kind), records.clone());
            }
        }
        let _ = req.waiter.send(result);
    }

    /// Connection-level fault: close the connection and fail every request
    /// outstanding on it with the same error.
    pub(crate) fn teardown(&self, conn: &Arc<ServerConnection>, error: ResolveError) {
        warn!(server = %conn.uri(), error = %error, "tearing down connection");
        self.connections.remove(conn.uri());
        for id in conn.drain_pending() {
            if let Some((_, req)) = self.pending.remove(&id) {
                let _ = req.waiter.send(Err(error.clone()));
            }
        }
        conn.abort_reader();
    }

    /// Starts the 1 Hz maintenance tick unless it is already running. The
    /// tick closes idle-expired connections, periodically sweeps the cache,
    /// and disables itself when no connections remain.
    fn ensure_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().unwrap();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;
            loop {
                tick.tick().await;
                let Some(mux) = weak.upgrade() else { break };

                ticks += 1;
                if mux.cache_sweep_secs > 0 && ticks % mux.cache_sweep_secs == 0 {
                    mux.cache.sweep();
                }

                let now = Instant::now();
                let expired: Vec<Arc<ServerConnection>> = mux
                    .connections
                    .iter()
                    .filter(|entry| entry.value().is_idle_expired(now))
                    .map(|entry| entry.value().clone())
                    .collect();
                for conn in expired {
                    debug!(server = %conn.uri(), "closing idle connection");
                    mux.connections.remove(conn.uri());
                    conn.abort_reader();
                }

                if mux.connections.is_empty() {
                    // Re-checked under the slot lock so a connection created
                    // concurrently restarts the tick rather than losing it.
                    let mut slot = mux.sweeper.lock().unwrap();
                    if mux.connections.is_empty() {
                        *slot = None;
                        break;
                    }
                }
            }
        }));
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        for entry in self.connections.iter() {
            entry.value().abort_reader();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_dns_domain::RecordType;

    fn rec(data: &str, record_type: RecordType, ttl: u32) -> AnswerRecord {
        AnswerRecord::new(data, record_type, ttl)
    }

    #[test]
    fn test_groups_preserve_order_within_kind() {
        let mut groups = AnswerGroups::new();
        groups.push(rec("1.1.1.1", RecordType::A, 60));
        groups.push(rec("::1", RecordType::AAAA, 60));
        groups.push(rec("2.2.2.2", RecordType::A, 60));

        let a = groups.get(RecordType::A).unwrap();
        assert_eq!(a[0].data, "1.1.1.1");
        assert_eq!(a[1].data, "2.2.2.2");
    }

    #[test]
    fn test_into_ordered_follows_priority_then_first_seen() {
        let mut groups = AnswerGroups::new();
        groups.push(rec("1.1.1.1", RecordType::A, 60));
        groups.push(rec("txt-data", RecordType::Other(16), 60));
        groups.push(rec("::1", RecordType::AAAA, 60));

        let ordered = groups.into_ordered(&[RecordType::AAAA, RecordType::A]);
        assert_eq!(ordered[0].record_type, RecordType::AAAA);
        assert_eq!(ordered[1].record_type, RecordType::A);
        assert_eq!(ordered[2].record_type, RecordType::Other(16));
    }

    #[test]
    fn test_remove_strips_group() {
        let mut groups = AnswerGroups::new();
        groups.push(rec("target.test", RecordType::CNAME, 60));
        groups.push(rec("1.1.1.1", RecordType::A, 60));

        assert!(groups.remove(RecordType::CNAME).is_some());
        assert!(!groups.contains(RecordType::CNAME));
        assert!(groups.contains(RecordType::A));
        assert!(groups.remove(RecordType::DNAME).is_none());
    }

    #[test]
    fn test_first_data() {
        let mut groups = AnswerGroups::new();
        groups.push(rec("target.test", RecordType::CNAME, 60));
        assert_eq!(groups.first_data(RecordType::CNAME), Some("target.test"));
        assert_eq!(groups.first_data(RecordType::DNAME), None);
    }

    fn test_mux() -> Multiplexer {
        Multiplexer::new(
            Arc::new(crate::codec::WireCodec::new()),
            Arc::new(crate::cache::MemoryCache::new()),
            Duration::from_secs(30),
            60,
        )
    }

    fn dummy_pending(endpoint: UpstreamEndpoint) -> PendingRequest {
        let (waiter, _rx) = oneshot::channel();
        PendingRequest {
            domain: "example.test".to_string(),
            record_type: RecordType::A,
            endpoint,
            waiter,
            conn_uri: endpoint.to_string(),
        }
    }

    #[test]
    fn test_id_allocation_starts_at_one_and_skips_pending() {
        let mux = test_mux();
        let endpoint: UpstreamEndpoint = "udp://127.0.0.1:53".parse().unwrap();

        assert_eq!(mux.allocate_id(), 1);
        mux.pending.insert(3, dummy_pending(endpoint));
        assert_eq!(mux.allocate_id(), 2);
        // id 3 is taken; the counter advances past it.
        assert_eq!(mux.allocate_id(), 4);
    }

    #[test]
    fn test_id_allocation_wraps_into_range() {
        let mux = test_mux();
        mux.next_id.store(MAX_REQUEST_ID - 2, Ordering::Relaxed);
        assert_eq!(mux.allocate_id(), 65535);
        // Wraps to the bottom of the range, never 0.
        assert_eq!(mux.allocate_id(), 1);
    }
}
