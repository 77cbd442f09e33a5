//! The stub resolver entry point.
//!
//! A `StubResolver` owns the whole resolver state behind an `Arc` and is
//! cheap to clone. Lookups run literal shortcut → hosts file → cache →
//! upstream, merge every source, and order the final list by the caller's
//! requested type priority.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info};

use nimbus_dns_domain::hostname::normalize_name;
use nimbus_dns_domain::{
    classify, AnswerRecord, NameKind, RecordType, ResolveError, ResolveOptions, ResolverConfig,
    UpstreamEndpoint, DEFAULT_TIMEOUT_MS,
};

use crate::cache::{CacheKey, CacheMetricsSnapshot, CacheStore, MemoryCache};
use crate::chase::{chase, pick_error};
use crate::codec::{MessageCodec, WireCodec};
use crate::hosts::{default_hosts_path, HostsTable};
use crate::multiplex::{AnswerGroups, Multiplexer};

#[derive(Clone)]
pub struct StubResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    config: ResolverConfig,
    mux: Arc<Multiplexer>,
    hosts: RwLock<Option<Arc<HostsTable>>>,
}

impl StubResolver {
    /// A resolver with default configuration.
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default())
    }

    pub fn with_config(config: ResolverConfig) -> Self {
        Self::with_parts(config, Arc::new(WireCodec::new()), Arc::new(MemoryCache::new()))
    }

    /// Swaps in an alternative codec or cache backend behind the same
    /// resolver.
    pub fn with_parts(
        config: ResolverConfig,
        codec: Arc<dyn MessageCodec>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        info!(
            upstream = %config.upstream,
            idle_timeout_secs = config.idle_timeout_secs,
            "stub resolver created"
        );
        let mux = Arc::new(Multiplexer::new(
            codec,
            cache,
            Duration::from_secs(config.idle_timeout_secs),
            config.cache_sweep_secs,
        ));
        StubResolver {
            inner: Arc::new(ResolverInner {
                config,
                mux,
                hosts: RwLock::new(None),
            }),
        }
    }

    /// Resolves `name` to its answer records for every requested type
    /// (default A and AAAA), following alias chains.
    pub async fn resolve(
        &self,
        name: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<AnswerRecord>, ResolveError> {
        match classify(name) {
            // Literals short-circuit everything: no sockets, no cache.
            NameKind::Ip4Literal => {
                return Ok(vec![AnswerRecord::permanent(name, RecordType::A)]);
            }
            NameKind::Ip6Literal => {
                return Ok(vec![AnswerRecord::permanent(name, RecordType::AAAA)]);
            }
            NameKind::Invalid => return Err(ResolveError::InvalidName(name.to_string())),
            NameKind::Hostname => {}
        }

        let types = dedup_types(
            options
                .types
                .clone()
                .unwrap_or_else(|| vec![RecordType::A, RecordType::AAAA]),
        );
        self.lookup(&normalize_name(name), &types, true, options).await
    }

    /// Resolves a single record type. Alias chains are only followed when
    /// `options.recurse` is set.
    pub async fn query(
        &self,
        name: &str,
        record_type: RecordType,
        options: &ResolveOptions,
    ) -> Result<Vec<AnswerRecord>, ResolveError> {
        match classify(name) {
            NameKind::Ip4Literal | NameKind::Ip6Literal => {
                return Err(ResolveError::InvalidName(format!(
                    "cannot query records of IP literal {}",
                    name
                )));
            }
            NameKind::Invalid => return Err(ResolveError::InvalidName(name.to_string())),
            NameKind::Hostname => {}
        }
        self.lookup(
            &normalize_name(name),
            &[record_type],
            options.recurse,
            options,
        )
        .await
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.inner.mux.cache().snapshot()
    }

    /// Open upstream connections right now; idle ones close on their own.
    pub fn connection_count(&self) -> usize {
        self.inner.mux.connection_count()
    }

    /// Questions sent upstream whose answers have not yet arrived.
    pub fn pending_count(&self) -> usize {
        self.inner.mux.pending_count()
    }

    async fn lookup(
        &self,
        name: &str,
        types: &[RecordType],
        recurse: bool,
        options: &ResolveOptions,
    ) -> Result<Vec<AnswerRecord>, ResolveError> {
        let mut satisfied = AnswerGroups::new();
        let mut remaining: Vec<RecordType> = types.to_vec();

        if !options.no_hosts {
            let hosts = self.hosts(options.reload_hosts).await;
            remaining.retain(|record_type| match hosts.lookup(*record_type, name) {
                Some(record) => {
                    satisfied.push(record);
                    false
                }
                None => true,
            });
        }

        if !options.no_cache {
            let cache = self.inner.mux.cache();
            remaining.retain(|record_type| {
                match cache.get(&CacheKey::new(name.to_string(), *record_type)) {
                    Some(records) => {
                        for record in records {
                            satisfied.push(record);
                        }
                        false
                    }
                    None => true,
                }
            });
        }

        if remaining.is_empty() {
            return Ok(satisfied.into_ordered(types));
        }

        let endpoint = self.endpoint_for(options)?;
        let timeout = Duration::from_millis(options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let deadline = tokio::time::Instant::now() + timeout;

        let upstream = if recurse {
            chase(
                &self.inner.mux,
                endpoint,
                name,
                &remaining,
                !options.no_cache,
                deadline,
            )
            .await
        } else {
            self.exchange_each(endpoint, name, &remaining, deadline).await
        };

        match upstream {
            Ok(groups) => {
                satisfied.merge(groups);
                Ok(satisfied.into_ordered(types))
            }
            Err(e) if satisfied.is_empty() => Err(e),
            Err(e) => {
                debug!(domain = %name, error = %e, "returning locally satisfied answers");
                Ok(satisfied.into_ordered(types))
            }
        }
    }

    /// One direct exchange per type, in parallel, without alias chasing.
    async fn exchange_each(
        &self,
        endpoint: UpstreamEndpoint,
        name: &str,
        types: &[RecordType],
        deadline: tokio::time::Instant,
    ) -> Result<AnswerGroups, ResolveError> {
        let results = join_all(
            types
                .iter()
                .map(|record_type| self.inner.mux.exchange(endpoint, name, *record_type, deadline)),
        )
        .await;

        let mut groups = AnswerGroups::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(answer) => groups.merge(answer),
                Err(e) => errors.push(e),
            }
        }
        if groups.is_empty() && !errors.is_empty() {
            return Err(pick_error(errors));
        }
        Ok(groups)
    }

    fn endpoint_for(&self, options: &ResolveOptions) -> Result<UpstreamEndpoint, ResolveError> {
        let server = options
            .server
            .as_deref()
            .unwrap_or(&self.inner.config.upstream);
        UpstreamEndpoint::from_server_option(server)
    }

    async fn hosts(&self, reload: bool) -> Arc<HostsTable> {
        if !reload {
            if let Some(table) = self.inner.hosts.read().await.as_ref() {
                return table.clone();
            }
        }
        let path = self
            .inner
            .config
            .hosts_path
            .clone()
            .unwrap_or_else(default_hosts_path);
        let table = Arc::new(HostsTable::load(&path).await);
        *self.inner.hosts.write().await = Some(table.clone());
        table
    }
}

impl Default for StubResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn dedup_types(types: Vec<RecordType>) -> Vec<RecordType> {
    let mut out = Vec::with_capacity(types.len());
    for record_type in types {
        if !out.contains(&record_type) {
            out.push(record_type);
        }
    }
    out
}
