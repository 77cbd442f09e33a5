//! Asynchronous DNS stub resolver.
//!
//! Lookups are answered from an in-memory TTL cache, the OS hosts file, or
//! a recursive upstream server queried over UDP with TCP fallback on
//! truncation. Concurrent lookups share one socket per upstream and a
//! single response-demultiplexing loop per socket.
//!
//! ```no_run
//! use nimbus_dns_resolver::{ResolveOptions, StubResolver};
//!
//! # async fn example() -> Result<(), nimbus_dns_resolver::ResolveError> {
//! let resolver = StubResolver::new();
//! let answers = resolver.resolve("example.com", &ResolveOptions::new()).await?;
//! for answer in answers {
//!     println!("{} {} {:?}", answer.data, answer.record_type, answer.ttl);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod chase;
pub mod codec;
mod conn;
pub mod hosts;
mod multiplex;
mod resolver;

use async_trait::async_trait;

pub use cache::{CacheKey, CacheMetricsSnapshot, CacheStore, MemoryCache};
pub use codec::{DecodedResponse, MessageCodec, WireAnswer, WireCodec};
pub use hosts::{default_hosts_path, HostsTable};
pub use multiplex::AnswerGroups;
pub use resolver::StubResolver;

pub use nimbus_dns_domain::{
    AnswerRecord, NameKind, RecordType, ResolveError, ResolveOptions, ResolverConfig,
    UpstreamEndpoint,
};

/// Object-safe resolver port, so embedders can swap the stub resolver for
/// a test double.
#[async_trait]
pub trait DnsResolve: Send + Sync {
    async fn resolve(
        &self,
        name: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<AnswerRecord>, ResolveError>;

    async fn query(
        &self,
        name: &str,
        record_type: RecordType,
        options: &ResolveOptions,
    ) -> Result<Vec<AnswerRecord>, ResolveError>;
}

#[async_trait]
impl DnsResolve for StubResolver {
    async fn resolve(
        &self,
        name: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<AnswerRecord>, ResolveError> {
        StubResolver::resolve(self, name, options).await
    }

    async fn query(
        &self,
        name: &str,
        record_type: RecordType,
        options: &ResolveOptions,
    ) -> Result<Vec<AnswerRecord>, ResolveError> {
        StubResolver::query(self, name, record_type, options).await
    }
}
