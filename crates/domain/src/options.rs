use crate::dns_record::RecordType;

/// Per-call options for `resolve` and `query`. All fields are optional;
/// the builder-style setters cover the common cases.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Upstream in `addr`, `addr:port`, or `[v6]:port` form.
    pub server: Option<String>,

    /// Overall per-call timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Skip the hosts file.
    pub no_hosts: bool,

    /// Force a hosts re-read on this call.
    pub reload_hosts: bool,

    /// Skip cache reads. Responses are still written to the cache.
    pub no_cache: bool,

    /// Record types for `resolve`; defaults to [A, AAAA].
    pub types: Option<Vec<RecordType>>,

    /// Follow CNAME/DNAME chains in `query`.
    pub recurse: bool,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn no_hosts(mut self) -> Self {
        self.no_hosts = true;
        self
    }

    pub fn reload_hosts(mut self) -> Self {
        self.reload_hosts = true;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn types(mut self, types: Vec<RecordType>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn recurse(mut self) -> Self {
        self.recurse = true;
        self
    }
}
