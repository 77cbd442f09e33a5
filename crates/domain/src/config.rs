use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Recursive server queried when neither the caller nor the config names
/// one.
pub const DEFAULT_SERVER: &str = "8.8.8.8";

pub const DEFAULT_PORT: u16 = 53;

pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// How long a quiescent server connection stays open.
pub const IDLE_TIMEOUT_SECS: u64 = 30;

/// Request ids live in [1, MAX_REQUEST_ID).
pub const MAX_REQUEST_ID: u32 = 65536;

/// Upper bound on CNAME/DNAME hops before the chase gives up.
pub const MAX_CHASE_DEPTH: usize = 30;

/// Embedder-supplied resolver defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverConfig {
    /// Upstream server in `addr`, `addr:port`, or `[v6]:port` form.
    #[serde(default = "default_upstream")]
    pub upstream: String,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the periodic tick sweeps expired cache entries. Expiry is
    /// also checked lazily on every read, so this only bounds memory.
    #[serde(default = "default_cache_sweep")]
    pub cache_sweep_secs: u64,

    /// Overrides the platform default hosts file location.
    #[serde(default)]
    pub hosts_path: Option<PathBuf>,
}

fn default_upstream() -> String {
    format!("{}:{}", DEFAULT_SERVER, DEFAULT_PORT)
}

fn default_idle_timeout() -> u64 {
    IDLE_TIMEOUT_SECS
}

fn default_cache_sweep() -> u64 {
    60
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            idle_timeout_secs: default_idle_timeout(),
            cache_sweep_secs: default_cache_sweep(),
            hosts_path: None,
        }
    }
}
