use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

// bind addresses
// RPC stays on loopback by default; expose it explicitly behind a firewall.
pub const DEFAULT_RPC_BIND_ADDRESS: &str = "127.0.0.1:3002";

// Default sled database path
pub const DEFAULT_DB_PATH: &str = "tally-db";

// Default size for the journal read cache (transactions by id)
pub const DEFAULT_CACHE_SIZE: usize = 1024;

// TTL of the per-transaction pending lock. Chosen to exceed worst-case
// commit latency; an expired lock is equivalent to a released one.
pub const PENDING_LOCK_TTL: Duration = Duration::from_secs(300);

// Default TTL of an idempotency record when the caller does not supply one
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(86_400);

// Upper bound a caller may request for an idempotency TTL
pub const MAX_IDEMPOTENCY_TTL: Duration = Duration::from_secs(7 * 86_400);

// Version-conflict retry bounds. Single-digit attempts with jittered
// exponential backoff, capped so a contended balance cannot stall a request.
pub const CAS_MAX_ATTEMPTS: u32 = 6;
pub const CAS_BACKOFF_BASE: Duration = Duration::from_millis(5);
pub const CAS_BACKOFF_CAP: Duration = Duration::from_millis(200);

// Consumer re-queue backoff bounds (exponential, capped, never spinning)
pub const CONSUMER_BACKOFF_BASE: Duration = Duration::from_millis(50);
pub const CONSUMER_BACKOFF_CAP: Duration = Duration::from_secs(5);

// Queue depth of the in-process dispatch channel
pub const DISPATCH_QUEUE_DEPTH: usize = 1024;

// Cache key prefixes
pub const BALANCE_KEY_PREFIX: &str = "balance";
pub const PENDING_LOCK_KEY_PREFIX: &str = "pending_transaction:transaction";
pub const IDEMPOTENCY_KEY_PREFIX: &str = "idempotency";

/// Tally daemon configuration.
#[derive(Parser, Clone, Debug)]
#[command(name = "tally_daemon", version, about = "Tally transaction service")]
pub struct Config {
    /// Bind address for the HTTP API
    #[arg(long, default_value = DEFAULT_RPC_BIND_ADDRESS)]
    pub rpc_bind_address: String,

    /// Path of the embedded database
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    pub db_path: PathBuf,

    /// Size of the journal read cache
    #[arg(long, default_value_t = DEFAULT_CACHE_SIZE)]
    pub cache_size: usize,

    /// Finalize transactions through the dispatch queue instead of inline
    #[arg(long, default_value_t = false)]
    pub async_dispatch: bool,

    /// Disable the Prometheus metrics exporter
    #[arg(long, default_value_t = false)]
    pub disable_metrics: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_bind_address: DEFAULT_RPC_BIND_ADDRESS.into(),
            db_path: DEFAULT_DB_PATH.into(),
            cache_size: DEFAULT_CACHE_SIZE,
            async_dispatch: false,
            disable_metrics: false,
            log_level: "info".into(),
        }
    }
}
