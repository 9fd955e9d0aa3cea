// NOXRUN Library
// Control plane for sandboxed code execution.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod executions;
pub mod ids;
pub mod lifecycle;
pub mod metrics;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;
pub mod security;
pub mod sessions;
pub mod storage;
pub mod warm_pool;

// Re-export commonly used types
pub use error::{ApiError, ErrorCode};
pub use tracing::{debug, error, info, warn};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_TIME: &str = include_str!(concat!(env!("OUT_DIR"), "/build_time.txt"));
