//! Vantage cache: per-resource informers backed by on-disk indexed tables,
//! deduplicated and owned by a factory.

#![forbid(unsafe_code)]

use thiserror::Error;
use vantage_client::ClientError;

pub mod factory;
pub mod informer;
pub mod store;

pub use factory::{Cache, CacheFactory};
pub use informer::{ChangeEvent, ChangeKind, Informer, InformerState, Transform, WatchOptions};
pub use store::IndexedStore;

#[derive(Debug, Error)]
pub enum CacheError {
    /// A filter or sort names a path that is not indexed for the kind.
    #[error("column is invalid [{0}]: supplied column is not in the table")]
    InvalidColumn(String),
    #[error("invalid continue token: {0}")]
    InvalidContinueToken(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("cache construction failed: {0}")]
    Construction(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("encode: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("internal: {0}")]
    Internal(String),
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
}

/// Upper bound on one upstream watch connection before it is refreshed.
pub fn watch_timeout_secs() -> u32 {
    env_u64("CATTLE_WATCH_TIMEOUT_SECONDS", 1800) as u32
}

/// Page size for hydration lists.
pub fn page_limit() -> u32 {
    env_u64("VANTAGE_PAGE_LIMIT", 500) as u32
}

/// Depth of the per-informer event replay ring.
pub fn watch_buffer() -> usize {
    env_u64("VANTAGE_WATCH_BUFFER", 1024) as usize
}

/// Cap for exponential backoff after watch errors.
pub fn backoff_max_secs() -> u64 {
    env_u64("VANTAGE_WATCH_BACKOFF_MAX_SECS", 30)
}

/// Relist interval for kinds upstream cannot watch.
pub fn relist_secs() -> u64 {
    env_u64("VANTAGE_RELIST_SECS", 300)
}

/// Parse a Kubernetes resource version for ordering. Resource versions are
/// opaque strings on the wire but compare as etcd revisions in practice;
/// anything non-numeric sorts first.
pub fn parse_rv(rv: &str) -> u64 {
    rv.parse::<u64>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rv_parsing_tolerates_garbage() {
        assert_eq!(parse_rv("3319"), 3319);
        assert_eq!(parse_rv(""), 0);
        assert_eq!(parse_rv("not-a-number"), 0);
    }
}
