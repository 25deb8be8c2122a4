//! Storage abstractions for exporter state: per-key last-updated timestamps
//! used for incremental fetches and cross-replica coordination.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Interface for persisting exporter state. Keys are
/// `<project>:<collector>` pairs; the redis implementation prepends its own
/// namespace prefix.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the last-updated timestamp for a key, or `None` when the key
    /// is missing (callers treat that as "fetch all").
    async fn get_last_updated(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Records the last-updated timestamp for a key.
    async fn set_last_updated(&self, key: &str, at: DateTime<Utc>) -> Result<()>;

    /// Releases any resources held by the store.
    async fn close(&self) -> Result<()>;
}

/// Builds the store key for a project and collector pair.
pub fn last_updated_key(project: &str, collector: &str) -> String {
    format!("{project}:{collector}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_updated_key_format() {
        assert_eq!(
            last_updated_key("group/app", "pipelines"),
            "group/app:pipelines"
        );
    }
}
