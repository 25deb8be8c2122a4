use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

use super::Store;

/// In-memory implementation of [`Store`]. State is lost on restart, which
/// degrades to "fetch all" on the next cycle.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_last_updated(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let data = self.data.read().expect("store lock");
        Ok(data.get(key).copied())
    }

    async fn set_last_updated(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut data = self.data.write().expect("store lock");
        data.insert(key.to_string(), at);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_missing_key_returns_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get_last_updated("group/app:pipelines").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        store.set_last_updated("group/app:pipelines", at).await.unwrap();
        assert_eq!(
            store.get_last_updated("group/app:pipelines").await.unwrap(),
            Some(at)
        );

        // Keys are independent.
        assert_eq!(
            store.get_last_updated("group/app:merge_requests").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_overwrite_advances_timestamp() {
        let store = MemoryStore::new();
        let first = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        store.set_last_updated("k", first).await.unwrap();
        store.set_last_updated("k", second).await.unwrap();
        assert_eq!(store.get_last_updated("k").await.unwrap(), Some(second));
    }
}
