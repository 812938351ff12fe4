use crate::domain::ports::ReaderIdentityStore;
use crate::domain::reader::ReaderIdentity;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory slot for the last connected reader.
///
/// Clones share the slot, so a test can hand one clone to the controller and
/// inspect the other.
#[derive(Debug, Default, Clone)]
pub struct InMemoryReaderStore {
    reader: Arc<RwLock<Option<ReaderIdentity>>>,
}

impl InMemoryReaderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReaderIdentityStore for InMemoryReaderStore {
    async fn remember(&self, reader: &ReaderIdentity) -> Result<()> {
        *self.reader.write().await = Some(reader.clone());
        Ok(())
    }

    async fn recall(&self) -> Result<Option<ReaderIdentity>> {
        Ok(self.reader.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_reader_store() {
        let store = InMemoryReaderStore::new();
        assert!(store.recall().await.unwrap().is_none());

        store.remember(&ReaderIdentity::new("SIM-0001")).await.unwrap();
        store
            .remember(&ReaderIdentity::labelled("SIM-0002", "Front desk"))
            .await
            .unwrap();

        let recalled = store.recall().await.unwrap().unwrap();
        assert_eq!(recalled.serial, "SIM-0002");
        assert_eq!(recalled.label.as_deref(), Some("Front desk"));
    }

    #[tokio::test]
    async fn test_clones_share_the_slot() {
        let store = InMemoryReaderStore::new();
        let view = store.clone();
        store.remember(&ReaderIdentity::new("SIM-0003")).await.unwrap();
        assert_eq!(view.recall().await.unwrap(), Some(ReaderIdentity::new("SIM-0003")));
    }
}
