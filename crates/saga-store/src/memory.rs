use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{Created, Result, SagaId, SagaRecord, SagaStatus, SagaStore, StoreError, Version};

/// In-memory saga store for tests and single-process embedding.
///
/// Provides the same semantics as the PostgreSQL implementation. Cloning
/// shares the underlying map.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    records: Arc<RwLock<HashMap<SagaId, SagaRecord>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if no records are stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Overwrites a record without any version check.
    ///
    /// Used by tests to plant a mid-flight instance as if a crashed driver
    /// had left it behind.
    pub async fn put_raw(&self, record: SagaRecord) {
        self.records.write().await.insert(record.id, record);
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, mut record: SagaRecord) -> Result<Created> {
        let mut records = self.records.write().await;

        if let Some(existing) = records.get(&record.id) {
            if existing.is_same_submission(&record) {
                tracing::debug!(saga_id = %record.id, "identical saga re-submitted");
                return Ok(Created::Existing(existing.version));
            }
            return Err(StoreError::AlreadyExists(record.id));
        }

        record.version = Version::first();
        records.insert(record.id, record);
        metrics::counter!("saga_store_creates_total").increment(1);
        Ok(Created::Inserted)
    }

    async fn load(&self, id: SagaId) -> Result<SagaRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, mut record: SagaRecord) -> Result<Version> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;

        if stored.version != record.version {
            metrics::counter!("saga_store_conflicts_total").increment(1);
            return Err(StoreError::ConcurrencyConflict {
                id: record.id,
                expected: record.version,
                actual: stored.version,
            });
        }

        let next = stored.version.next();
        record.version = next;
        record.created_at = stored.created_at;
        record.updated_at = Utc::now();
        *stored = record;
        Ok(next)
    }

    async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn delete(&self, id: SagaId) -> Result<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::record;
    use serde_json::json;

    #[tokio::test]
    async fn create_and_load() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();

        let created = store.create(record(id, json!({"a": 1}))).await.unwrap();
        assert_eq!(created, Created::Inserted);

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.version, Version::first());
        assert_eq!(loaded.initial_payload, json!({"a": 1}));
    }

    #[tokio::test]
    async fn identical_create_is_a_no_op() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store.create(record(id, json!({"a": 1}))).await.unwrap();

        let mut loaded = store.load(id).await.unwrap();
        loaded.status = SagaStatus::Running;
        store.save(loaded).await.unwrap();

        let created = store.create(record(id, json!({"a": 1}))).await.unwrap();
        assert_eq!(created, Created::Existing(Version::new(2)));
        assert_eq!(store.load(id).await.unwrap().status, SagaStatus::Running);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn conflicting_create_fails() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store.create(record(id, json!({"a": 1}))).await.unwrap();

        let result = store.create(record(id, json!({"a": 2}))).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(got)) if got == id));
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        assert!(matches!(store.load(id).await, Err(StoreError::NotFound(got)) if got == id));
    }

    #[tokio::test]
    async fn save_bumps_version() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store.create(record(id, json!({}))).await.unwrap();

        let mut loaded = store.load(id).await.unwrap();
        loaded.status = SagaStatus::Running;
        let v2 = store.save(loaded).await.unwrap();
        assert_eq!(v2, Version::new(2));

        let reloaded = store.load(id).await.unwrap();
        assert_eq!(reloaded.version, v2);
        assert_eq!(reloaded.status, SagaStatus::Running);
        assert!(reloaded.updated_at >= reloaded.created_at);
    }

    #[tokio::test]
    async fn stale_save_is_rejected() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store.create(record(id, json!({}))).await.unwrap();

        let first_driver = store.load(id).await.unwrap();
        let second_driver = store.load(id).await.unwrap();

        store.save(first_driver).await.unwrap();
        let result = store.save(second_driver).await;

        match result {
            Err(StoreError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, Version::first());
                assert_eq!(actual, Version::new(2));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_missing_is_not_found() {
        let store = InMemorySagaStore::new();
        let result = store.save(record(SagaId::new(), json!({}))).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemorySagaStore::new();
        let running = SagaId::new();
        let pending = SagaId::new();
        store.create(record(running, json!({}))).await.unwrap();
        store.create(record(pending, json!({}))).await.unwrap();

        let mut loaded = store.load(running).await.unwrap();
        loaded.status = SagaStatus::Running;
        store.save(loaded).await.unwrap();

        let listed = store.list_by_status(SagaStatus::Running).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, running);

        let listed = store.list_by_status(SagaStatus::Pending).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, pending);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store.create(record(id, json!({}))).await.unwrap();

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.is_empty().await);
    }
}
