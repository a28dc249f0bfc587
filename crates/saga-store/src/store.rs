use async_trait::async_trait;

use crate::{Result, SagaId, SagaRecord, SagaStatus, Version};

/// Result of a successful [`SagaStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    /// The record was inserted at [`Version::first`].
    Inserted,
    /// An identical submission was already stored at this version.
    Existing(Version),
}

impl Created {
    /// The version of the stored record.
    pub fn version(self) -> Version {
        match self {
            Created::Inserted => Version::first(),
            Created::Existing(version) => version,
        }
    }
}

/// Core trait for saga store implementations.
///
/// A store does not coordinate drivers. It only refuses a save whose version
/// is stale, which lets the driver that lost the race notice and back off.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts a new record at [`Version::first`].
    ///
    /// Re-submitting an identical record (same id, definition and initial
    /// payload) leaves the stored record untouched and returns
    /// [`Created::Existing`]. A colliding id with a different submission
    /// fails with `AlreadyExists`.
    async fn create(&self, record: SagaRecord) -> Result<Created>;

    /// Loads a record by id, failing with `NotFound`.
    async fn load(&self, id: SagaId) -> Result<SagaRecord>;

    /// Replaces a record if its stored version equals `record.version`.
    ///
    /// Returns the new version. Fails with `ConcurrencyConflict` on a version
    /// mismatch and `NotFound` if the record does not exist.
    async fn save(&self, record: SagaRecord) -> Result<Version>;

    /// Lists records in the given status, oldest first.
    async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaRecord>>;

    /// Removes a record. Returns true if it existed.
    async fn delete(&self, id: SagaId) -> Result<bool>;
}
