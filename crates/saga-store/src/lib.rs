//! Storage for saga instances.
//!
//! One [`SagaRecord`] is kept per saga instance, keyed by its id. Every
//! successful [`SagaStore::save`] bumps the record's [`Version`]; a save
//! carrying a stale version is rejected, which is how a second driver of the
//! same instance is detected.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;
pub mod version;

pub use common::{SagaId, SagaStatus};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use record::SagaRecord;
pub use store::{Created, SagaStore};
pub use version::Version;
