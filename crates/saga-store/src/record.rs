use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaId, SagaStatus, Version};

/// The persisted form of one saga instance.
///
/// `status` and `definition_name` are lifted out of `state` so stores can
/// index them; `state` holds the full serialized instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The saga instance ID.
    pub id: SagaId,

    /// Name of the saga definition the instance follows.
    pub definition_name: String,

    /// Current lifecycle status.
    pub status: SagaStatus,

    /// Optimistic concurrency version. On save this is the version the
    /// caller last read.
    pub version: Version,

    /// Payload the saga was submitted with.
    pub initial_payload: serde_json::Value,

    /// Serialized instance state.
    pub state: serde_json::Value,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last saved.
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Returns true if `other` describes the same submission: same id,
    /// definition and initial payload. Progress fields are not compared.
    pub fn is_same_submission(&self, other: &SagaRecord) -> bool {
        self.id == other.id
            && self.definition_name == other.definition_name
            && self.initial_payload == other.initial_payload
    }
}
