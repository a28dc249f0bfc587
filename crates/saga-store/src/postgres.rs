use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{Created, Result, SagaId, SagaRecord, SagaStatus, SagaStore, StoreError, Version};

const SELECT_COLUMNS: &str =
    "SELECT id, definition_name, status, version, initial_payload, state, created_at, updated_at FROM saga_instances";

/// PostgreSQL-backed saga store implementation.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        let id = SagaId::from_uuid(row.try_get::<Uuid, _>("id")?);
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<SagaStatus>()
            .map_err(|e| StoreError::Corrupt {
                id,
                reason: e.to_string(),
            })?;

        Ok(SagaRecord {
            id,
            definition_name: row.try_get("definition_name")?,
            status,
            version: Version::new(row.try_get("version")?),
            initial_payload: row.try_get("initial_payload")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_record).transpose()
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn create(&self, record: SagaRecord) -> Result<Created> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO saga_instances (id, definition_name, status, version, initial_payload, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.definition_name)
        .bind(record.status.as_str())
        .bind(Version::first().as_i64())
        .bind(&record.initial_payload)
        .bind(&record.state)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            metrics::counter!("saga_store_creates_total").increment(1);
            return Ok(Created::Inserted);
        }

        // The id is taken; decide whether this is a re-submission.
        let existing = self
            .fetch(record.id)
            .await?
            .ok_or(StoreError::NotFound(record.id))?;
        if existing.is_same_submission(&record) {
            tracing::debug!(saga_id = %record.id, "identical saga re-submitted");
            Ok(Created::Existing(existing.version))
        } else {
            Err(StoreError::AlreadyExists(record.id))
        }
    }

    async fn load(&self, id: SagaId) -> Result<SagaRecord> {
        self.fetch(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, record: SagaRecord) -> Result<Version> {
        let next = record.version.next();

        let updated = sqlx::query(
            r#"
            UPDATE saga_instances
            SET status = $3, version = $4, state = $5, updated_at = $6
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.version.as_i64())
        .bind(record.status.as_str())
        .bind(next.as_i64())
        .bind(&record.state)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(next);
        }

        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE id = $1")
                .bind(record.id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        match actual {
            Some(actual) => {
                metrics::counter!("saga_store_conflicts_total").increment(1);
                Err(StoreError::ConcurrencyConflict {
                    id: record.id,
                    expected: record.version,
                    actual: Version::new(actual),
                })
            }
            None => Err(StoreError::NotFound(record.id)),
        }
    }

    async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn delete(&self, id: SagaId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM saga_instances WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }
}
