//! PostgreSQL-backed checkpoint store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use event_store::EventId;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::CheckpointError;

const UPSERT_CHECKPOINT: &str = r#"
    INSERT INTO checkpoints (projection_name, "position", last_event_id, last_event_time, updated_at)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (projection_name) DO UPDATE SET
        "position" = EXCLUDED."position",
        last_event_id = EXCLUDED.last_event_id,
        last_event_time = EXCLUDED.last_event_time,
        updated_at = EXCLUDED.updated_at
"#;

/// Durable checkpoint store over the `checkpoints` table.
///
/// Concurrent saves of the same projection serialize on the primary key;
/// the last write wins.
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Creates a new PostgreSQL checkpoint store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_checkpoint(row: PgRow) -> Result<Checkpoint, CheckpointError> {
        Ok(Checkpoint {
            projection_name: row.try_get("projection_name")?,
            position: row.try_get::<i64, _>("position")? as u64,
            last_event_id: row
                .try_get::<Option<String>, _>("last_event_id")?
                .map(EventId::new),
            last_event_time: row.try_get::<Option<DateTime<Utc>>, _>("last_event_time")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, projection_name: &str) -> Result<Checkpoint, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT projection_name, "position", last_event_id, last_event_time, updated_at
            FROM checkpoints
            WHERE projection_name = $1
            "#,
        )
        .bind(projection_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_checkpoint(row),
            None => Err(CheckpointError::NotFound(projection_name.to_string())),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.validate()?;

        sqlx::query(UPSERT_CHECKPOINT)
            .bind(&checkpoint.projection_name)
            .bind(checkpoint.position as i64)
            .bind(checkpoint.last_event_id.as_ref().map(|id| id.to_string()))
            .bind(checkpoint.last_event_time)
            .bind(checkpoint.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn save_batch(&self, checkpoints: &[Checkpoint]) -> Result<(), CheckpointError> {
        for checkpoint in checkpoints {
            checkpoint.validate()?;
        }

        let mut tx = self.pool.begin().await?;
        for checkpoint in checkpoints {
            sqlx::query(UPSERT_CHECKPOINT)
                .bind(&checkpoint.projection_name)
                .bind(checkpoint.position as i64)
                .bind(checkpoint.last_event_id.as_ref().map(|id| id.to_string()))
                .bind(checkpoint.last_event_time)
                .bind(checkpoint.updated_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn delete(&self, projection_name: &str) -> Result<(), CheckpointError> {
        // A missing row is not an error.
        sqlx::query("DELETE FROM checkpoints WHERE projection_name = $1")
            .bind(projection_name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
