use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::error::{EventStoreError, Result};
use crate::event::{Event, EventId, EventPayload, Version};
use crate::store::{
    AggregateEventStore, AggregateInspector, AggregateSlice, AggregateStreamRequest, CursorPage,
    EventStore, EventStream, StreamOptions, TypedEventStore, validate_events_for_append,
};

const EVENT_COLUMNS: &str =
    "id, event_type, aggregate_id, aggregate_type, version, schema_version, timestamp, payload, metadata";

/// A fully marshalled event row, prepared before the transaction opens so no
/// serialization work happens while the transaction is held.
struct EventRow {
    id: String,
    event_type: String,
    aggregate_id: i64,
    aggregate_type: String,
    version: i64,
    schema_version: i32,
    timestamp: DateTime<Utc>,
    payload: serde_json::Value,
    metadata: serde_json::Value,
}

impl EventRow {
    fn prepare(event: &Event<i64>) -> Result<Self> {
        Ok(Self {
            id: event.event_id.to_string(),
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type.clone(),
            version: event.version.as_u64() as i64,
            schema_version: event.schema_version as i32,
            timestamp: event.timestamp,
            payload: event.payload.to_json()?,
            metadata: serde_json::to_value(&event.metadata)?,
        })
    }
}

/// PostgreSQL-backed event store, concrete over `i64` aggregate keys.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_event(row: PgRow) -> Result<Event<i64>> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(Event {
            event_id: EventId::new(row.try_get::<String, _>("id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get::<i64, _>("version")? as u64),
            schema_version: row.try_get::<i32, _>("schema_version")? as u32,
            timestamp: row.try_get("timestamp")?,
            payload: EventPayload::Json(row.try_get("payload")?),
            metadata,
        })
    }

    async fn current_version(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        aggregate_id: i64,
        aggregate_type: &str,
    ) -> Result<Version> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM events WHERE aggregate_id = $1 AND aggregate_type = $2",
        )
        .bind(aggregate_id)
        .bind(aggregate_type)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Version::new(version.unwrap_or(0) as u64))
    }

    /// Whether the batch is an exact replay of rows already committed.
    async fn is_replayed_batch(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        rows: &[EventRow],
    ) -> Result<bool> {
        let first = &rows[0];
        let stored: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT version, id FROM events
            WHERE aggregate_id = $1 AND aggregate_type = $2 AND version BETWEEN $3 AND $4
            ORDER BY version ASC
            "#,
        )
        .bind(first.aggregate_id)
        .bind(&first.aggregate_type)
        .bind(first.version)
        .bind(rows[rows.len() - 1].version)
        .fetch_all(&mut **tx)
        .await?;

        if stored.len() != rows.len() {
            return Ok(false);
        }
        Ok(rows
            .iter()
            .zip(stored.iter())
            .all(|(row, (version, id))| row.version == *version && row.id == *id))
    }

    /// Per-row fallback after a duplicate-key failure: distinguishes an
    /// idempotent retry (same id in the same slot) from a real collision.
    async fn insert_rows_individually(&self, rows: &[EventRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let inserted = sqlx::query(
                r#"
                INSERT INTO events (id, event_type, aggregate_id, aggregate_type, version, schema_version, timestamp, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&row.id)
            .bind(&row.event_type)
            .bind(row.aggregate_id)
            .bind(&row.aggregate_type)
            .bind(row.version)
            .bind(row.schema_version)
            .bind(row.timestamp)
            .bind(&row.payload)
            .bind(&row.metadata)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 1 {
                continue;
            }

            // The row conflicted; find out with what.
            let by_id: Option<(i64, i64)> = sqlx::query_as(
                "SELECT aggregate_id, version FROM events WHERE id = $1",
            )
            .bind(&row.id)
            .fetch_optional(&mut *tx)
            .await?;

            match by_id {
                Some((aggregate_id, version))
                    if aggregate_id == row.aggregate_id && version == row.version =>
                {
                    // Identical event already committed: idempotent retry.
                    continue;
                }
                Some((aggregate_id, version)) => {
                    return Err(EventStoreError::EventAlreadyExists {
                        event_id: row.id.clone(),
                        aggregate_id: aggregate_id.to_string(),
                        version: Version::new(version as u64),
                    });
                }
                None => {
                    // The version slot is taken by a different event.
                    return Err(EventStoreError::EventAlreadyExists {
                        event_id: row.id.clone(),
                        aggregate_id: row.aggregate_id.to_string(),
                        version: Version::new(row.version as u64),
                    });
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_cursor_position(
        &self,
        cursor: &EventId,
    ) -> Result<(DateTime<Utc>, String)> {
        let row: Option<(DateTime<Utc>, String)> =
            sqlx::query_as("SELECT timestamp, id FROM events WHERE id = $1")
                .bind(cursor.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| EventStoreError::UnknownCursor(cursor.to_string()))
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_err)
            if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[async_trait]
impl EventStore<i64> for PostgresEventStore {
    async fn append_events(
        &self,
        aggregate_id: &i64,
        events: Vec<Event<i64>>,
        expected_version: Version,
    ) -> Result<Version> {
        // Validation and marshalling run before the transaction opens.
        validate_events_for_append(aggregate_id, &events, expected_version)?;
        let rows: Vec<EventRow> = events.iter().map(EventRow::prepare).collect::<Result<_>>()?;
        let aggregate_type = rows[0].aggregate_type.clone();
        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(expected_version);

        let mut tx = self.pool.begin().await?;

        let actual = Self::current_version(&mut tx, *aggregate_id, &aggregate_type).await?;
        if actual != expected_version {
            if Self::is_replayed_batch(&mut tx, &rows).await? {
                return Ok(actual);
            }
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let bulk = sqlx::query(
            r#"
            INSERT INTO events (id, event_type, aggregate_id, aggregate_type, version, schema_version, timestamp, payload, metadata)
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::bigint[], $4::text[], $5::bigint[],
                $6::integer[], $7::timestamptz[], $8::jsonb[], $9::jsonb[]
            )
            "#,
        )
        .bind(rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.event_type.clone()).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.aggregate_id).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.aggregate_type.clone()).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.version).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.schema_version).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.timestamp).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.payload.clone()).collect::<Vec<_>>())
        .bind(rows.iter().map(|r| r.metadata.clone()).collect::<Vec<_>>())
        .execute(&mut *tx)
        .await;

        match bulk {
            Ok(_) => {
                tx.commit().await?;
            }
            Err(e) if is_unique_violation(&e) => {
                // A concurrent writer slipped in between the version check and
                // the bulk insert, or the batch is a partial retry. Retry row
                // by row to tell idempotent retries from real collisions.
                tx.rollback().await?;
                self.insert_rows_individually(&rows).await?;
            }
            Err(e) => return Err(EventStoreError::Database(e)),
        }

        metrics::counter!("events_saved").increment(rows.len() as u64);
        Ok(last_version)
    }

    async fn load_events(
        &self,
        aggregate_id: &i64,
        after_version: Version,
    ) -> Result<Vec<Event<i64>>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events
            WHERE aggregate_id = $1 AND version > $2
            ORDER BY version ASC
            "#
        ))
        .bind(aggregate_id)
        .bind(after_version.as_u64() as i64)
        .fetch_all(&self.pool)
        .await?;

        metrics::counter!("events_loaded").increment(rows.len() as u64);
        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn stream_events(&self, from_time: DateTime<Utc>) -> Result<EventStream<i64>> {
        use futures_util::StreamExt;

        const SQL: &str = "SELECT id, event_type, aggregate_id, aggregate_type, version, schema_version, timestamp, payload, metadata FROM events WHERE timestamp >= $1 ORDER BY timestamp ASC, id ASC";

        let stream = sqlx::query(SQL)
            .bind(from_time)
            .fetch(&self.pool)
            .map(|result| match result {
                Ok(row) => Self::row_to_event(row),
                Err(e) => Err(EventStoreError::Database(e)),
            });

        Ok(Box::pin(stream))
    }

    async fn stream_with_cursor(&self, options: StreamOptions) -> Result<CursorPage<i64>> {
        let cursor = match &options.after {
            Some(after) => Some(self.fetch_cursor_position(after).await?),
            None => None,
        };

        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1=1");
        let mut param_count = 0;

        if cursor.is_some() {
            sql.push_str(&format!(
                " AND (timestamp, id) > (${}, ${})",
                param_count + 1,
                param_count + 2
            ));
            param_count += 2;
        }
        if !options.event_types.is_empty() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if !options.aggregate_types.is_empty() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_type = ANY(${param_count})"));
        }
        if options.from_time.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp >= ${param_count}"));
        }
        if options.to_time.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp <= ${param_count}"));
        }

        let limit = options.effective_limit();
        param_count += 1;
        sql.push_str(&format!(" ORDER BY timestamp ASC, id ASC LIMIT ${param_count}"));

        let mut query = sqlx::query(&sql);
        if let Some((timestamp, id)) = &cursor {
            query = query.bind(*timestamp).bind(id.clone());
        }
        if !options.event_types.is_empty() {
            query = query.bind(options.event_types.clone());
        }
        if !options.aggregate_types.is_empty() {
            query = query.bind(options.aggregate_types.clone());
        }
        if let Some(from) = options.from_time {
            query = query.bind(from);
        }
        if let Some(to) = options.to_time {
            query = query.bind(to);
        }
        // Fetch one extra row to learn whether more pages exist.
        query = query.bind((limit + 1) as i64);

        let rows = query.fetch_all(&self.pool).await?;
        let has_more = rows.len() > limit;

        let events = rows
            .into_iter()
            .take(limit)
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>>>()?;

        let next_cursor = events.last().map(|e| e.event_id.clone());
        Ok(CursorPage {
            events,
            next_cursor,
            has_more,
        })
    }
}

#[async_trait]
impl AggregateInspector<i64> for PostgresEventStore {
    async fn aggregate_version(&self, aggregate_id: &i64) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(|v| Version::new(v as u64)))
    }
}

#[async_trait]
impl TypedEventStore<i64> for PostgresEventStore {
    async fn load_events_by_type(&self, event_type: &str) -> Result<Vec<Event<i64>>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events
            WHERE event_type = $1
            ORDER BY timestamp ASC, id ASC
            "#
        ))
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl AggregateEventStore<i64> for PostgresEventStore {
    async fn stream_aggregate(
        &self,
        request: AggregateStreamRequest<i64>,
    ) -> Result<AggregateSlice<i64>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events
            WHERE aggregate_id = $1 AND aggregate_type = $2 AND version > $3
            ORDER BY version ASC
            LIMIT $4
            "#
        ))
        .bind(request.aggregate_id)
        .bind(&request.aggregate_type)
        .bind(request.after_version.as_u64() as i64)
        .bind((request.limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM events WHERE aggregate_id = $1 AND aggregate_type = $2)",
            )
            .bind(request.aggregate_id)
            .bind(&request.aggregate_type)
            .fetch_one(&self.pool)
            .await?;

            if !exists {
                return Err(EventStoreError::AggregateNotFound(
                    request.aggregate_id.to_string(),
                ));
            }
        }

        let has_more = rows.len() > request.limit;
        let events = rows
            .into_iter()
            .take(request.limit)
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>>>()?;

        let next_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(request.after_version);
        Ok(AggregateSlice {
            events,
            next_version,
            has_more,
        })
    }
}
