//! PostgreSQL implementation of EventLog
//!
//! Production persistence for the event log:
//! - Per-partition append serialization via transaction-scoped advisory locks
//! - Sequencing recovered from `MAX(sequence)`, so it survives restarts
//! - Retention pruning that always keeps the newest event of a partition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use taskfeed_core::{EventKind, TaskEvent, TaskId};

use super::store::{EventLog, EventLogError, RetentionPolicy};

/// PostgreSQL implementation of [`EventLog`]
///
/// Uses a connection pool for concurrent access; appends to different
/// partitions do not contend. Schema lives in `migrations/0001_task_events.sql`.
///
/// # Example
///
/// ```ignore
/// use taskfeed_delivery::log::PostgresEventLog;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/taskfeed").await?;
/// let log = PostgresEventLog::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
    retention: RetentionPolicy,
}

impl PostgresEventLog {
    /// Create a new log over the given connection pool, retaining everything
    pub fn new(pool: PgPool) -> Self {
        Self::with_retention(pool, RetentionPolicy::unbounded())
    }

    /// Create a log with the given retention policy
    pub fn with_retention(pool: PgPool, retention: RetentionPolicy) -> Self {
        Self { pool, retention }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<TaskEvent, EventLogError> {
    let task_id: Uuid = row.get("task_id");
    let sequence: i64 = row.get("sequence");
    let kind: String = row.get("kind");
    let payload: Vec<u8> = row.get("payload");
    let produced_at: DateTime<Utc> = row.get("produced_at");

    Ok(TaskEvent {
        task_id: TaskId::from(task_id),
        sequence: sequence as u64,
        kind: kind
            .parse::<EventKind>()
            .map_err(|e| EventLogError::Storage(e.to_string()))?,
        payload,
        produced_at,
    })
}

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(skip(self, payload), fields(%task_id, %kind))]
    async fn append(
        &self,
        task_id: TaskId,
        kind: EventKind,
        payload: Vec<u8>,
    ) -> Result<u64, EventLogError> {
        let unavailable = |e: sqlx::Error| {
            error!(%task_id, "append failed: {}", e);
            EventLogError::PartitionUnavailable {
                task_id,
                reason: e.to_string(),
            }
        };

        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        // Single writer per partition for the duration of the transaction
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(task_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence), 0) AS head
            FROM task_events
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?;

        let sequence = row.get::<i64, _>("head") as u64 + 1;

        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, sequence, kind, payload, produced_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(sequence as i64)
        .bind(kind.as_str())
        .bind(&payload)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;

        debug!(%task_id, sequence, "appended event");
        Ok(sequence)
    }

    #[instrument(skip(self))]
    async fn read(
        &self,
        task_id: TaskId,
        after: u64,
        max: usize,
    ) -> Result<Vec<TaskEvent>, EventLogError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MIN(sequence), 0) AS floor, COALESCE(MAX(sequence), 0) AS head
            FROM task_events
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EventLogError::Storage(e.to_string()))?;

        let floor = row.get::<i64, _>("floor") as u64;
        let head = row.get::<i64, _>("head") as u64;

        // Pruning always keeps the newest event, so head == 0 means the
        // partition has never seen an append.
        if head == 0 || after >= head {
            return Ok(vec![]);
        }
        if after + 1 < floor {
            return Err(EventLogError::RetentionGap { task_id, floor });
        }

        let rows = sqlx::query(
            r#"
            SELECT task_id, sequence, kind, payload, produced_at
            FROM task_events
            WHERE task_id = $1 AND sequence > $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(after as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventLogError::Storage(e.to_string()))?;

        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self))]
    async fn head(&self, task_id: TaskId) -> Result<u64, EventLogError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence), 0) AS head FROM task_events WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EventLogError::Storage(e.to_string()))?;

        Ok(row.get::<i64, _>("head") as u64)
    }

    async fn partitions(&self) -> Result<Vec<TaskId>, EventLogError> {
        let rows = sqlx::query("SELECT DISTINCT task_id FROM task_events")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| TaskId::from(row.get::<Uuid, _>("task_id")))
            .collect())
    }

    #[instrument(skip(self))]
    async fn prune(&self, task_id: TaskId) -> Result<u64, EventLogError> {
        let storage = |e: sqlx::Error| EventLogError::Storage(e.to_string());
        let mut dropped = 0u64;

        if let Some(max_events) = self.retention.max_events_per_partition {
            let result = sqlx::query(
                r#"
                DELETE FROM task_events
                WHERE task_id = $1
                  AND sequence <= (
                      SELECT MAX(sequence) FROM task_events WHERE task_id = $1
                  ) - $2
                "#,
            )
            .bind(task_id.as_uuid())
            .bind(max_events as i64)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            dropped += result.rows_affected();
        }

        if let Some(max_age) = self.retention.max_age {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
            // Strictly below MAX keeps the newest event so sequencing survives
            let result = sqlx::query(
                r#"
                DELETE FROM task_events
                WHERE task_id = $1
                  AND produced_at < $2
                  AND sequence < (
                      SELECT MAX(sequence) FROM task_events WHERE task_id = $1
                  )
                "#,
            )
            .bind(task_id.as_uuid())
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            dropped += result.rows_affected();
        }

        if dropped > 0 {
            debug!(%task_id, dropped, "pruned partition");
        }
        Ok(dropped)
    }
}
