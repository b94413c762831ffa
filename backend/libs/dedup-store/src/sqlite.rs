//! SQLite implementation of [`EventStore`]

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{is_unique_violation, StoreError, StoreResult};
use crate::{
    validate_event, Counter, Counters, Event, EventStore, InsertOutcome, ProcessedEvent,
};

/// Connection settings for [`SqliteEventStore::open`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum number of pooled connections
    pub max_connections: u32,
    /// How long a writer waits for the database file lock before failing
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// SQLite-backed dedup store.
///
/// Thread-safe: share it across tasks with `Arc<SqliteEventStore>`.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Open (creating if missing) the database file at `path` and apply migrations.
    ///
    /// Re-opening an existing file is a plain startup: migrations are idempotent
    /// and counters keep their persisted values.
    pub async fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening dedup store");

        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    async fn increment(&self, counter: Counter, by: i64) -> StoreResult<()> {
        sqlx::query("UPDATE statistics SET value = value + ? WHERE stat_name = ?")
            .bind(by)
            .bind(counter.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to increment {}", counter.as_str()))?;

        Ok(())
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn try_insert(&self, event: &Event) -> StoreResult<InsertOutcome> {
        validate_event(event)?;

        let payload = serde_json::to_string(&event.payload)?;
        let now = Self::now_ms();

        let mut tx = self.pool.begin().await?;

        // The primary key on dedup_keys is the only duplicate check.
        let claimed = sqlx::query(
            r#"
            INSERT INTO dedup_keys (event_id, topic, processed_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.topic)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match claimed {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                self.increment(Counter::DuplicateDropped, 1).await?;

                debug!(
                    event_id = %event.event_id,
                    topic = %event.topic,
                    "Dedup key already present"
                );
                return Ok(InsertOutcome::Duplicate);
            }
            Err(e) => return Err(StoreError::Database(e)),
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO processed_events
                (event_id, topic, timestamp, source, payload, processed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.topic)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(&payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to persist processed event")?;

        sqlx::query("UPDATE statistics SET value = value + 1 WHERE stat_name = ?")
            .bind(Counter::UniqueProcessed.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to increment unique_processed_total")?;

        tx.commit().await?;

        debug!(
            event_id = %event.event_id,
            topic = %event.topic,
            "Event recorded"
        );

        Ok(InsertOutcome::New)
    }

    async fn record_failure(&self) -> StoreResult<()> {
        self.increment(Counter::ProcessingFailed, 1).await
    }

    async fn add_received(&self, count: u64) -> StoreResult<()> {
        if count == 0 {
            return Ok(());
        }

        let count = i64::try_from(count)
            .map_err(|_| StoreError::Other(anyhow!("received count out of range: {}", count)))?;
        self.increment(Counter::Received, count).await
    }

    async fn list_events(
        &self,
        topic: Option<&str>,
        limit: u32,
    ) -> StoreResult<Vec<ProcessedEvent>> {
        let query = match topic {
            Some(topic) => sqlx::query(
                r#"
                SELECT topic, event_id, timestamp, source, payload, processed_at
                FROM processed_events
                WHERE topic = ?
                ORDER BY processed_at DESC, rowid DESC
                LIMIT ?
                "#,
            )
            .bind(topic),
            None => sqlx::query(
                r#"
                SELECT topic, event_id, timestamp, source, payload, processed_at
                FROM processed_events
                ORDER BY processed_at DESC, rowid DESC
                LIMIT ?
                "#,
            ),
        };

        let rows = query
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch processed events")?;

        let events = rows
            .iter()
            .map(processed_event_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        debug!(count = events.len(), topic = ?topic, "Fetched processed events");

        Ok(events)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Dedup store closed");
    }

    async fn counters(&self) -> StoreResult<Counters> {
        // Both reads share one transaction so they see the same snapshot.
        let mut tx = self.pool.begin().await?;

        let stat_rows = sqlx::query("SELECT stat_name, value FROM statistics")
            .fetch_all(&mut *tx)
            .await
            .context("Failed to read statistics")?;

        let topic_rows = sqlx::query(
            r#"
            SELECT topic, COUNT(*) AS count
            FROM processed_events
            GROUP BY topic
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to count events per topic")?;

        tx.commit().await?;

        let mut counters = Counters::default();
        for row in stat_rows {
            let name: String = row.try_get("stat_name")?;
            let value: i64 = row.try_get("value")?;
            match name.as_str() {
                "received_total" => counters.received_total = value,
                "unique_processed_total" => counters.unique_processed_total = value,
                "duplicate_dropped_total" => counters.duplicate_dropped_total = value,
                "processing_failed_total" => counters.processing_failed_total = value,
                other => debug!(stat_name = %other, "Ignoring unknown statistic"),
            }
        }

        for row in topic_rows {
            counters
                .topics
                .insert(row.try_get("topic")?, row.try_get("count")?);
        }

        Ok(counters)
    }
}

fn processed_event_from_row(row: &SqliteRow) -> StoreResult<ProcessedEvent> {
    let payload: String = row.try_get("payload")?;
    let processed_at_ms: i64 = row.try_get("processed_at")?;
    let processed_at = DateTime::<Utc>::from_timestamp_millis(processed_at_ms)
        .ok_or_else(|| anyhow!("processed_at out of range: {}", processed_at_ms))?;

    Ok(ProcessedEvent {
        topic: row.try_get("topic")?,
        event_id: row.try_get("event_id")?,
        timestamp: row.try_get("timestamp")?,
        source: row.try_get("source")?,
        payload: serde_json::from_str(&payload)?,
        processed_at,
    })
}
