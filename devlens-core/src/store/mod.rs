//! Durable persistence and query of events and derived state.
//!
//! Single-file embedded SQLite database. All writes serialize through a
//! one-connection writer pool; reads go through a small reader pool.
//! Migrations are versioned under `migrations/` and applied at open.

mod rows;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use devlens_model::{
    ActivityEntry, Event, EventCategory, EventSeverity, MetricPoint,
    StageTransition,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::QueryBuilder;
use tracing::{debug, warn};

use crate::error::{Result, TelemetryError};
use crate::sink::SystemEventSink;

use rows::{activity_from_row, event_from_row, transition_from_row, ts_from_ms};

/// How often (in appends) the byte budget is re-checked against the file.
const CAPACITY_CHECK_INTERVAL: u64 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StoreConfig {
    /// DB file location.
    pub path: PathBuf,
    /// Prune threshold for `prune_expired` and budget reclamation.
    pub retention_days: u32,
    /// Byte budget for the database file; `None` disables the check.
    pub max_bytes: Option<u64>,
    pub reader_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("devlens.db"),
            retention_days: 30,
            max_bytes: None,
            reader_connections: 4,
        }
    }
}

/// Subset filter for range queries. Empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub categories: Vec<EventCategory>,
    pub severities: Vec<EventSeverity>,
    pub types: Vec<String>,
    pub sources: Vec<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: u64,
    pub per_category: HashMap<EventCategory, u64>,
    pub per_severity: HashMap<EventSeverity, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// The single writer-exclusive resource of the event plane.
pub struct EventStore {
    writer: SqlitePool,
    reader: SqlitePool,
    config: StoreConfig,
    degraded: AtomicBool,
    appended: AtomicU64,
    write_failures: AtomicU64,
    sink: std::sync::OnceLock<Arc<dyn SystemEventSink>>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.config.path)
            .field("degraded", &self.degraded.load(Ordering::Relaxed))
            .field("appended", &self.appended.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventStore {
    /// Open (creating if missing) and migrate the database.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        crate::MIGRATOR.run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(config.reader_connections.max(1))
            .connect_with(options)
            .await?;

        debug!(path = %config.path.display(), "event store opened");
        Ok(Self {
            writer,
            reader,
            config,
            degraded: AtomicBool::new(false),
            appended: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            sink: std::sync::OnceLock::new(),
        })
    }

    /// Wire the bus-facing sink used for `system:storage_degraded` warnings.
    pub fn set_event_sink(&self, sink: Arc<dyn SystemEventSink>) {
        let _ = self.sink.set(sink);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Persist one event. Exactly-once per id: a second append of the same
    /// id is a conflict surfaced as a database error.
    pub async fn append(&self, event: &Event) -> Result<()> {
        self.append_batch(std::slice::from_ref(event)).await
    }

    /// Persist a batch in one transaction.
    pub async fn append_batch(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.check_capacity(events.len() as u64).await?;

        let result = self.append_batch_inner(events).await;
        match result {
            Ok(()) => {
                self.degraded.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                self.mark_degraded(&err);
                Err(err)
            }
        }
    }

    async fn append_batch_inner(&self, events: &[Event]) -> Result<()> {
        let mut tx = self.writer.begin().await?;
        for event in events {
            let metadata = event
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            sqlx::query(
                "INSERT INTO events \
                 (id, type, category, severity, timestamp, source, data, \
                  metadata, correlation_id, parent_event_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.id.to_string())
            .bind(&event.event_type)
            .bind(event.category.as_str())
            .bind(event.severity.as_str())
            .bind(event.timestamp_ms())
            .bind(&event.source)
            .bind(event.data.to_string())
            .bind(metadata)
            .bind(event.correlation_id().map(|id| id.to_string()))
            .bind(event.parent_event_id().map(|id| id.to_string()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.appended
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn find_by_id(
        &self,
        id: devlens_model::EventId,
    ) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.reader)
            .await;
        match row {
            Ok(Some(row)) => Ok(Some(event_from_row(&row)?)),
            Ok(None) => Ok(None),
            Err(err) => {
                self.report_read_failure("find_by_id", &err);
                Ok(None)
            }
        }
    }

    /// Range query ordered by timestamp ascending. Read failures degrade to
    /// an empty result with a `system:storage_degraded` warning.
    pub async fn find_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &EventFilter,
    ) -> Result<Vec<Event>> {
        let mut qb: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM events WHERE timestamp >= ");
        qb.push_bind(start.timestamp_millis());
        qb.push(" AND timestamp <= ");
        qb.push_bind(end.timestamp_millis());
        push_in_clause(&mut qb, "category", filter.categories.iter().map(|c| c.as_str()));
        push_in_clause(&mut qb, "severity", filter.severities.iter().map(|s| s.as_str()));
        push_in_clause(&mut qb, "type", filter.types.iter().map(String::as_str));
        push_in_clause(&mut qb, "source", filter.sources.iter().map(String::as_str));
        qb.push(" ORDER BY timestamp ASC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        match qb.build().fetch_all(&self.reader).await {
            Ok(rows) => rows.iter().map(event_from_row).collect(),
            Err(err) => {
                self.report_read_failure("find_by_time_range", &err);
                Ok(Vec::new())
            }
        }
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT category, COUNT(*) FROM events GROUP BY category",
        )
        .fetch_all(&self.reader)
        .await;
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                self.report_read_failure("stats", &err);
                return Ok(stats);
            }
        };
        for (category, count) in rows {
            if let Some(category) = EventCategory::parse(&category) {
                stats.per_category.insert(category, count as u64);
                stats.total += count as u64;
            }
        }
        let severities = sqlx::query_as::<_, (String, i64)>(
            "SELECT severity, COUNT(*) FROM events GROUP BY severity",
        )
        .fetch_all(&self.reader)
        .await
        .unwrap_or_default();
        for (severity, count) in severities {
            if let Some(severity) = EventSeverity::parse(&severity) {
                stats.per_severity.insert(severity, count as u64);
            }
        }
        if let Ok(Some((first, last))) = sqlx::query_as::<_, (Option<i64>, Option<i64>)>(
            "SELECT MIN(timestamp), MAX(timestamp) FROM events",
        )
        .fetch_optional(&self.reader)
        .await
        {
            stats.first_timestamp = first.and_then(|ms| ts_from_ms(ms).ok());
            stats.last_timestamp = last.and_then(|ms| ts_from_ms(ms).ok());
        }
        Ok(stats)
    }

    /// Delete events (and derived rows) older than the cutoff.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let cutoff = older_than.timestamp_millis();
        let removed = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.writer)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM activities WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.writer)
            .await?;
        sqlx::query("DELETE FROM metrics WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.writer)
            .await?;
        if removed > 0 {
            debug!(removed, "pruned events older than cutoff");
        }
        Ok(removed)
    }

    pub async fn prune_expired(&self) -> Result<u64> {
        let cutoff =
            Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        self.prune(cutoff).await
    }

    /// Snapshot the database to `destination`. Safe to run concurrently with
    /// appends; uses SQLite's `VACUUM INTO`.
    pub async fn backup(&self, destination: &Path) -> Result<()> {
        let dest = destination.to_string_lossy().into_owned();
        sqlx::query("VACUUM INTO ?")
            .bind(dest)
            .execute(&self.reader)
            .await?;
        Ok(())
    }

    // --- derived state ---

    pub async fn record_activity(&self, entry: &ActivityEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO activities (id, event_id, category, severity, summary, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.event_id.to_string())
        .bind(entry.category.as_str())
        .bind(entry.severity.as_str())
        .bind(&entry.summary)
        .bind(entry.at.timestamp_millis())
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn recent_activities(
        &self,
        limit: u32,
        category: Option<EventCategory>,
    ) -> Result<Vec<ActivityEntry>> {
        let mut qb: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM activities");
        if let Some(category) = category {
            qb.push(" WHERE category = ");
            qb.push_bind(category.as_str());
        }
        qb.push(" ORDER BY timestamp DESC LIMIT ");
        qb.push_bind(limit as i64);
        match qb.build().fetch_all(&self.reader).await {
            Ok(rows) => rows.iter().map(activity_from_row).collect(),
            Err(err) => {
                self.report_read_failure("recent_activities", &err);
                Ok(Vec::new())
            }
        }
    }

    pub async fn record_stage_transition(
        &self,
        transition: &StageTransition,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO stage_transitions \
             (from_stage, to_stage, confidence, reason, timestamp) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(transition.from.map(|s| s.as_str()))
        .bind(transition.to.as_str())
        .bind(transition.confidence)
        .bind(&transition.reason)
        .bind(transition.at.timestamp_millis())
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn recent_stage_transitions(
        &self,
        limit: u32,
    ) -> Result<Vec<StageTransition>> {
        let rows = sqlx::query(
            "SELECT * FROM stage_transitions ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.reader)
        .await;
        match rows {
            Ok(rows) => rows.iter().map(transition_from_row).collect(),
            Err(err) => {
                self.report_read_failure("recent_stage_transitions", &err);
                Ok(Vec::new())
            }
        }
    }

    pub async fn record_metric_point(
        &self,
        metric_id: &str,
        point: MetricPoint,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO metrics (metric_id, timestamp, value) VALUES (?, ?, ?)",
        )
        .bind(metric_id)
        .bind(point.ts.timestamp_millis())
        .bind(point.value)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn metric_points(
        &self,
        metric_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>> {
        let rows = sqlx::query_as::<_, (i64, f64)>(
            "SELECT timestamp, value FROM metrics \
             WHERE metric_id = ? AND timestamp >= ? ORDER BY timestamp ASC",
        )
        .bind(metric_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.reader)
        .await;
        match rows {
            Ok(rows) => rows
                .into_iter()
                .map(|(ms, value)| Ok(MetricPoint { ts: ts_from_ms(ms)?, value }))
                .collect(),
            Err(err) => {
                self.report_read_failure("metric_points", &err);
                Ok(Vec::new())
            }
        }
    }

    /// Upsert a file identity; returns true when size/mtime actually changed.
    pub async fn update_file_cache(
        &self,
        path: &str,
        size: u64,
        mtime_ms: i64,
        context_tag: &str,
    ) -> Result<bool> {
        let existing = sqlx::query_as::<_, (i64, i64)>(
            "SELECT size, mtime_ms FROM file_monitor_cache WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.reader)
        .await?;
        if let Some((prev_size, prev_mtime)) = existing
            && prev_size == size as i64
            && prev_mtime == mtime_ms
        {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO file_monitor_cache (path, size, mtime_ms, context_tag, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(path) DO UPDATE SET \
               size = excluded.size, mtime_ms = excluded.mtime_ms, \
               context_tag = excluded.context_tag, updated_at = excluded.updated_at",
        )
        .bind(path)
        .bind(size as i64)
        .bind(mtime_ms)
        .bind(context_tag)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.writer)
        .await?;
        Ok(true)
    }

    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }

    // --- internals ---

    async fn check_capacity(&self, about_to_append: u64) -> Result<()> {
        let Some(max_bytes) = self.config.max_bytes else {
            return Ok(());
        };
        // Stat the file only every CAPACITY_CHECK_INTERVAL appended rows.
        let count = self.appended.load(Ordering::Relaxed);
        let crosses_check = count / CAPACITY_CHECK_INTERVAL
            != (count + about_to_append) / CAPACITY_CHECK_INTERVAL;
        if count != 0 && !crosses_check {
            return Ok(());
        }
        if self.db_bytes().await? <= max_bytes {
            return Ok(());
        }
        // Over budget: reclaim by pruning to retention, then re-check.
        let removed = self.prune_expired().await?;
        if self.db_bytes().await? > max_bytes {
            self.degraded.store(true, Ordering::Relaxed);
            return Err(TelemetryError::StoreFull(format!(
                "byte budget {max_bytes} exceeded, reclamation removed {removed} rows"
            )));
        }
        Ok(())
    }

    async fn db_bytes(&self) -> Result<u64> {
        let mut total = tokio::fs::metadata(&self.config.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let wal = self.config.path.with_extension("db-wal");
        if let Ok(meta) = tokio::fs::metadata(&wal).await {
            total += meta.len();
        }
        Ok(total)
    }

    fn mark_degraded(&self, err: &TelemetryError) {
        self.degraded.store(true, Ordering::Relaxed);
        warn!(error = %err, "event store write failed, marking degraded");
        self.emit_degraded(err.to_string());
    }

    fn report_read_failure(&self, operation: &str, err: &sqlx::Error) {
        self.degraded.store(true, Ordering::Relaxed);
        warn!(operation, error = %err, "event store read failed, returning empty");
        self.emit_degraded(format!("{operation}: {err}"));
    }

    fn emit_degraded(&self, reason: String) {
        if let Some(sink) = self.sink.get() {
            sink.emit(
                Event::builder("system:storage_degraded", EventCategory::System)
                    .severity(EventSeverity::Warning)
                    .source("event-store")
                    .data(serde_json::json!({ "reason": reason }))
                    .build(),
            );
        }
    }
}

fn push_in_clause<'qb>(
    qb: &mut QueryBuilder<'qb, sqlx::Sqlite>,
    column: &str,
    values: impl Iterator<Item = &'qb str>,
) {
    let values: Vec<&str> = values.collect();
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.to_string());
    }
    qb.push(")");
}
