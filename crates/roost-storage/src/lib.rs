//! Durable checkpoints, seen-sets, and batched record sinks for roost.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use roost_core::{Record, Scope};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-storage";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("encoding record attributes: {0}")]
    Encode(#[from] serde_json::Error),
}

/// In-memory materialized view of a scope's committed identifiers.
///
/// Membership checks never touch storage; the set is loaded once at session
/// start and grows as batches are committed.
#[derive(Debug, Clone, Default)]
pub struct SeenSet {
    ids: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: HashSet<String>) -> Self {
        Self { ids }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Merge newly committed identifiers. Re-committing an id is a no-op.
    pub fn commit<I: IntoIterator<Item = String>>(&mut self, ids: I) {
        self.ids.extend(ids);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &HashSet<String> {
        &self.ids
    }
}

/// Durable per-scope snapshot of committed identifiers, one JSON file per
/// scope holding a sorted array of ids.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, scope: &Scope) -> PathBuf {
        self.dir.join(format!("checkpoint_{}.json", scope.job_name()))
    }

    /// Load a scope's committed ids. A missing, unreadable, or corrupt
    /// checkpoint degrades to the empty set — the run may then reprocess
    /// already-seen items, but it never dies here.
    pub async fn load(&self, scope: &Scope) -> HashSet<String> {
        let path = self.path_for(scope);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashSet::new(),
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read checkpoint; starting empty");
                return HashSet::new();
            }
        };
        match serde_json::from_str::<Vec<String>>(&text) {
            Ok(ids) => {
                let ids: HashSet<String> = ids.into_iter().collect();
                info!(path = %path.display(), ids = ids.len(), "loaded checkpoint");
                ids
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt checkpoint; starting empty");
                HashSet::new()
            }
        }
    }

    /// Persist the full committed set via temp file + atomic rename, so a
    /// crash mid-save leaves the previous checkpoint intact. Callers pass
    /// the merged superset; saving the same set twice is a no-op in effect.
    pub async fn save(&self, scope: &Scope, ids: &HashSet<String>) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating checkpoint directory {}", self.dir.display()))?;

        let path = self.path_for(scope);
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        let body = serde_json::to_vec_pretty(&sorted).context("serializing checkpoint")?;

        let temp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp, &body)
            .await
            .with_context(|| format!("writing temp checkpoint {}", temp.display()))?;
        match fs::rename(&temp, &path).await {
            Ok(()) => {
                debug!(path = %path.display(), ids = ids.len(), "checkpoint saved");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                Err(err).with_context(|| {
                    format!("renaming checkpoint {} -> {}", temp.display(), path.display())
                })
            }
        }
    }
}

/// Destination for committed record batches.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write a batch. Re-committing a record with a known id must not
    /// produce a duplicate in the sink.
    async fn commit(&self, scope: &Scope, records: &[Record]) -> Result<usize, SinkError>;

    /// All identifiers the sink already holds for a scope.
    async fn seen_ids(&self, scope: &Scope) -> Result<HashSet<String>, SinkError>;
}

/// Append-only CSV sink writing numbered shard files per scope.
///
/// A shard that reaches `max_rows_per_file` rows is closed and writing
/// continues in the next numbered shard; reads union every shard.
#[derive(Debug, Clone)]
pub struct CsvSink {
    data_dir: PathBuf,
    max_rows_per_file: usize,
}

impl CsvSink {
    pub fn new(data_dir: impl Into<PathBuf>, max_rows_per_file: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_rows_per_file: max_rows_per_file.max(1),
        }
    }

    fn shard_path(&self, base: &str, index: usize) -> PathBuf {
        self.data_dir.join(format!("{base}_{index}.csv"))
    }

    fn data_rows(path: &Path) -> Result<usize, SinkError> {
        use std::io::BufRead;
        let file = std::fs::File::open(path)?;
        let lines = std::io::BufReader::new(file).lines().count();
        Ok(lines.saturating_sub(1))
    }

    /// Lowest-numbered shard with room for more rows, starting the search
    /// at `index` and advancing it past full shards.
    fn shard_with_capacity(
        &self,
        base: &str,
        index: &mut usize,
    ) -> Result<(PathBuf, usize), SinkError> {
        loop {
            let path = self.shard_path(base, *index);
            if !path.exists() {
                return Ok((path, 0));
            }
            let rows = Self::data_rows(&path)?;
            if rows < self.max_rows_per_file {
                return Ok((path, rows));
            }
            *index += 1;
        }
    }

    fn append_to_shard(
        &self,
        path: &Path,
        columns: &[String],
        records: &[Record],
    ) -> Result<(), SinkError> {
        let is_new = !path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(columns)?;
        }
        for record in records {
            writer.write_record(columns.iter().map(|c| record.column_value(c)))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_batch(&self, scope: &Scope, records: &[Record]) -> Result<usize, SinkError> {
        std::fs::create_dir_all(&self.data_dir)?;
        let base = scope.base_filename();
        // Column set comes from the first record of the batch; records
        // missing a column emit an empty field, extra keys are dropped.
        let columns = records[0].columns();

        let mut written = 0usize;
        let mut remaining = records;
        let mut index = 1usize;
        while !remaining.is_empty() {
            let (path, rows) = self.shard_with_capacity(&base, &mut index)?;
            let capacity = self.max_rows_per_file - rows;
            let take = remaining.len().min(capacity);
            let (batch, rest) = remaining.split_at(take);
            self.append_to_shard(&path, &columns, batch)?;
            written += take;
            remaining = rest;
        }
        Ok(written)
    }

    fn read_seen_ids(&self, scope: &Scope) -> HashSet<String> {
        let base = scope.base_filename();
        let mut out = HashSet::new();
        let mut index = 1usize;
        loop {
            let path = self.shard_path(&base, index);
            if !path.exists() {
                break;
            }
            let mut reader = match csv::ReaderBuilder::new().has_headers(true).from_path(&path) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!(path = %path.display(), %err, "could not open csv shard; skipping");
                    index += 1;
                    continue;
                }
            };
            let id_column = match reader.headers() {
                Ok(headers) => headers.iter().position(|c| c == "id"),
                Err(err) => {
                    warn!(path = %path.display(), %err, "could not read csv header; skipping shard");
                    None
                }
            };
            if let Some(id_column) = id_column {
                for row in reader.records() {
                    match row {
                        Ok(row) => {
                            if let Some(id) = row.get(id_column) {
                                out.insert(id.to_string());
                            }
                        }
                        Err(err) => {
                            warn!(path = %path.display(), %err, "skipping unreadable csv row")
                        }
                    }
                }
            }
            index += 1;
        }
        out
    }
}

#[async_trait]
impl RecordSink for CsvSink {
    async fn commit(&self, scope: &Scope, records: &[Record]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }
        let written = self.write_batch(scope, records)?;
        info!(scope = %scope.job_name(), written, "wrote records to csv shards");
        Ok(written)
    }

    async fn seen_ids(&self, scope: &Scope) -> Result<HashSet<String>, SinkError> {
        Ok(self.read_seen_ids(scope))
    }
}

const CREATE_RECORDS_TABLE: &str = "CREATE TABLE IF NOT EXISTS records (
    task_type TEXT NOT NULL,
    source TEXT NOT NULL,
    id TEXT NOT NULL,
    scraped_at TEXT NOT NULL,
    attrs TEXT NOT NULL,
    PRIMARY KEY (task_type, source, id)
)";

const CREATE_SCRAPED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_scraped_at ON records (scraped_at)";

/// SQLite-backed sink. Batches are upserted by scope + id inside one
/// transaction, so re-runs that re-encounter boundary items overwrite
/// rather than duplicate.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub async fn connect(url: &str) -> Result<Self, SinkError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // A single connection: the collector is a single sequential worker,
        // and it keeps an in-memory database coherent across calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_RECORDS_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_SCRAPED_AT_INDEX).execute(&pool).await?;
        info!(url, "record database ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl RecordSink for SqliteSink {
    async fn commit(&self, scope: &Scope, records: &[Record]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut upserted = 0usize;
        for record in records {
            let attrs = serde_json::to_string(&record.attrs)?;
            let result = sqlx::query(
                "INSERT INTO records (task_type, source, id, scraped_at, attrs)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (task_type, source, id)
                 DO UPDATE SET scraped_at = excluded.scraped_at, attrs = excluded.attrs",
            )
            .bind(record.task_type.as_str())
            .bind(&record.source)
            .bind(&record.id)
            .bind(record.scraped_at.to_rfc3339())
            .bind(attrs)
            .execute(&mut *tx)
            .await?;
            upserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        debug!(scope = %scope.job_name(), upserted, "upserted batch into records table");
        Ok(upserted)
    }

    async fn seen_ids(&self, scope: &Scope) -> Result<HashSet<String>, SinkError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM records WHERE task_type = ? AND source = ?")
                .bind(scope.task.as_str())
                .bind(&scope.target)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }
}

/// In-memory buffer of accepted records, flushed to a sink in chunks.
///
/// On a failed flush the buffer is retained untouched, so the batch stays
/// eligible for the next flush attempt (at-least-once delivery; the sinks
/// absorb re-delivery by id).
#[derive(Debug)]
pub struct ChunkedWriter {
    buffer: Vec<Record>,
    threshold: usize,
}

impl ChunkedWriter {
    pub fn new(threshold: usize) -> Self {
        Self {
            buffer: Vec::new(),
            threshold: threshold.max(1),
        }
    }

    pub fn accept(&mut self, record: Record) {
        self.buffer.push(record);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Flush only once the buffer has reached the chunk threshold. Returns
    /// the flushed records so the caller can commit their ids.
    pub async fn flush_if_full(
        &mut self,
        sink: &dyn RecordSink,
        scope: &Scope,
    ) -> Result<Option<Vec<Record>>, SinkError> {
        if self.buffer.len() < self.threshold {
            return Ok(None);
        }
        self.flush(sink, scope).await
    }

    /// Unconditional flush of whatever remains; called once at session end.
    pub async fn flush_remaining(
        &mut self,
        sink: &dyn RecordSink,
        scope: &Scope,
    ) -> Result<Option<Vec<Record>>, SinkError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        self.flush(sink, scope).await
    }

    async fn flush(
        &mut self,
        sink: &dyn RecordSink,
        scope: &Scope,
    ) -> Result<Option<Vec<Record>>, SinkError> {
        let written = sink.commit(scope, &self.buffer).await?;
        debug!(written, "flushed chunk to sink");
        Ok(Some(std::mem::take(&mut self.buffer)))
    }
}
