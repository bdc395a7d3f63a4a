//! Checkpoint Store
//!
//! One SQLite file per stage records the last outcome of every item the
//! stage has processed, keyed by item id and tagged with the state
//! fingerprint that was current at the time. The pool holds a single
//! connection, so concurrent upserts from executor workers are serialised.
//!
//! A file that cannot be read as a checkpoint is moved aside and replaced by
//! an empty store: losing progress only causes safe re-verification, while
//! trusting a damaged file could skip real work.

use crate::planner::{Mode, Outcome};
use chrono::{DateTime, Utc};
use larder_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Last recorded outcome for one item
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub item_id: String,
    pub state_key: String,
    pub outcome: Outcome,
    pub run_counter: i64,
    pub updated_at: DateTime<Utc>,
}

/// Read-only view of a stage's checkpoint, taken at stage start
#[derive(Debug, Clone, Default)]
pub struct CheckpointSnapshot {
    records: HashMap<String, CheckpointRecord>,
}

impl CheckpointSnapshot {
    pub fn from_records(records: impl IntoIterator<Item = CheckpointRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.item_id.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, item_id: &str) -> Option<&CheckpointRecord> {
        self.records.get(item_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `item_id` in state `state_key` is already covered
    pub fn suppresses(&self, item_id: &str, state_key: &str, mode: Mode) -> bool {
        match self.records.get(item_id) {
            Some(record) => record.state_key == state_key && record.outcome.suppresses(mode),
            None => false,
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.records.values().filter(|r| r.outcome == outcome).count()
    }
}

/// Durable per-stage checkpoint
pub struct CheckpointStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
    stage: String,
}

impl CheckpointStore {
    /// Checkpoint file for a stage
    pub fn path_for(dir: &Path, stage: &str) -> PathBuf {
        dir.join(format!("{}.checkpoint.db", stage))
    }

    /// Open (creating if needed) the checkpoint for `stage` under `dir`
    pub async fn open(dir: &Path, stage: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, stage);

        match Self::connect_file(&path, stage).await {
            Ok(store) => Ok(store),
            Err(err) => {
                let aside = move_aside(&path)?;
                tracing::warn!(
                    stage,
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "Checkpoint unreadable, starting with an empty checkpoint"
                );
                Self::connect_file(&path, stage).await
            }
        }
    }

    /// Non-persistent store, for audit tooling and tests
    pub async fn open_in_memory(stage: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            path: None,
            stage: stage.to_string(),
        };
        store.init_tables().await?;
        Ok(store)
    }

    async fn connect_file(path: &Path, stage: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
            stage: stage.to_string(),
        };

        if let Err(err) = store.init_tables().await {
            store.pool.close().await;
            return Err(err);
        }
        // Validates the file really is a readable checkpoint
        if let Err(err) = store.read_all().await {
            store.pool.close().await;
            return Err(err);
        }

        tracing::debug!(stage, path = %path.display(), "Checkpoint opened");
        Ok(store)
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint (
                item_id TEXT PRIMARY KEY,
                state_key TEXT NOT NULL,
                outcome TEXT NOT NULL,
                run_counter INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Start a new run: increment and return the run counter
    pub async fn begin_run(&self) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO meta (key, value) VALUES ('run_counter', 1)
            ON CONFLICT(key) DO UPDATE SET value = value + 1
            "#,
        )
        .execute(&mut *tx)
        .await?;
        let counter: i64 = sqlx::query_scalar("SELECT value FROM meta WHERE key = 'run_counter'")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(stage = %self.stage, run_counter = counter, "Checkpoint run started");
        Ok(counter)
    }

    /// Every record, as a snapshot
    ///
    /// Rows with an unknown outcome are ignored rather than trusted.
    pub async fn read_all(&self) -> Result<CheckpointSnapshot> {
        let rows = sqlx::query(
            "SELECT item_id, state_key, outcome, run_counter, updated_at FROM checkpoint",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let item_id: String = row.try_get("item_id")?;
            let outcome_raw: String = row.try_get("outcome")?;
            let Some(outcome) = Outcome::parse(&outcome_raw) else {
                tracing::warn!(stage = %self.stage, item_id, outcome = outcome_raw, "Ignoring checkpoint row with unknown outcome");
                continue;
            };
            let updated_raw: String = row.try_get("updated_at")?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_raw)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            records.push(CheckpointRecord {
                item_id,
                state_key: row.try_get("state_key")?,
                outcome,
                run_counter: row.try_get("run_counter")?,
                updated_at,
            });
        }

        Ok(CheckpointSnapshot::from_records(records))
    }

    /// Insert or replace one item's record
    pub async fn upsert(&self, record: &CheckpointRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoint (item_id, state_key, outcome, run_counter, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                state_key = excluded.state_key,
                outcome = excluded.outcome,
                run_counter = excluded.run_counter,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.item_id)
        .bind(&record.state_key)
        .bind(record.outcome.as_str())
        .bind(record.run_counter)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Delete a stage's checkpoint file
    ///
    /// Returns whether a file was removed.
    pub fn reset(dir: &Path, stage: &str) -> Result<bool> {
        let path = Self::path_for(dir, stage);
        let mut removed = false;
        for candidate in [path.clone(), sidecar(&path, "-journal")] {
            match std::fs::remove_file(&candidate) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        if removed {
            tracing::info!(stage, path = %path.display(), "Checkpoint reset");
        }
        Ok(removed)
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn move_aside(path: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let aside = sidecar(path, &format!(".corrupt-{}", stamp));
    if path.exists() {
        std::fs::rename(path, &aside)?;
    }
    let journal = sidecar(path, "-journal");
    if journal.exists() {
        std::fs::remove_file(&journal)?;
    }
    Ok(aside)
}
