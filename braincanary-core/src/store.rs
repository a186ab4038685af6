use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

use crate::controller::{DeploymentSnapshot, DeploymentState, FinalState};
use crate::events::Event;
use crate::sqlite::configure_connection;
use crate::stats::SampleSummary;

const DEPLOYMENT_SCHEMA: &str = include_str!("../../sql/deployments.sql");

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("deployment {deployment_id} not found")]
    NotFound { deployment_id: String },
    #[error("unrecognized {column} value {value:?}")]
    Corrupt {
        column: &'static str,
        value: String,
    },
    #[error("store path not configured")]
    MissingPath,
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

/// Append-only record of one state-machine transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub deployment_id: String,
    pub from_state: DeploymentState,
    pub to_state: DeploymentState,
    pub reason: Option<String>,
    pub scores_snapshot_json: Option<String>,
    pub ts: DateTime<Utc>,
}

/// One (scorer, stage) aggregate row persisted per score update.
#[derive(Debug, Clone)]
pub struct ScoreSnapshotRow {
    pub deployment_id: String,
    pub stage_index: usize,
    pub scorer: String,
    pub baseline: SampleSummary,
    pub canary: SampleSummary,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub deployment_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Durable state the controller depends on: atomic snapshot writes plus
/// append-only transitions, score snapshots, and events.
pub trait DeploymentStore: Send + Sync {
    fn save_snapshot(&self, snapshot: &DeploymentSnapshot) -> StoreResult<()>;
    fn load_snapshot(&self, deployment_id: &str) -> StoreResult<Option<DeploymentSnapshot>>;
    /// Most recent deployment that is neither idle nor terminal.
    fn active_deployment(&self) -> StoreResult<Option<DeploymentSnapshot>>;
    fn history(&self, limit: usize) -> StoreResult<Vec<DeploymentSnapshot>>;
    fn append_transition(&self, record: &TransitionRecord) -> StoreResult<()>;
    fn transitions(&self, deployment_id: &str) -> StoreResult<Vec<TransitionRecord>>;
    fn append_score_rows(&self, rows: &[ScoreSnapshotRow]) -> StoreResult<()>;
    fn append_event(&self, event: &Event) -> StoreResult<()>;
    fn recent_events(&self, deployment_id: &str, limit: usize) -> StoreResult<Vec<StoredEvent>>;
}

#[derive(Debug, Clone)]
pub struct SqliteDeploymentStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteDeploymentStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteDeploymentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteDeploymentStore> {
        let path = self.path.ok_or(StoreError::MissingPath)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteDeploymentStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteDeploymentStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteDeploymentStore {
    pub fn builder() -> SqliteDeploymentStoreBuilder {
        SqliteDeploymentStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteDeploymentStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn =
            Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
                StoreError::Open {
                    path: self.path.clone(),
                    source,
                }
            })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(DEPLOYMENT_SCHEMA)?;
        Ok(())
    }
}

struct SnapshotRow {
    id: String,
    name: String,
    config_json: String,
    state: String,
    stage_index: i64,
    stage_entered_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    final_state: Option<String>,
    paused_stage_index: Option<i64>,
    canary_weight: i64,
    reason: Option<String>,
}

const SNAPSHOT_COLUMNS: &str = "id, name, config_json, state, stage_index, stage_entered_at, \
     started_at, completed_at, final_state, paused_stage_index, canary_weight, reason";

impl SnapshotRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            config_json: row.get("config_json")?,
            state: row.get("state")?,
            stage_index: row.get("stage_index")?,
            stage_entered_at: row.get("stage_entered_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            final_state: row.get("final_state")?,
            paused_stage_index: row.get("paused_stage_index")?,
            canary_weight: row.get("canary_weight")?,
            reason: row.get("reason")?,
        })
    }

    fn into_snapshot(self) -> StoreResult<DeploymentSnapshot> {
        let state = DeploymentState::parse(&self.state).ok_or_else(|| StoreError::Corrupt {
            column: "state",
            value: self.state.clone(),
        })?;
        let final_state = match self.final_state {
            Some(value) => Some(FinalState::parse(&value).ok_or(StoreError::Corrupt {
                column: "final_state",
                value,
            })?),
            None => None,
        };
        Ok(DeploymentSnapshot {
            id: self.id,
            name: self.name,
            config: serde_json::from_str(&self.config_json)?,
            state,
            stage_index: self.stage_index as usize,
            stage_entered_at: self.stage_entered_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            final_state,
            paused_stage_index: self.paused_stage_index.map(|index| index as usize),
            canary_weight: self.canary_weight as u32,
            reason: self.reason,
        })
    }
}

impl DeploymentStore for SqliteDeploymentStore {
    fn save_snapshot(&self, snapshot: &DeploymentSnapshot) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO deployments (
                id, name, config_json, state, stage_index, stage_entered_at,
                started_at, completed_at, final_state, paused_stage_index,
                canary_weight, reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                config_json = excluded.config_json,
                state = excluded.state,
                stage_index = excluded.stage_index,
                stage_entered_at = excluded.stage_entered_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                final_state = excluded.final_state,
                paused_stage_index = excluded.paused_stage_index,
                canary_weight = excluded.canary_weight,
                reason = excluded.reason",
            params![
                &snapshot.id,
                &snapshot.name,
                serde_json::to_string(&snapshot.config)?,
                snapshot.state.as_str(),
                snapshot.stage_index as i64,
                snapshot.stage_entered_at,
                snapshot.started_at,
                snapshot.completed_at,
                snapshot.final_state.map(|state| state.as_str()),
                snapshot.paused_stage_index.map(|index| index as i64),
                snapshot.canary_weight as i64,
                &snapshot.reason,
            ],
        )?;
        Ok(())
    }

    fn load_snapshot(&self, deployment_id: &str) -> StoreResult<Option<DeploymentSnapshot>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM deployments WHERE id = ?1"
        ))?;
        let row = stmt
            .query_row([deployment_id], SnapshotRow::read)
            .optional()?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    fn active_deployment(&self) -> StoreResult<Option<DeploymentSnapshot>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM deployments
             WHERE state NOT IN ('IDLE', 'PROMOTED', 'ROLLED_BACK')
             ORDER BY started_at DESC
             LIMIT 1"
        ))?;
        let row = stmt.query_row([], SnapshotRow::read).optional()?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    fn history(&self, limit: usize) -> StoreResult<Vec<DeploymentSnapshot>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM deployments
             ORDER BY started_at DESC
             LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map([limit as i64], SnapshotRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    fn append_transition(&self, record: &TransitionRecord) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO state_transitions (
                deployment_id, from_state, to_state, reason, scores_snapshot_json, ts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &record.deployment_id,
                record.from_state.as_str(),
                record.to_state.as_str(),
                &record.reason,
                &record.scores_snapshot_json,
                record.ts,
            ],
        )?;
        Ok(())
    }

    fn transitions(&self, deployment_id: &str) -> StoreResult<Vec<TransitionRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT deployment_id, from_state, to_state, reason, scores_snapshot_json, ts
             FROM state_transitions
             WHERE deployment_id = ?1
             ORDER BY id ASC",
        )?;
        let raw = stmt
            .query_map([deployment_id], |row| {
                Ok((
                    row.get::<_, String>("deployment_id")?,
                    row.get::<_, String>("from_state")?,
                    row.get::<_, String>("to_state")?,
                    row.get::<_, Option<String>>("reason")?,
                    row.get::<_, Option<String>>("scores_snapshot_json")?,
                    row.get::<_, DateTime<Utc>>("ts")?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(
                |(deployment_id, from, to, reason, scores_snapshot_json, ts)| {
                    Ok(TransitionRecord {
                        deployment_id,
                        from_state: DeploymentState::parse(&from).ok_or(StoreError::Corrupt {
                            column: "from_state",
                            value: from.clone(),
                        })?,
                        to_state: DeploymentState::parse(&to).ok_or(StoreError::Corrupt {
                            column: "to_state",
                            value: to.clone(),
                        })?,
                        reason,
                        scores_snapshot_json,
                        ts,
                    })
                },
            )
            .collect()
    }

    fn append_score_rows(&self, rows: &[ScoreSnapshotRow]) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT INTO score_snapshots (
                    deployment_id, stage_index, scorer,
                    baseline_mean, baseline_std, baseline_n,
                    canary_mean, canary_std, canary_n, ts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    &row.deployment_id,
                    row.stage_index as i64,
                    &row.scorer,
                    row.baseline.mean,
                    row.baseline.std,
                    row.baseline.n as i64,
                    row.canary.mean,
                    row.canary.std,
                    row.canary.n as i64,
                    row.ts,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn append_event(&self, event: &Event) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO events (deployment_id, event_type, payload_json, ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &event.deployment_id,
                event.payload.kind(),
                serde_json::to_string(&event.payload)?,
                event.timestamp,
            ],
        )?;
        Ok(())
    }

    fn recent_events(&self, deployment_id: &str, limit: usize) -> StoreResult<Vec<StoredEvent>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT deployment_id, event_type, payload_json, ts
             FROM events
             WHERE deployment_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let raw = stmt
            .query_map(params![deployment_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>("deployment_id")?,
                    row.get::<_, String>("event_type")?,
                    row.get::<_, String>("payload_json")?,
                    row.get::<_, DateTime<Utc>>("ts")?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(deployment_id, event_type, payload_json, ts)| {
                Ok(StoredEvent {
                    deployment_id,
                    event_type,
                    payload: serde_json::from_str(&payload_json)?,
                    ts,
                })
            })
            .collect()
    }
}
