//! SQLite-backed state store.
//!
//! Single-file embedded database holding the live state snapshot plus the
//! append-only logs: events, completed actions, CCI snapshots, approvals,
//! and the transcript. WAL mode is enabled and all access goes through one
//! connection guarded by a mutex, which makes the store the serialized
//! writer the rest of the pipeline assumes.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::approval::{ApprovalStatus, PendingApproval};
use crate::error::{PceError, PceResult};
use crate::types::{
    CciComponents, CciSnapshot, CompletedAction, JsonMap, PceEvent, TranscriptItem, TranscriptKind,
};

/// Newtype wrapping `Connection` in a `Mutex` so the store is both `Send`
/// and `Sync`. `rusqlite::Connection` is `Send` but not `Sync`.
struct DbConn(Mutex<Connection>);

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbConn(<sqlite>)")
    }
}

/// DDL for all tables and indices. Idempotent.
///
/// `state.version` backs the copy-on-write compare-and-swap; the transcript
/// cursor is the AUTOINCREMENT primary key, which keeps it strictly
/// monotonic and gap-free for the lifetime of the store file.
const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS state (
    key        TEXT PRIMARY KEY,
    json       TEXT    NOT NULL,
    version    INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS events (
    event_id   TEXT PRIMARY KEY,
    type       TEXT    NOT NULL,
    source     TEXT    NOT NULL,
    ts         INTEGER NOT NULL,
    json       TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS actions (
    action_id   TEXT PRIMARY KEY,
    decision_id TEXT    NOT NULL,
    ts          INTEGER NOT NULL,
    json        TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS cci (
    ts              INTEGER PRIMARY KEY,
    cci             REAL NOT NULL,
    components_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS approvals (
    approval_id TEXT PRIMARY KEY,
    status      TEXT    NOT NULL,
    json        TEXT    NOT NULL,
    created_at  INTEGER NOT NULL,
    resolved_at INTEGER
);
CREATE TABLE IF NOT EXISTS transcript (
    cursor         INTEGER PRIMARY KEY AUTOINCREMENT,
    ts             INTEGER NOT NULL,
    kind           TEXT    NOT NULL,
    agent          TEXT,
    correlation_id TEXT    NOT NULL,
    decision_id    TEXT,
    payload_json   TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_ts       ON events(ts);
CREATE INDEX IF NOT EXISTS idx_actions_ts      ON actions(ts);
CREATE INDEX IF NOT EXISTS idx_approval_status ON approvals(status);
";

const STATE_KEY: &str = "global";

#[derive(Debug)]
pub struct StateStore {
    conn: DbConn,
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl StateStore {
    /// Open (or create) the store at `path`, creating parent directories and
    /// initializing the schema as needed.
    pub fn open(path: &Path) -> PceResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PceError::Storage(format!("create state db dir {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| PceError::Storage(format!("open state db {}: {}", path.display(), e)))?;
        Self::initialize(conn)
    }

    /// In-memory store, used by tests and throwaway runs.
    pub fn open_in_memory() -> PceResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PceError::Storage(format!("open in-memory db: {}", e)))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> PceResult<Self> {
        // WAL for concurrent readers; harmless for in-memory connections.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| PceError::Storage(format!("initialize schema: {}", e)))?;
        Ok(Self {
            conn: DbConn(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> PceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .0
            .lock()
            .map_err(|e| PceError::Storage(format!("acquire sqlite lock: {}", e)))
    }

    // ------------------------------------------------------------------
    // State snapshot (copy-on-write, compare-and-swap)
    // ------------------------------------------------------------------

    /// Load the live snapshot plus its version. Absent row means an empty
    /// snapshot at version 0.
    pub fn load_state(&self) -> PceResult<(JsonMap, i64)> {
        let conn = self.lock()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT json, version FROM state WHERE key = ?1",
                [STATE_KEY],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((raw, version)) => {
                let value: Value = serde_json::from_str(&raw)?;
                let map = value.as_object().cloned().unwrap_or_default();
                Ok((map, version))
            }
            None => Ok((JsonMap::new(), 0)),
        }
    }

    /// Persist the snapshot atomically. `expected_version` must match the
    /// stored row or the write fails with `state_conflict`; the caller (the
    /// pipeline writer) retries once before surfacing the error.
    pub fn save_state(&self, state: &JsonMap, expected_version: i64) -> PceResult<i64> {
        let serialized = serde_json::to_string(&Value::Object(state.clone()))?;
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        if expected_version == 0 {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO state (key, json, version, updated_at) VALUES (?1, ?2, 1, ?3)",
                params![STATE_KEY, serialized, now_ms],
            )?;
            if inserted == 1 {
                return Ok(1);
            }
            // A row appeared since the caller loaded version 0.
            return Err(PceError::StateConflict);
        }
        let updated = conn.execute(
            "UPDATE state SET json = ?1, version = version + 1, updated_at = ?2 \
             WHERE key = ?3 AND version = ?4",
            params![serialized, now_ms, STATE_KEY, expected_version],
        )?;
        if updated == 0 {
            return Err(PceError::StateConflict);
        }
        Ok(expected_version + 1)
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    pub fn append_event(&self, event: &PceEvent) -> PceResult<()> {
        let json = serde_json::to_string(event)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO events (event_id, type, source, ts, json) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id,
                event.event_type,
                event.source,
                event.ts.timestamp_millis(),
                json,
            ],
        )?;
        Ok(())
    }

    pub fn event_count(&self) -> PceResult<i64> {
        let conn = self.lock()?;
        let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Action log
    // ------------------------------------------------------------------

    pub fn append_action(&self, action: &CompletedAction) -> PceResult<()> {
        let json = serde_json::to_string(action)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO actions (action_id, decision_id, ts, json) VALUES (?1, ?2, ?3, ?4)",
            params![
                action.action_id,
                action.decision_id,
                action.completed_at.timestamp_millis(),
                json,
            ],
        )?;
        Ok(())
    }

    /// Most recent `n` completed actions ordered oldest to newest, which is
    /// the ordering the coherence engine expects.
    pub fn recent_actions(&self, n: usize) -> PceResult<Vec<CompletedAction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT json FROM actions ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([n as i64], |row| row.get::<_, String>(0))
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        let mut actions = rows
            .into_iter()
            .map(|raw| serde_json::from_str::<CompletedAction>(&raw).map_err(PceError::from))
            .collect::<PceResult<Vec<_>>>()?;
        actions.reverse();
        Ok(actions)
    }

    // ------------------------------------------------------------------
    // CCI history
    // ------------------------------------------------------------------

    /// Append one CCI snapshot. The `ts` primary key is in microseconds;
    /// a collision (two snapshots inside the same tick) bumps forward until
    /// the insert lands, so history is never silently replaced.
    pub fn append_cci_snapshot(&self, snapshot: &CciSnapshot) -> PceResult<()> {
        let components_json = serde_json::to_string(&snapshot.components)?;
        let conn = self.lock()?;
        let mut ts = snapshot.ts.timestamp_micros();
        loop {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO cci (ts, cci, components_json) VALUES (?1, ?2, ?3)",
                params![ts, snapshot.cci, components_json],
            )?;
            if inserted == 1 {
                return Ok(());
            }
            ts += 1;
        }
    }

    pub fn cci_history(&self) -> PceResult<Vec<CciSnapshot>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT ts, cci, components_json FROM cci ORDER BY ts ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        rows.into_iter()
            .map(|(ts_us, cci, components_json)| {
                let components: Option<CciComponents> = serde_json::from_str(&components_json)?;
                let ts = Utc
                    .timestamp_micros(ts_us)
                    .single()
                    .unwrap_or_else(Utc::now);
                Ok(CciSnapshot { ts, cci, components })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    pub fn insert_approval(&self, approval: &PendingApproval) -> PceResult<()> {
        let json = serde_json::to_string(approval)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO approvals (approval_id, status, json, created_at, resolved_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                approval.approval_id,
                approval.status.as_str(),
                json,
                approval.created_at.timestamp_millis(),
                approval.resolved_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn get_approval(&self, approval_id: &str) -> PceResult<PendingApproval> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT json FROM approvals WHERE approval_id = ?1",
                [approval_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(PceError::ApprovalNotFound(approval_id.to_string())),
        }
    }

    pub fn list_approvals(&self) -> PceResult<Vec<PendingApproval>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT json FROM approvals ORDER BY created_at ASC, rowid ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        rows.into_iter()
            .map(|raw| serde_json::from_str(&raw).map_err(PceError::from))
            .collect()
    }

    pub fn pending_approvals(&self) -> PceResult<Vec<PendingApproval>> {
        let all = self.list_approvals()?;
        Ok(all
            .into_iter()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .collect())
    }

    /// Replace a stored approval. Refuses to touch a record that already
    /// reached a terminal state: terminal records are immutable.
    pub fn update_approval(&self, approval: &PendingApproval) -> PceResult<()> {
        let json = serde_json::to_string(approval)?;
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE approvals SET status = ?1, json = ?2, resolved_at = ?3 \
             WHERE approval_id = ?4 AND status = 'pending'",
            params![
                approval.status.as_str(),
                json,
                approval.resolved_at.map(|t| t.timestamp_millis()),
                approval.approval_id,
            ],
        )?;
        if updated == 0 {
            // Distinguish missing from already-terminal for the caller.
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM approvals WHERE approval_id = ?1",
                    [approval.approval_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match exists {
                Some(_) => PceError::ApprovalAlreadyTerminal(approval.approval_id.clone()),
                None => PceError::ApprovalNotFound(approval.approval_id.clone()),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transcript
    // ------------------------------------------------------------------

    /// Append one transcript item and return it with its assigned cursor.
    pub fn append_transcript(
        &self,
        kind: TranscriptKind,
        agent: Option<&str>,
        payload: &Value,
        correlation_id: &str,
        decision_id: Option<&str>,
    ) -> PceResult<TranscriptItem> {
        let ts = Utc::now();
        let payload_json = serde_json::to_string(payload)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO transcript (ts, kind, agent, correlation_id, decision_id, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ts.timestamp_millis(),
                kind.as_str(),
                agent,
                correlation_id,
                decision_id,
                payload_json,
            ],
        )?;
        let cursor = conn.last_insert_rowid();
        Ok(TranscriptItem {
            cursor,
            ts,
            kind,
            agent: agent.map(str::to_string),
            payload: payload.clone(),
            correlation_id: correlation_id.to_string(),
            decision_id: decision_id.map(str::to_string),
        })
    }

    /// Items with cursor strictly greater than `since`, in cursor order.
    pub fn transcript_since(&self, since: i64) -> PceResult<Vec<TranscriptItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT cursor, ts, kind, agent, correlation_id, decision_id, payload_json \
             FROM transcript WHERE cursor > ?1 ORDER BY cursor ASC",
        )?;
        let rows = stmt
            .query_map([since], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        rows.into_iter()
            .map(
                |(cursor, ts_ms, kind_raw, agent, correlation_id, decision_id, payload_json)| {
                    let kind = TranscriptKind::parse(&kind_raw).ok_or_else(|| {
                        PceError::Storage(format!("unknown transcript kind {:?}", kind_raw))
                    })?;
                    let payload: Value = serde_json::from_str(&payload_json)?;
                    Ok(TranscriptItem {
                        cursor,
                        ts: ms_to_datetime(ts_ms),
                        kind,
                        agent,
                        payload,
                        correlation_id,
                        decision_id,
                    })
                },
            )
            .collect()
    }

    pub fn transcript_cursor(&self) -> PceResult<i64> {
        let conn = self.lock()?;
        let cursor: Option<i64> =
            conn.query_row("SELECT MAX(cursor) FROM transcript", [], |row| row.get(0))?;
        Ok(cursor.unwrap_or(0))
    }
}
