use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::{Event, EventKind};
use stepflow_core::traits::Journal;
use stepflow_core::types::RunId;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS events (
        run_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (run_id, seq)
    );";

/// SQLite-backed append-only journal.
///
/// Sequence numbers are assigned inside the insert transaction, so two
/// appends for the same run can never share a sequence even when their
/// timestamps collide.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    /// Open or create a journal database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepflowError::Database(format!("Failed to create journal directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StepflowError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StepflowError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Journal opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| StepflowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_events(&self, run_id: &RunId, after: u64) -> Result<Vec<Event>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, timestamp, kind, payload FROM events
                 WHERE run_id = ?1 AND seq > ?2
                 ORDER BY seq ASC",
            )
            .map_err(|e| StepflowError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![run_id.as_str(), after as i64], |row| {
                let seq: i64 = row.get(0)?;
                let ts: String = row.get(1)?;
                let kind: String = row.get(2)?;
                let payload: String = row.get(3)?;
                Ok((seq, ts, kind, payload))
            })
            .map_err(|e| StepflowError::Database(e.to_string()))?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, ts, kind, payload) =
                row.map_err(|e| StepflowError::Database(e.to_string()))?;
            events.push(decode_row(run_id, seq as u64, &ts, &kind, &payload)?);
        }
        Ok(events)
    }
}

fn decode_row(run_id: &RunId, seq: u64, ts: &str, kind: &str, payload: &str) -> Result<Event> {
    let timestamp = DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            StepflowError::Journal(format!("run {} event {}: bad timestamp: {}", run_id, seq, e))
        })?;
    let kind = EventKind::parse(kind).ok_or_else(|| {
        StepflowError::Journal(format!("run {} event {}: unknown kind '{}'", run_id, seq, kind))
    })?;
    Ok(Event {
        sequence: seq,
        run_id: run_id.clone(),
        timestamp,
        kind,
        payload: serde_json::from_str(payload)?,
    })
}

impl Journal for SqliteJournal {
    fn append(&self, run_id: &RunId, kind: EventKind, payload: serde_json::Value) -> Result<Event> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StepflowError::Journal(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| StepflowError::Journal(e.to_string()))?;

        let head: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StepflowError::Journal(e.to_string()))?;

        let event = Event {
            sequence: head as u64 + 1,
            run_id: run_id.clone(),
            timestamp: Utc::now(),
            kind,
            payload,
        };
        let payload_json = serde_json::to_string(&event.payload)?;

        tx.execute(
            "INSERT INTO events (run_id, seq, timestamp, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id.as_str(),
                event.sequence as i64,
                event.timestamp.to_rfc3339(),
                kind.as_str(),
                payload_json,
            ],
        )
        .map_err(|e| StepflowError::Journal(format!("Failed to append {}: {}", kind, e)))?;
        tx.commit()
            .map_err(|e| StepflowError::Journal(format!("Failed to commit {}: {}", kind, e)))?;

        Ok(event)
    }

    fn read_all(&self, run_id: &RunId) -> Result<Vec<Event>> {
        self.query_events(run_id, 0)
    }

    fn read_since(&self, run_id: &RunId, after: u64) -> Result<Vec<Event>> {
        self.query_events(run_id, after)
    }

    fn head(&self, run_id: &RunId) -> Result<u64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        let head: Option<i64> = conn
            .query_row(
                "SELECT MAX(seq) FROM events WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StepflowError::Database(e.to_string()))?
            .flatten();
        Ok(head.unwrap_or(0) as u64)
    }

    fn run_ids(&self) -> Result<Vec<RunId>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT run_id FROM events ORDER BY run_id")
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StepflowError::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        Ok(ids.into_iter().map(RunId::from_string).collect())
    }
}

/// In-process journal for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryJournal {
    runs: Mutex<BTreeMap<RunId, Vec<Event>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, run_id: &RunId, kind: EventKind, payload: serde_json::Value) -> Result<Event> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|e| StepflowError::Journal(e.to_string()))?;
        let events = runs.entry(run_id.clone()).or_default();
        let event = Event {
            sequence: events.len() as u64 + 1,
            run_id: run_id.clone(),
            timestamp: Utc::now(),
            kind,
            payload,
        };
        events.push(event.clone());
        Ok(event)
    }

    fn read_all(&self, run_id: &RunId) -> Result<Vec<Event>> {
        self.read_since(run_id, 0)
    }

    fn read_since(&self, run_id: &RunId, after: u64) -> Result<Vec<Event>> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        Ok(runs
            .get(run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn head(&self, run_id: &RunId) -> Result<u64> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        Ok(runs.get(run_id).map_or(0, |events| events.len() as u64))
    }

    fn run_ids(&self) -> Result<Vec<RunId>> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| StepflowError::Database(e.to_string()))?;
        Ok(runs.keys().cloned().collect())
    }
}
