use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::Journal;
use stepflow_core::types::{RunId, RunStatus};

use super::reducer::{
    DecisionRow, ReceiptRow, RunProjection, RunRow, StepRow, STEP_INTERRUPTED, STEP_RUNNING,
};

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        flow_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        current_node TEXT,
        depth INTEGER NOT NULL,
        steps_completed INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_sequence INTEGER NOT NULL,
        error TEXT
    );

    CREATE TABLE IF NOT EXISTS steps (
        run_id TEXT NOT NULL,
        step_seq INTEGER NOT NULL,
        node_id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_sequence INTEGER,
        ended_sequence INTEGER,
        summary TEXT,
        error_kind TEXT,
        PRIMARY KEY (run_id, step_seq)
    );

    CREATE TABLE IF NOT EXISTS decisions (
        run_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        step_seq INTEGER NOT NULL,
        from_node TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        target TEXT,
        source TEXT NOT NULL,
        justification TEXT,
        evidence TEXT NOT NULL,
        resulting_depth INTEGER NOT NULL,
        next_node TEXT,
        PRIMARY KEY (run_id, sequence)
    );

    CREATE TABLE IF NOT EXISTS receipts (
        run_id TEXT NOT NULL,
        step_seq INTEGER NOT NULL,
        step_id TEXT NOT NULL,
        engine TEXT NOT NULL,
        backend_id TEXT NOT NULL,
        status TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        path TEXT NOT NULL,
        PRIMARY KEY (run_id, step_seq)
    );";

/// How far a query result can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Projection matches the journal head.
    Current,
    /// Projection lags the journal; a sync or rebuild will catch it up.
    Stale,
    /// Projection could not be read; the data is an empty placeholder.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult<T> {
    pub data: T,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProjectionHealth {
    Ok,
    NeedsRebuild { reasons: Vec<String> },
}

impl ProjectionHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Disposable SQLite index over the journal.
///
/// Holds nothing that cannot be derived from the journal. The file may be
/// deleted at any time; `rebuild_all` regenerates it.
pub struct ProjectionStore {
    conn: Mutex<Connection>,
    journal: Arc<dyn Journal>,
}

fn proj_err(e: impl std::fmt::Display) -> StepflowError {
    StepflowError::Projection(e.to_string())
}

impl ProjectionStore {
    /// Open or create the projection database. A file that cannot be
    /// opened as a projection is discarded and recreated empty.
    pub fn open(path: &Path, journal: Arc<dyn Journal>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepflowError::Database(format!("Failed to create projection directory: {}", e))
            })?;
        }

        let conn = match open_conn(path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Projection unreadable, recreating");
                for suffix in ["", "-wal", "-shm"] {
                    let mut p = path.as_os_str().to_owned();
                    p.push(suffix);
                    let _ = std::fs::remove_file(&p);
                }
                open_conn(path)?
            }
        };

        debug!(path = %path.display(), "Projection store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            journal,
        })
    }

    /// Open an in-memory projection (for testing).
    pub fn in_memory(journal: Arc<dyn Journal>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(proj_err)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            journal,
        })
    }

    /// Replace one run's rows with a full replay of its journal.
    pub fn rebuild(&self, run_id: &RunId) -> Result<RunProjection> {
        let events = self.journal.read_all(run_id)?;
        let projection = RunProjection::from_events(&events)?;

        let mut conn = self.conn.lock().map_err(proj_err)?;
        let tx = conn.transaction().map_err(proj_err)?;
        delete_run(&tx, run_id.as_str())?;
        write_projection(&tx, &projection)?;
        tx.commit().map_err(proj_err)?;

        debug!(run_id = %run_id, events = events.len(), "Projection rebuilt");
        Ok(projection)
    }

    /// Catch one run up from its last projected sequence.
    /// Returns the number of events applied.
    pub fn sync(&self, run_id: &RunId) -> Result<usize> {
        let existing = {
            let conn = self.conn.lock().map_err(proj_err)?;
            load_run(&conn, run_id.as_str())?
        };
        let after = existing.as_ref().map_or(0, |r| r.last_sequence);
        let events = self.journal.read_since(run_id, after)?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut projection = RunProjection::resume_from(existing);
        for event in &events {
            projection.apply(event)?;
        }

        let mut conn = self.conn.lock().map_err(proj_err)?;
        let tx = conn.transaction().map_err(proj_err)?;
        write_projection(&tx, &projection)?;
        tx.commit().map_err(proj_err)?;
        Ok(events.len())
    }

    /// Drop everything and rebuild every journaled run.
    pub fn rebuild_all(&self) -> Result<usize> {
        {
            let conn = self.conn.lock().map_err(proj_err)?;
            conn.execute_batch(
                "DROP TABLE IF EXISTS runs;
                 DROP TABLE IF EXISTS steps;
                 DROP TABLE IF EXISTS decisions;
                 DROP TABLE IF EXISTS receipts;
                 DROP TABLE IF EXISTS meta;",
            )
            .map_err(proj_err)?;
            init_schema(&conn)?;
        }

        let run_ids = self.journal.run_ids()?;
        for run_id in &run_ids {
            self.rebuild(run_id)?;
        }
        info!(runs = run_ids.len(), "Projection rebuilt from journal");
        Ok(run_ids.len())
    }

    pub fn health(&self) -> ProjectionHealth {
        let mut reasons = Vec::new();

        match self.schema_version() {
            Ok(Some(v)) if v == SCHEMA_VERSION => {}
            Ok(Some(v)) => reasons.push(format!(
                "schema version {} does not match {}",
                v, SCHEMA_VERSION
            )),
            Ok(None) => reasons.push("schema version missing".to_string()),
            Err(e) => reasons.push(format!("projection unreadable: {}", e)),
        }

        match self.journal.run_ids() {
            Ok(run_ids) => {
                for run_id in run_ids {
                    match (self.projected_head(&run_id), self.journal.head(&run_id)) {
                        (Ok(projected), Ok(head)) if projected == head => {}
                        (Ok(projected), Ok(head)) => reasons.push(format!(
                            "run {} projected to {} but journal is at {}",
                            run_id, projected, head
                        )),
                        (Err(e), _) | (_, Err(e)) => {
                            reasons.push(format!("run {}: {}", run_id, e))
                        }
                    }
                }
            }
            Err(e) => reasons.push(format!("journal unreadable: {}", e)),
        }

        if reasons.is_empty() {
            ProjectionHealth::Ok
        } else {
            warn!(count = reasons.len(), "Projection needs rebuild");
            ProjectionHealth::NeedsRebuild { reasons }
        }
    }

    pub fn run(&self, run_id: &RunId) -> QueryResult<Option<RunRow>> {
        let rows = self
            .conn
            .lock()
            .map_err(proj_err)
            .and_then(|conn| load_run(&conn, run_id.as_str()));
        match rows {
            Ok(row) => {
                let freshness = self.freshness_of(run_id, row.as_ref().map_or(0, |r| r.last_sequence));
                QueryResult {
                    data: row,
                    freshness,
                }
            }
            Err(e) => unavailable(None, e),
        }
    }

    pub fn runs(&self) -> QueryResult<Vec<RunRow>> {
        let rows = self.conn.lock().map_err(proj_err).and_then(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM runs ORDER BY run_id", RUN_COLUMNS))
                .map_err(proj_err)?;
            let rows = stmt
                .query_map([], run_from_row)
                .map_err(proj_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(proj_err)?;
            Ok(rows)
        });
        match rows {
            Ok(rows) => {
                let stale = self.journal.run_ids().map_or(true, |ids| {
                    ids.len() != rows.len()
                        || rows.iter().any(|r| {
                            self.journal
                                .head(&RunId::from_string(r.run_id.clone()))
                                .map_or(true, |h| h != r.last_sequence)
                        })
                });
                QueryResult {
                    data: rows,
                    freshness: if stale {
                        Freshness::Stale
                    } else {
                        Freshness::Current
                    },
                }
            }
            Err(e) => unavailable(vec![], e),
        }
    }

    pub fn steps(&self, run_id: &RunId) -> QueryResult<Vec<StepRow>> {
        self.query_run(run_id, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT run_id, step_seq, node_id, flow_id, status, started_sequence,
                            ended_sequence, summary, error_kind
                     FROM steps WHERE run_id = ?1 ORDER BY step_seq",
                )
                .map_err(proj_err)?;
            let rows = stmt
                .query_map(params![run_id.as_str()], |row| {
                    Ok(StepRow {
                        run_id: row.get(0)?,
                        step_seq: row.get::<_, i64>(1)? as u64,
                        node_id: row.get(2)?,
                        flow_id: row.get(3)?,
                        status: row.get(4)?,
                        started_sequence: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                        ended_sequence: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                        summary: row.get(7)?,
                        error_kind: row.get(8)?,
                    })
                })
                .map_err(proj_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(proj_err)?;
            Ok(rows)
        })
    }

    pub fn decisions(&self, run_id: &RunId) -> QueryResult<Vec<DecisionRow>> {
        self.query_run(run_id, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT run_id, sequence, step_seq, from_node, flow_id, kind, target, source,
                            justification, evidence, resulting_depth, next_node
                     FROM decisions WHERE run_id = ?1 ORDER BY sequence",
                )
                .map_err(proj_err)?;
            let raw = stmt
                .query_map(params![run_id.as_str()], |row| {
                    let evidence: String = row.get(9)?;
                    Ok((
                        DecisionRow {
                            run_id: row.get(0)?,
                            sequence: row.get::<_, i64>(1)? as u64,
                            step_seq: row.get::<_, i64>(2)? as u64,
                            from_node: row.get(3)?,
                            flow_id: row.get(4)?,
                            kind: row.get(5)?,
                            target: row.get(6)?,
                            source: row.get(7)?,
                            justification: row.get(8)?,
                            evidence: vec![],
                            resulting_depth: row.get::<_, i64>(10)? as usize,
                            next_node: row.get(11)?,
                        },
                        evidence,
                    ))
                })
                .map_err(proj_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(proj_err)?;
            raw.into_iter()
                .map(|(mut row, evidence)| -> Result<DecisionRow> {
                    row.evidence = serde_json::from_str(&evidence)?;
                    Ok(row)
                })
                .collect()
        })
    }

    pub fn receipts(&self, run_id: &RunId) -> QueryResult<Vec<ReceiptRow>> {
        self.query_run(run_id, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT run_id, step_seq, step_id, engine, backend_id, status, duration_ms,
                            input_tokens, output_tokens, path
                     FROM receipts WHERE run_id = ?1 ORDER BY step_seq",
                )
                .map_err(proj_err)?;
            let rows = stmt
                .query_map(params![run_id.as_str()], |row| {
                    Ok(ReceiptRow {
                        run_id: row.get(0)?,
                        step_seq: row.get::<_, i64>(1)? as u64,
                        step_id: row.get(2)?,
                        engine: row.get(3)?,
                        backend_id: row.get(4)?,
                        status: row.get(5)?,
                        duration_ms: row.get::<_, i64>(6)? as u64,
                        input_tokens: row.get::<_, i64>(7)? as u64,
                        output_tokens: row.get::<_, i64>(8)? as u64,
                        path: row.get(9)?,
                    })
                })
                .map_err(proj_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(proj_err)?;
            Ok(rows)
        })
    }

    fn query_run<T: Default>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> QueryResult<T> {
        let result = self.conn.lock().map_err(proj_err).and_then(|conn| {
            let data = f(&conn)?;
            let projected = load_run(&conn, run_id.as_str())?.map_or(0, |r| r.last_sequence);
            Ok((data, projected))
        });
        match result {
            Ok((data, projected)) => QueryResult {
                data,
                freshness: self.freshness_of(run_id, projected),
            },
            Err(e) => unavailable(T::default(), e),
        }
    }

    fn freshness_of(&self, run_id: &RunId, projected: u64) -> Freshness {
        match self.journal.head(run_id) {
            Ok(head) if head == projected => Freshness::Current,
            _ => Freshness::Stale,
        }
    }

    fn projected_head(&self, run_id: &RunId) -> Result<u64> {
        let conn = self.conn.lock().map_err(proj_err)?;
        Ok(load_run(&conn, run_id.as_str())?.map_or(0, |r| r.last_sequence))
    }

    fn schema_version(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().map_err(proj_err)?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(proj_err)?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    #[cfg(test)]
    fn set_schema_version(&self, version: i64) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
            params![version.to_string()],
        )
        .unwrap();
    }
}

fn unavailable<T>(data: T, e: StepflowError) -> QueryResult<T> {
    warn!(error = %e, "Projection query degraded");
    QueryResult {
        data,
        freshness: Freshness::Unavailable,
    }
}

fn open_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(proj_err)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .map_err(proj_err)?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA).map_err(proj_err)?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )
    .map_err(proj_err)?;
    Ok(())
}

const RUN_COLUMNS: &str = "run_id, flow_id, flow_version, status, current_node, depth, \
    steps_completed, created_at, updated_at, last_sequence, error";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    let status: String = row.get(3)?;
    Ok(RunRow {
        run_id: row.get(0)?,
        flow_id: row.get(1)?,
        flow_version: row.get::<_, i64>(2)? as u32,
        status: RunStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown run status '{}'", status).into(),
            )
        })?,
        current_node: row.get(4)?,
        depth: row.get::<_, i64>(5)? as usize,
        steps_completed: row.get::<_, i64>(6)? as u64,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        last_sequence: row.get::<_, i64>(9)? as u64,
        error: row.get(10)?,
    })
}

fn load_run(conn: &Connection, run_id: &str) -> Result<Option<RunRow>> {
    conn.query_row(
        &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
        params![run_id],
        run_from_row,
    )
    .optional()
    .map_err(proj_err)
}

fn delete_run(tx: &Transaction<'_>, run_id: &str) -> Result<()> {
    for table in ["runs", "steps", "decisions", "receipts"] {
        tx.execute(
            &format!("DELETE FROM {} WHERE run_id = ?1", table),
            params![run_id],
        )
        .map_err(proj_err)?;
    }
    Ok(())
}

fn write_projection(tx: &Transaction<'_>, p: &RunProjection) -> Result<()> {
    let Some(run) = &p.run else {
        return Ok(());
    };

    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            RUN_COLUMNS
        ),
        params![
            run.run_id,
            run.flow_id,
            run.flow_version as i64,
            run.status.as_str(),
            run.current_node,
            run.depth as i64,
            run.steps_completed as i64,
            run.created_at,
            run.updated_at,
            run.last_sequence as i64,
            run.error,
        ],
    )
    .map_err(proj_err)?;

    for step in p.steps.values() {
        tx.execute(
            "INSERT INTO steps (run_id, step_seq, node_id, flow_id, status, started_sequence,
                                ended_sequence, summary, error_kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (run_id, step_seq) DO UPDATE SET
                 status = excluded.status,
                 started_sequence = COALESCE(steps.started_sequence, excluded.started_sequence),
                 ended_sequence = COALESCE(excluded.ended_sequence, steps.ended_sequence),
                 summary = COALESCE(excluded.summary, steps.summary),
                 error_kind = COALESCE(excluded.error_kind, steps.error_kind)",
            params![
                step.run_id,
                step.step_seq as i64,
                step.node_id,
                step.flow_id,
                step.status,
                step.started_sequence.map(|v| v as i64),
                step.ended_sequence.map(|v| v as i64),
                step.summary,
                step.error_kind,
            ],
        )
        .map_err(proj_err)?;
    }

    // Rows from earlier passes are not in memory; close abandoned ones here.
    tx.execute(
        "UPDATE steps SET status = ?2
         WHERE run_id = ?1 AND status = ?3
           AND step_seq < (SELECT MAX(step_seq) FROM steps
                           WHERE run_id = ?1 AND started_sequence IS NOT NULL)",
        params![run.run_id, STEP_INTERRUPTED, STEP_RUNNING],
    )
    .map_err(proj_err)?;

    for d in &p.decisions {
        tx.execute(
            "INSERT OR REPLACE INTO decisions (run_id, sequence, step_seq, from_node, flow_id, kind,
                                               target, source, justification, evidence,
                                               resulting_depth, next_node)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                d.run_id,
                d.sequence as i64,
                d.step_seq as i64,
                d.from_node,
                d.flow_id,
                d.kind,
                d.target,
                d.source,
                d.justification,
                serde_json::to_string(&d.evidence)?,
                d.resulting_depth as i64,
                d.next_node,
            ],
        )
        .map_err(proj_err)?;
    }

    for r in &p.receipts {
        tx.execute(
            "INSERT OR REPLACE INTO receipts (run_id, step_seq, step_id, engine, backend_id, status,
                                              duration_ms, input_tokens, output_tokens, path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                r.run_id,
                r.step_seq as i64,
                r.step_id,
                r.engine,
                r.backend_id,
                r.status,
                r.duration_ms as i64,
                r.input_tokens as i64,
                r.output_tokens as i64,
                r.path,
            ],
        )
        .map_err(proj_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use stepflow_core::event::{EventKind, RunCreated, StepEnd, StepStart};
    use stepflow_core::flow::{FlowGraph, Node};
    use stepflow_core::types::StepResult;

    fn seed(journal: &MemoryJournal, run: &RunId) {
        let graph = FlowGraph::linear("f", vec![Node::new("a", "author"), Node::new("b", "critic")]);
        journal
            .append(
                run,
                EventKind::RunCreated,
                serde_json::to_value(RunCreated {
                    graph,
                    entry: "a".into(),
                    goal: None,
                    engine: "scripted".into(),
                    max_stack_depth: 3,
                })
                .unwrap(),
            )
            .unwrap();
        journal
            .append(
                run,
                EventKind::StepStart,
                serde_json::to_value(StepStart {
                    node_id: "a".into(),
                    flow_id: "f".into(),
                    step_seq: 1,
                    iteration: 0,
                    depth: 0,
                })
                .unwrap(),
            )
            .unwrap();
    }

    fn finish_step(journal: &MemoryJournal, run: &RunId) {
        journal
            .append(
                run,
                EventKind::StepEnd,
                serde_json::to_value(StepEnd {
                    node_id: "a".into(),
                    flow_id: "f".into(),
                    step_seq: 1,
                    role: "author".into(),
                    result: StepResult::succeeded("draft"),
                })
                .unwrap(),
            )
            .unwrap();
    }

    fn store() -> (Arc<MemoryJournal>, ProjectionStore) {
        let journal = Arc::new(MemoryJournal::new());
        let store = ProjectionStore::in_memory(journal.clone()).unwrap();
        (journal, store)
    }

    #[test]
    fn test_rebuild_twice_is_identical() {
        let (journal, store) = store();
        let run = RunId::from_string("r1");
        seed(&journal, &run);
        finish_step(&journal, &run);

        store.rebuild(&run).unwrap();
        let first = serde_json::to_string(&(store.run(&run), store.steps(&run))).unwrap();
        store.rebuild(&run).unwrap();
        let second = serde_json::to_string(&(store.run(&run), store.steps(&run))).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.steps(&run).freshness, Freshness::Current);
    }

    #[test]
    fn test_sync_catches_up_incrementally() {
        let (journal, store) = store();
        let run = RunId::from_string("r1");
        seed(&journal, &run);

        assert_eq!(store.sync(&run).unwrap(), 2);
        assert_eq!(store.steps(&run).data[0].status, "running");

        finish_step(&journal, &run);
        assert_eq!(store.steps(&run).freshness, Freshness::Stale);
        assert_eq!(store.sync(&run).unwrap(), 1);
        assert_eq!(store.sync(&run).unwrap(), 0);

        let steps = store.steps(&run);
        assert_eq!(steps.freshness, Freshness::Current);
        assert_eq!(steps.data[0].status, "succeeded");
        assert_eq!(steps.data[0].started_sequence, Some(2));

        let synced = serde_json::to_string(&store.steps(&run).data).unwrap();
        store.rebuild(&run).unwrap();
        let rebuilt = serde_json::to_string(&store.steps(&run).data).unwrap();
        assert_eq!(synced, rebuilt);
    }

    #[test]
    fn test_health_reports_lagging_runs_and_schema() {
        let (journal, store) = store();
        let run = RunId::from_string("r1");
        seed(&journal, &run);

        match store.health() {
            ProjectionHealth::NeedsRebuild { reasons } => {
                assert!(reasons[0].contains("journal is at 2"));
            }
            ProjectionHealth::Ok => panic!("expected stale projection"),
        }

        assert_eq!(store.rebuild_all().unwrap(), 1);
        assert!(store.health().is_ok());

        store.set_schema_version(99);
        assert!(!store.health().is_ok());
        store.rebuild_all().unwrap();
        assert!(store.health().is_ok());
    }

    #[test]
    fn test_corrupt_file_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projection.db");
        std::fs::write(&path, vec![0x42u8; 8192]).unwrap();

        let journal = Arc::new(MemoryJournal::new());
        let run = RunId::from_string("r1");
        seed(&journal, &run);

        let store = ProjectionStore::open(&path, journal).unwrap();
        assert_eq!(store.run(&run).freshness, Freshness::Stale);
        store.rebuild_all().unwrap();
        let row = store.run(&run);
        assert_eq!(row.freshness, Freshness::Current);
        assert_eq!(row.data.unwrap().current_node.as_deref(), Some("a"));
    }

    #[test]
    fn test_unknown_run_is_empty() {
        let (_journal, store) = store();
        let result = store.decisions(&RunId::from_string("ghost"));
        assert!(result.data.is_empty());
        assert_eq!(result.freshness, Freshness::Current);
    }

    #[test]
    fn test_sync_closes_step_abandoned_by_crash() {
        let (journal, store) = store();
        let run = RunId::from_string("r1");
        seed(&journal, &run);
        store.sync(&run).unwrap();
        assert_eq!(store.steps(&run).data[0].status, "running");

        // Recovery runs node `a` again under the next step sequence.
        journal
            .append(
                &run,
                EventKind::StepStart,
                serde_json::to_value(StepStart {
                    node_id: "a".into(),
                    flow_id: "f".into(),
                    step_seq: 2,
                    iteration: 0,
                    depth: 0,
                })
                .unwrap(),
            )
            .unwrap();
        assert_eq!(store.sync(&run).unwrap(), 1);

        let synced = store.steps(&run).data;
        let statuses: Vec<&str> = synced.iter().map(|s| s.status.as_str()).collect();
        assert_eq!(statuses, vec!["interrupted", "running"]);

        store.rebuild(&run).unwrap();
        assert_eq!(store.steps(&run).data, synced);
    }
}
