//! # Stage: Version Store
//!
//! ## Responsibility
//! Durable home of the version history and the cycle audit log.  The
//! [`VersionStore`] trait is the seam; [`SqliteStore`] is the production
//! backend, [`MemoryStore`] backs tests and ephemeral runs.
//!
//! ## Guarantees
//! - Atomic: `commit_versions` writes all rows in one transaction or none
//! - Append-only audit: cycle records are inserted, never updated
//! - Restartable: `load_versions` returns everything needed to rebuild the
//!   active pointers, ordered by id
//!
//! ## NOT Responsible For
//! - Enforcing the single-active invariant (that is the version manager)
//! - Raw observations (those are ephemeral in the metric store)

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags};

use crate::control::CycleRecord;
use crate::error::{GovernorError, Result};
use crate::self_tune::version::Version;

// ---------------------------------------------------------------------------
// VersionStore trait
// ---------------------------------------------------------------------------

/// Persistence contract for versions and cycle records.
pub trait VersionStore: Send + Sync {
    /// Upsert every version in `versions` atomically.
    fn commit_versions(&self, versions: &[Version]) -> Result<()>;
    /// Every stored version across all tasks, ordered by id.
    fn load_versions(&self) -> Result<Vec<Version>>;
    /// Append one record to the audit log.
    fn append_cycle(&self, record: &CycleRecord) -> Result<()>;
    /// Records for `task_id` in append order.
    fn load_cycles(&self, task_id: &str) -> Result<Vec<CycleRecord>>;
    /// Make everything written so far durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store.  Supports write-failure injection for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    versions: Mutex<BTreeMap<u64, Version>>,
    cycles: Mutex<Vec<CycleRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GovernorError::Persistence("injected write failure".into()));
        }
        Ok(())
    }
}

fn poisoned() -> GovernorError {
    GovernorError::Persistence("store lock poisoned".into())
}

impl VersionStore for MemoryStore {
    fn commit_versions(&self, versions: &[Version]) -> Result<()> {
        self.check_writable()?;
        let mut map = self.versions.lock().map_err(|_| poisoned())?;
        for v in versions {
            map.insert(v.id, v.clone());
        }
        Ok(())
    }

    fn load_versions(&self) -> Result<Vec<Version>> {
        Ok(self.versions.lock().map_err(|_| poisoned())?.values().cloned().collect())
    }

    fn append_cycle(&self, record: &CycleRecord) -> Result<()> {
        self.check_writable()?;
        self.cycles.lock().map_err(|_| poisoned())?.push(record.clone());
        Ok(())
    }

    fn load_cycles(&self, task_id: &str) -> Result<Vec<CycleRecord>> {
        Ok(self
            .cycles
            .lock()
            .map_err(|_| poisoned())?
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS versions (
  id INTEGER PRIMARY KEY,
  task_id TEXT NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('active', 'superseded', 'reverted')),
  version_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_versions_task ON versions(task_id, id);

CREATE TABLE IF NOT EXISTS cycle_records (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  cycle_id INTEGER NOT NULL UNIQUE,
  task_id TEXT NOT NULL,
  outcome TEXT NOT NULL,
  record_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cycles_task ON cycle_records(task_id, seq);
";

/// SQLite-backed store; JSON columns carry the full records.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a database that must already exist.  Never creates a file.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(path, flags)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA_V1)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl VersionStore for SqliteStore {
    fn commit_versions(&self, versions: &[Version]) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|_| poisoned())?;
        let tx = conn.transaction()?;
        for v in versions {
            tx.execute(
                "INSERT INTO versions (id, task_id, state, version_json) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET state = excluded.state, version_json = excluded.version_json",
                params![v.id as i64, v.task_id, v.state.to_string(), serde_json::to_string(v)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_versions(&self) -> Result<Vec<Version>> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let mut stmt = conn.prepare("SELECT version_json FROM versions ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    fn append_cycle(&self, record: &CycleRecord) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.execute(
            "INSERT INTO cycle_records (cycle_id, task_id, outcome, record_json) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.cycle_id as i64,
                record.task_id,
                record.final_outcome.to_string(),
                serde_json::to_string(record)?
            ],
        )?;
        Ok(())
    }

    fn load_cycles(&self, task_id: &str) -> Result<Vec<CycleRecord>> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let mut stmt = conn.prepare("SELECT record_json FROM cycle_records WHERE task_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
