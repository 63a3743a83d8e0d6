//! SQLite persistence.
//!
//! Implements the [`IdentityStore`] contract over a single SQLite
//! database: enrolled identities (descriptors as JSON float arrays),
//! per-day attendance rows, camera sources with liveness status, and
//! the unknown-face event log. Each call is one atomic statement or a
//! short statement pair on one connection; callers never span
//! transactions across calls.

use chrono::{DateTime, Local};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use vigil_camera::{CameraSpec, SourceKind};
use vigil_core::{CameraStatus, Descriptor, IdentityStore, KnownIdentity, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    descriptor TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    in_time TEXT,
    out_time TEXT,
    status TEXT,
    FOREIGN KEY(identity_id) REFERENCES identities(id)
);
CREATE TABLE IF NOT EXISTS cameras (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    target TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'offline'
);
CREATE TABLE IF NOT EXISTS unknown_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_path TEXT NOT NULL,
    date TEXT NOT NULL,
    time TEXT NOT NULL
);
";

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

/// One attendance row as stored.
#[derive(Debug, Clone)]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity_id: i64,
    pub date: String,
    pub in_time: Option<String>,
    pub out_time: Option<String>,
    pub status: Option<String>,
}

/// One unknown-face event as stored.
#[derive(Debug, Clone)]
pub struct UnknownEvent {
    pub id: i64,
    pub snapshot_path: String,
    pub date: String,
    pub time: String,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create all tables if missing. Safe to call on every startup.
    pub fn initialize(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(SCHEMA).map_err(db_err)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_identity(&self, name: &str, descriptor: &Descriptor) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(&descriptor.values)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO identities(name, descriptor) VALUES(?1, ?2)",
            (name, &payload),
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Remove an identity and its attendance history.
    pub fn remove_identity(&self, identity_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute("DELETE FROM attendance WHERE identity_id=?1", [identity_id])
            .map_err(db_err)?;
        conn.execute("DELETE FROM identities WHERE id=?1", [identity_id])
            .map_err(db_err)?;
        Ok(())
    }

    pub fn add_source(
        &self,
        name: &str,
        kind: SourceKind,
        target: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO cameras(name, kind, target, status) VALUES(?1, ?2, ?3, 'offline')",
            (name, kind.as_str(), target),
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn remove_source(&self, source_id: i64) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM cameras WHERE id=?1", [source_id])
            .map_err(db_err)?;
        Ok(())
    }

    /// All configured camera sources with their last persisted status.
    /// Rows whose kind string is unrecognized are skipped with a
    /// warning rather than failing the whole load.
    pub fn fetch_sources(&self) -> Result<Vec<(CameraSpec, CameraStatus)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name, kind, target, status FROM cameras ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?;

        let mut sources = Vec::new();
        for row in rows {
            let (id, name, kind, target, status) = row.map_err(db_err)?;
            let Some(kind) = SourceKind::parse(&kind) else {
                tracing::warn!(source = id, kind = %kind, "skipping source with unknown kind");
                continue;
            };
            let status = CameraStatus::parse(&status).unwrap_or(CameraStatus::Offline);
            sources.push((
                CameraSpec {
                    id,
                    name,
                    kind,
                    target,
                },
                status,
            ));
        }
        Ok(sources)
    }

    pub fn fetch_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, identity_id, date, in_time, out_time, status \
                 FROM attendance ORDER BY date DESC, id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AttendanceRecord {
                    id: row.get(0)?,
                    identity_id: row.get(1)?,
                    date: row.get(2)?,
                    in_time: row.get(3)?,
                    out_time: row.get(4)?,
                    status: row.get(5)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn fetch_unknowns(&self) -> Result<Vec<UnknownEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, snapshot_path, date, time \
                 FROM unknown_log ORDER BY date DESC, time DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UnknownEvent {
                    id: row.get(0)?,
                    snapshot_path: row.get(1)?,
                    date: row.get(2)?,
                    time: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}

impl IdentityStore for SqliteStore {
    fn fetch_known_identities(&self) -> Result<Vec<KnownIdentity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name, descriptor FROM identities ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut identities = Vec::new();
        for row in rows {
            let (id, name, payload) = row.map_err(db_err)?;
            let values: Vec<f32> = serde_json::from_str(&payload)
                .map_err(|e| StoreError::Encoding(format!("identity {id}: {e}")))?;
            identities.push(KnownIdentity {
                id,
                name,
                descriptor: Descriptor::new(values),
            });
        }
        Ok(identities)
    }

    fn upsert_check_in(&self, identity_id: i64, at: DateTime<Local>) -> Result<i64, StoreError> {
        let date = at.format(DATE_FMT).to_string();
        let time = at.format(TIME_FMT).to_string();
        let conn = self.conn();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM attendance WHERE identity_id=?1 AND date=?2",
                (identity_id, &date),
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        if let Some(id) = existing {
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO attendance(identity_id, date, in_time, status) VALUES(?1, ?2, ?3, 'present')",
            (identity_id, &date, &time),
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn set_check_out(&self, identity_id: i64, at: DateTime<Local>) -> Result<(), StoreError> {
        let date = at.format(DATE_FMT).to_string();
        let time = at.format(TIME_FMT).to_string();
        self.conn()
            .execute(
                "UPDATE attendance SET out_time=?1 WHERE identity_id=?2 AND date=?3",
                (&time, identity_id, &date),
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn log_unknown(&self, snapshot: &Path, at: DateTime<Local>) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO unknown_log(snapshot_path, date, time) VALUES(?1, ?2, ?3)",
            (
                snapshot.to_string_lossy().as_ref(),
                at.format(DATE_FMT).to_string(),
                at.format(TIME_FMT).to_string(),
            ),
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn set_source_status(&self, source_id: i64, status: CameraStatus) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE cameras SET status=?1 WHERE id=?2",
                (status.as_str(), source_id),
            )
            .map_err(db_err)?;
        Ok(())
    }
}
