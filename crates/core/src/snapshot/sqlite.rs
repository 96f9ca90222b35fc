//! SQLite-backed snapshot store.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tracing::{info, warn};

use super::{Snapshot, SnapshotError, SnapshotStore};
use crate::approval::Approval;
use crate::job::Job;
use crate::recovery::ResettableResource;

/// Snapshot store persisting jobs and approvals as JSON records.
pub struct SqliteSnapshotStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open (or create) the snapshot database at `path`.
    pub fn new(path: &Path) -> Result<Self, SnapshotError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SnapshotError::Database(format!("create {}: {}", parent.display(), e)))?;
        }
        let conn = Self::open(Some(path))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory snapshot store (useful for testing).
    pub fn in_memory() -> Result<Self, SnapshotError> {
        let conn = Self::open(None)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    fn open(path: Option<&Path>) -> Result<Connection, SnapshotError> {
        let conn = match path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(|e| SnapshotError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(conn)
    }

    fn initialize_schema(conn: &Connection) -> Result<(), SnapshotError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_approvals_job_id ON approvals(job_id);
            "#,
        )
        .map_err(|e| SnapshotError::Database(e.to_string()))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SnapshotError> {
        self.conn
            .lock()
            .map_err(|_| SnapshotError::Database("snapshot connection lock poisoned".to_string()))
    }

    /// Location of the database file, if not in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn db_err(e: rusqlite::Error) -> SnapshotError {
    SnapshotError::Database(e.to_string())
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        tx.execute("DELETE FROM jobs", []).map_err(db_err)?;
        tx.execute("DELETE FROM approvals", []).map_err(db_err)?;

        {
            let mut insert_job = tx
                .prepare("INSERT INTO jobs (id, status, data, updated_at) VALUES (?1, ?2, ?3, ?4)")
                .map_err(db_err)?;
            for job in &snapshot.jobs {
                let data = serde_json::to_string(job)
                    .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
                insert_job
                    .execute(params![
                        job.id,
                        job.status.as_str(),
                        data,
                        job.updated_at.to_rfc3339()
                    ])
                    .map_err(db_err)?;
            }

            let mut insert_approval = tx
                .prepare("INSERT INTO approvals (id, job_id, status, data) VALUES (?1, ?2, ?3, ?4)")
                .map_err(db_err)?;
            for approval in &snapshot.approvals {
                let data = serde_json::to_string(approval)
                    .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
                insert_approval
                    .execute(params![
                        approval.id,
                        approval.job_id,
                        approval.status.as_str(),
                        data
                    ])
                    .map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)
    }

    fn load(&self) -> Result<Snapshot, SnapshotError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT id, data FROM jobs ORDER BY updated_at")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?;
        let mut jobs = Vec::new();
        for row in rows {
            let (id, data) = row.map_err(db_err)?;
            match serde_json::from_str::<Job>(&data) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job record {}: {}", id, e),
            }
        }

        let mut stmt = conn
            .prepare("SELECT id, data FROM approvals")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?;
        let mut approvals = Vec::new();
        for row in rows {
            let (id, data) = row.map_err(db_err)?;
            match serde_json::from_str::<Approval>(&data) {
                Ok(approval) => approvals.push(approval),
                Err(e) => warn!("Skipping unreadable approval record {}: {}", id, e),
            }
        }

        Ok(Snapshot { jobs, approvals })
    }
}

impl ResettableResource for SqliteSnapshotStore {
    fn name(&self) -> &str {
        "snapshot-store"
    }

    /// Drop the current connection and open a fresh one.
    fn reset(&self) -> Result<(), String> {
        let fresh = Self::open(self.path.as_deref()).map_err(|e| e.to_string())?;
        let mut conn = self.conn().map_err(|e| e.to_string())?;
        *conn = fresh;
        info!("Snapshot store connection reopened");
        Ok(())
    }
}
