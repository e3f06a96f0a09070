//! Durable group and VM state over SQLite.
//!
//! Two logical tables: `group_desired` (group id → desired size) and `vms`
//! (vmid → group, hostname, lifecycle state, timestamps). All mutations of a
//! VM's state go through [`StateDb::transition`], whose conditional `UPDATE`
//! serialises racing writers per vmid; desired-size writes go through
//! [`StateDb::cas_desired`]. The file is single-process, single-writer.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};

use crate::lifecycle::{self, VmState};
use crate::{Error, Result};

/// Table definitions, applied on every open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS group_desired (
    group_id TEXT PRIMARY KEY,
    desired  INTEGER NOT NULL
) STRICT;
CREATE TABLE IF NOT EXISTS vms (
    vmid               INTEGER PRIMARY KEY,
    group_id           TEXT NOT NULL,
    hostname           TEXT NOT NULL,
    state              TEXT NOT NULL,
    created_at         INTEGER NOT NULL,
    last_transition_at INTEGER NOT NULL,
    last_error         TEXT
) STRICT;
CREATE INDEX IF NOT EXISTS vms_group ON vms (group_id);
";

/// Persisted row for one managed VM.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct VmRecord {
    /// Proxmox-assigned cluster-wide VM identifier.
    pub vmid: u32,
    /// Owning group.
    pub group_id: String,
    /// Hostname baked into the seed ISO.
    pub hostname: String,
    /// Current lifecycle state.
    pub state: VmState,
    /// Unix seconds when the row was inserted.
    pub created_at: u64,
    /// Unix seconds of the last committed transition.
    pub last_transition_at: u64,
    /// Message from the most recent failure, if any.
    pub last_error: Option<String>,
}

impl VmRecord {
    /// Creates a fresh `pending` row for a VM about to be built.
    pub fn new(vmid: u32, group_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            vmid,
            group_id: group_id.into(),
            hostname: hostname.into(),
            state: VmState::Pending,
            created_at: now,
            last_transition_at: now,
            last_error: None,
        }
    }

    /// Same row in a different initial state (orphan adoption/teardown).
    #[must_use]
    pub fn with_state(mut self, state: VmState) -> Self {
        self.state = state;
        self
    }
}

/// SQLite-backed state database.
#[derive(Debug)]
pub struct StateDb {
    /// Single connection; SQLite serialises writers anyway and the store
    /// must be `Sync` for use from concurrent request handlers.
    conn: Mutex<Connection>,
}

impl StateDb {
    /// Opens (or creates) the state database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquires the connection, recovering from a poisoned lock.
    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the desired size for `group_id`, inserting `default_desired`
    /// on first observation of the group.
    pub fn ensure_group(&self, group_id: &str, default_desired: u32) -> Result<u32> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO group_desired (group_id, desired) VALUES (?1, ?2)",
            params![group_id, default_desired],
        )?;
        let desired = conn.query_row(
            "SELECT desired FROM group_desired WHERE group_id = ?1",
            params![group_id],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(desired)
    }

    /// Returns the desired size for `group_id`, or `None` if the group has
    /// never been observed.
    pub fn get_desired(&self, group_id: &str) -> Result<Option<u32>> {
        let desired = self
            .conn()
            .query_row(
                "SELECT desired FROM group_desired WHERE group_id = ?1",
                params![group_id],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        Ok(desired)
    }

    /// Compare-and-sets the desired size for `group_id`. Fails with
    /// [`Error::ConcurrentUpdate`] unless the stored value equals `expected`.
    pub fn cas_desired(&self, group_id: &str, expected: u32, new: u32) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE group_desired SET desired = ?3 WHERE group_id = ?1 AND desired = ?2",
            params![group_id, expected, new],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(Error::ConcurrentUpdate(group_id.to_owned()))
        }
    }

    /// Inserts a new VM row. Fails if the vmid is already tracked.
    pub fn insert_vm(&self, record: &VmRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO vms (vmid, group_id, hostname, state, created_at, last_transition_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.vmid,
                record.group_id,
                record.hostname,
                record.state.as_str(),
                record.created_at as i64,
                record.last_transition_at as i64,
                record.last_error,
            ],
        )?;
        Ok(())
    }

    /// Fetches a VM row by vmid.
    pub fn get_vm(&self, vmid: u32) -> Result<Option<VmRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT vmid, group_id, hostname, state, created_at, last_transition_at, last_error
                 FROM vms WHERE vmid = ?1",
                params![vmid],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Lists all VM rows belonging to `group_id`, oldest first.
    pub fn list_vms(&self, group_id: &str) -> Result<Vec<VmRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT vmid, group_id, hostname, state, created_at, last_transition_at, last_error
             FROM vms WHERE group_id = ?1 ORDER BY created_at, vmid",
        )?;
        let rows = stmt.query_map(params![group_id], row_to_record)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Lists every VM row, oldest first.
    pub fn list_all_vms(&self) -> Result<Vec<VmRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT vmid, group_id, hostname, state, created_at, last_transition_at, last_error
             FROM vms ORDER BY created_at, vmid",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Finds a live row by hostname within a group (fallback node lookup).
    pub fn find_by_hostname(&self, group_id: &str, hostname: &str) -> Result<Option<VmRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT vmid, group_id, hostname, state, created_at, last_transition_at, last_error
                 FROM vms WHERE group_id = ?1 AND hostname = ?2",
                params![group_id, hostname],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Commits a lifecycle transition. The transition must appear in the
    /// lifecycle table ([`Error::IllegalTransition`] otherwise) and the
    /// stored state must still equal `from` ([`Error::StaleState`] if a
    /// concurrent writer got there first).
    pub fn transition(
        &self,
        vmid: u32,
        from: VmState,
        to: VmState,
        last_error: Option<&str>,
    ) -> Result<()> {
        lifecycle::validate(from, to)?;
        let changed = self.conn().execute(
            "UPDATE vms SET state = ?3, last_transition_at = ?4, last_error = ?5
             WHERE vmid = ?1 AND state = ?2",
            params![vmid, from.as_str(), to.as_str(), unix_now() as i64, last_error],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(Error::StaleState {
                vmid,
                expected: from,
            })
        }
    }

    /// Removes a fully reclaimed VM row. Conditional on the row still being
    /// in `from` (normally [`VmState::DeletingNode`]).
    pub fn remove_vm(&self, vmid: u32, from: VmState) -> Result<()> {
        let changed = self.conn().execute(
            "DELETE FROM vms WHERE vmid = ?1 AND state = ?2",
            params![vmid, from.as_str()],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(Error::StaleState {
                vmid,
                expected: from,
            })
        }
    }
}

/// Maps a SQL row onto [`VmRecord`].
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VmRecord> {
    let state_text: String = row.get(3)?;
    let state = VmState::parse(&state_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown vm state {state_text:?}").into(),
        )
    })?;
    Ok(VmRecord {
        vmid: row.get(0)?,
        group_id: row.get(1)?,
        hostname: row.get(2)?,
        state,
        created_at: row.get::<_, i64>(4)? as u64,
        last_transition_at: row.get::<_, i64>(5)? as u64,
        last_error: row.get(6)?,
    })
}

/// Current time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, StateDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path().join("state.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn first_read_defaults_to_min_size() {
        let (_dir, db) = open_temp();
        assert_eq!(db.get_desired("web").unwrap(), None);
        assert_eq!(db.ensure_group("web", 2).unwrap(), 2);
        // Subsequent ensures keep the stored value, not the default.
        assert_eq!(db.ensure_group("web", 0).unwrap(), 2);
    }

    #[test]
    fn cas_desired_rejects_mismatched_expectation() {
        let (_dir, db) = open_temp();
        db.ensure_group("web", 1).unwrap();
        db.cas_desired("web", 1, 3).unwrap();
        let err = db.cas_desired("web", 1, 4).unwrap_err();
        assert!(matches!(err, Error::ConcurrentUpdate(_)));
        assert_eq!(db.get_desired("web").unwrap(), Some(3));
    }

    #[test]
    fn transition_is_conditional_on_stored_state() {
        let (_dir, db) = open_temp();
        db.insert_vm(&VmRecord::new(101, "web", "web-101")).unwrap();

        db.transition(101, VmState::Pending, VmState::Active, None)
            .unwrap();
        let err = db
            .transition(101, VmState::Pending, VmState::Failed, None)
            .unwrap_err();
        assert!(matches!(err, Error::StaleState { vmid: 101, .. }));
        assert_eq!(db.get_vm(101).unwrap().unwrap().state, VmState::Active);
    }

    #[test]
    fn illegal_transitions_never_touch_the_row() {
        let (_dir, db) = open_temp();
        db.insert_vm(&VmRecord::new(101, "web", "web-101")).unwrap();
        let err = db
            .transition(101, VmState::Pending, VmState::DeletingIso, None)
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(db.get_vm(101).unwrap().unwrap().state, VmState::Pending);
    }

    #[test]
    fn vmid_is_unique() {
        let (_dir, db) = open_temp();
        db.insert_vm(&VmRecord::new(101, "web", "web-101")).unwrap();
        assert!(db.insert_vm(&VmRecord::new(101, "db", "db-101")).is_err());
    }

    #[test]
    fn remove_is_conditional() {
        let (_dir, db) = open_temp();
        db.insert_vm(&VmRecord::new(101, "web", "web-101").with_state(VmState::DeletingNode))
            .unwrap();
        assert!(db.remove_vm(101, VmState::DeletingVm).is_err());
        db.remove_vm(101, VmState::DeletingNode).unwrap();
        assert_eq!(db.get_vm(101).unwrap(), None);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let db = StateDb::open(&path).unwrap();
            db.ensure_group("web", 0).unwrap();
            db.cas_desired("web", 0, 2).unwrap();
            db.insert_vm(&VmRecord::new(101, "web", "web-101")).unwrap();
        }
        let db = StateDb::open(&path).unwrap();
        assert_eq!(db.get_desired("web").unwrap(), Some(2));
        let vms = db.list_vms("web").unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].hostname, "web-101");
    }
}
