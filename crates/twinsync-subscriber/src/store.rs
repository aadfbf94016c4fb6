//! `SQLite`-backed session state persistence.
//!
//! One record per key: the last applied version and the payload at that
//! version. Writes go through `INSERT OR REPLACE` inside SQLite's implicit
//! transaction, so a crash mid-update never corrupts the previous record.

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::Mutex;
use twinsync_core::{SessionState, TwinKey};

/// Location column value standing in for a global key. SQLite treats NULLs
/// as distinct in primary keys, so the absence is encoded explicitly.
const GLOBAL_LOCATION: &str = "";

/// `SQLite`-backed session store.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open or create a session database.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory session store (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.lock().expect("session store lock").execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS twin_sessions (
                namespace TEXT NOT NULL,
                location TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, location)
            );
            ",
        )?;

        Ok(())
    }

    /// Load the persisted state for a key, or the empty state if never seen.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn load(&self, key: &TwinKey) -> SqliteResult<SessionState> {
        let conn = self.conn.lock().expect("session store lock");
        let mut stmt = conn.prepare(
            r"
            SELECT version, payload FROM twin_sessions
            WHERE namespace = ?1 AND location = ?2
            ",
        )?;

        let row: Option<(u64, Vec<u8>)> = stmt
            .query_row((&key.namespace, location_column(key)), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        Ok(match row {
            Some((version, payload)) => SessionState {
                key: key.clone(),
                last_applied_version: version,
                cached_payload: payload,
            },
            None => SessionState::empty(key.clone()),
        })
    }

    /// Atomically replace the persisted state for a key.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn record(&self, key: &TwinKey, version: u64, payload: &[u8]) -> SqliteResult<()> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        self.conn.lock().expect("session store lock").execute(
            r"
            INSERT OR REPLACE INTO twin_sessions (namespace, location, version, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            (
                &key.namespace,
                location_column(key),
                to_i64(version)?,
                payload,
                to_i64(now)?,
            ),
        )?;

        Ok(())
    }

    /// Remove the persisted state for a key.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub fn forget(&self, key: &TwinKey) -> SqliteResult<()> {
        self.conn.lock().expect("session store lock").execute(
            r"
            DELETE FROM twin_sessions
            WHERE namespace = ?1 AND location = ?2
            ",
            (&key.namespace, location_column(key)),
        )?;

        Ok(())
    }

    /// All persisted session records.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn list(&self) -> SqliteResult<Vec<SessionState>> {
        let conn = self.conn.lock().expect("session store lock");
        let mut stmt = conn.prepare(
            r"
            SELECT namespace, location, version, payload FROM twin_sessions
            ORDER BY namespace, location
            ",
        )?;

        let states = stmt
            .query_map([], |row| {
                let namespace: String = row.get(0)?;
                let location: String = row.get(1)?;
                let version: u64 = row.get(2)?;
                let payload: Vec<u8> = row.get(3)?;
                Ok(SessionState {
                    key: TwinKey::new(
                        namespace,
                        if location == GLOBAL_LOCATION {
                            None
                        } else {
                            Some(location)
                        },
                    ),
                    last_applied_version: version,
                    cached_payload: payload,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(states)
    }
}

fn location_column(key: &TwinKey) -> &str {
    key.location.as_deref().unwrap_or(GLOBAL_LOCATION)
}

fn to_i64(value: u64) -> SqliteResult<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_unseen_key_is_empty() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let state = store.load(&TwinKey::global("alpha")).unwrap();

        assert_eq!(state.last_applied_version, 0);
        assert!(!state.has_cache());
    }

    #[test]
    fn record_overwrites_previous_state() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let key = TwinKey::scoped("alpha", "zone-1");

        store.record(&key, 1, b"one").unwrap();
        store.record(&key, 2, b"two").unwrap();

        let state = store.load(&key).unwrap();
        assert_eq!(state.last_applied_version, 2);
        assert_eq!(state.cached_payload, b"two");
    }

    #[test]
    fn global_and_scoped_keys_are_distinct_records() {
        let store = SqliteSessionStore::in_memory().unwrap();

        store.record(&TwinKey::global("alpha"), 1, b"global").unwrap();
        store.record(&TwinKey::scoped("alpha", "zone-1"), 5, b"zoned").unwrap();

        assert_eq!(store.load(&TwinKey::global("alpha")).unwrap().last_applied_version, 1);
        assert_eq!(
            store.load(&TwinKey::scoped("alpha", "zone-1")).unwrap().last_applied_version,
            5
        );
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn forget_removes_the_record() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let key = TwinKey::global("alpha");

        store.record(&key, 3, b"payload").unwrap();
        store.forget(&key).unwrap();

        assert!(!store.load(&key).unwrap().has_cache());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let key = TwinKey::global("alpha");

        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store.record(&key, 5, b"persisted").unwrap();
        }

        let store = SqliteSessionStore::open(&path).unwrap();
        let state = store.load(&key).unwrap();
        assert_eq!(state.last_applied_version, 5);
        assert_eq!(state.cached_payload, b"persisted");
    }
}
