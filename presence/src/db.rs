use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::tracker::PresenceChange;

/// SQLite store for presence intervals.
///
/// Schema: `persons` (one row per name) and `presence` (one row per
/// interval, timestamps in Unix millis). WAL mode is enabled so the capture
/// thread (writer) and API handlers (readers, on their own connections) do
/// not block each other.
pub struct PresenceDb {
    conn: Mutex<Connection>,
    /// Row id of the open interval per person, for this process only.
    open_ids: Mutex<HashMap<String, i64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredInterval {
    pub id: i64,
    pub person: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub open: bool,
}

/// Open a connection to the presence database with the pragmas every
/// handle needs. Used directly by read-side callers.
pub fn open_connection(path: &Path) -> SqlResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

impl PresenceDb {
    /// Open (or create) the database at `path`, creating parent directories.
    ///
    /// Intervals left open by a previous process are closed: presence does
    /// not carry over restarts.
    pub fn open(path: &Path) -> SqlResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|_e| rusqlite::Error::InvalidPath(dir.into()))?;
        }

        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS persons (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                name    TEXT    NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS presence (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                person_id       INTEGER NOT NULL REFERENCES persons(id),
                first_seen_ms   INTEGER NOT NULL,
                last_seen_ms    INTEGER NOT NULL,
                open            INTEGER NOT NULL DEFAULT 1,
                CHECK (first_seen_ms <= last_seen_ms)
            );
            CREATE INDEX IF NOT EXISTS idx_presence_person
                ON presence(person_id, first_seen_ms);

            PRAGMA foreign_keys = ON;",
        )?;

        let dangling = conn.execute("UPDATE presence SET open = 0 WHERE open = 1", [])?;
        if dangling > 0 {
            warn!(dangling, "closed presence intervals left open by a previous run");
        }

        info!(path = path.display().to_string(), "SQLite presence database opened");

        Ok(Self {
            conn: Mutex::new(conn),
            open_ids: Mutex::new(HashMap::new()),
        })
    }

    /// Insert a new open interval for `person`. Returns the new row id.
    pub fn create_interval(&self, person: &str, at: DateTime<Utc>) -> SqlResult<i64> {
        let conn = self.conn.lock().expect("presence db lock poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO persons (name) VALUES (?1)",
            params![person],
        )?;
        let person_id: i64 = conn.query_row(
            "SELECT id FROM persons WHERE name = ?1",
            params![person],
            |row| row.get(0),
        )?;
        let ms = at.timestamp_millis();
        conn.execute(
            "INSERT INTO presence (person_id, first_seen_ms, last_seen_ms, open)
             VALUES (?1, ?2, ?2, 1)",
            params![person_id, ms],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, person, at_ms = ms, "inserted presence interval");
        Ok(id)
    }

    /// Move `last_seen` of interval `id` forward to `at`. Never moves it back.
    pub fn extend_interval(&self, id: i64, at: DateTime<Utc>) -> SqlResult<bool> {
        let conn = self.conn.lock().expect("presence db lock poisoned");
        let changed = conn.execute(
            "UPDATE presence SET last_seen_ms = MAX(last_seen_ms, ?1) WHERE id = ?2",
            params![at.timestamp_millis(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn close_interval(&self, id: i64) -> SqlResult<bool> {
        let conn = self.conn.lock().expect("presence db lock poisoned");
        let changed = conn.execute("UPDATE presence SET open = 0 WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Mirror one tracker change into the store.
    pub fn apply(&self, change: &PresenceChange) -> SqlResult<()> {
        let mut open_ids = self.open_ids.lock().expect("presence db lock poisoned");
        match change {
            PresenceChange::Opened { person, at } => {
                let id = self.create_interval(person, *at)?;
                open_ids.insert(person.clone(), id);
            }
            PresenceChange::Extended { person, at } => match open_ids.get(person) {
                Some(&id) => {
                    self.extend_interval(id, *at)?;
                }
                None => {
                    // The opening write failed earlier; start a row now.
                    let id = self.create_interval(person, *at)?;
                    open_ids.insert(person.clone(), id);
                }
            },
            PresenceChange::Closed { person, .. } => {
                if let Some(id) = open_ids.remove(person) {
                    self.close_interval(id)?;
                }
            }
        }
        Ok(())
    }

    pub fn list_intervals(&self, person: Option<&str>, limit: u32) -> SqlResult<Vec<StoredInterval>> {
        let conn = self.conn.lock().expect("presence db lock poisoned");
        query_intervals(&conn, person, limit)
    }
}

/// Most recent intervals first, optionally for a single person.
pub fn query_intervals(
    conn: &Connection,
    person: Option<&str>,
    limit: u32,
) -> SqlResult<Vec<StoredInterval>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, s.name, p.first_seen_ms, p.last_seen_ms, p.open
         FROM presence p JOIN persons s ON s.id = p.person_id
         WHERE (?1 IS NULL OR s.name = ?1)
         ORDER BY p.first_seen_ms DESC, p.id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![person, limit.min(1000)], row_to_interval)?;
    rows.collect()
}

/// Look up a single interval by row id.
pub fn get_interval(conn: &Connection, id: i64) -> SqlResult<Option<StoredInterval>> {
    conn.query_row(
        "SELECT p.id, s.name, p.first_seen_ms, p.last_seen_ms, p.open
         FROM presence p JOIN persons s ON s.id = p.person_id
         WHERE p.id = ?1",
        params![id],
        row_to_interval,
    )
    .optional()
}

fn row_to_interval(row: &rusqlite::Row<'_>) -> SqlResult<StoredInterval> {
    let first_ms: i64 = row.get(2)?;
    let last_ms: i64 = row.get(3)?;
    Ok(StoredInterval {
        id: row.get(0)?,
        person: row.get(1)?,
        first_seen: from_millis(first_ms),
        last_seen: from_millis(last_ms),
        open: row.get::<_, i64>(4)? != 0,
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn temp_db() -> (tempfile::TempDir, PresenceDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = PresenceDb::open(&dir.path().join("nested").join("presence.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn applies_tracker_changes() {
        let (_dir, db) = temp_db();
        db.apply(&PresenceChange::Opened {
            person: "alice".into(),
            at: t(0),
        })
        .unwrap();
        db.apply(&PresenceChange::Extended {
            person: "alice".into(),
            at: t(2),
        })
        .unwrap();

        let rows = db.list_intervals(None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].person, "alice");
        assert_eq!(rows[0].first_seen, t(0));
        assert_eq!(rows[0].last_seen, t(2));
        assert!(rows[0].open);

        db.apply(&PresenceChange::Closed {
            person: "alice".into(),
            first_seen: t(0),
            last_seen: t(2),
        })
        .unwrap();
        assert!(!db.list_intervals(Some("alice"), 10).unwrap()[0].open);
    }

    #[test]
    fn extend_never_moves_backwards() {
        let (_dir, db) = temp_db();
        let id = db.create_interval("bob", t(10)).unwrap();
        db.extend_interval(id, t(20)).unwrap();
        db.extend_interval(id, t(15)).unwrap();
        let rows = db.list_intervals(Some("bob"), 10).unwrap();
        assert_eq!(rows[0].last_seen, t(20));
    }

    #[test]
    fn filters_by_person_and_orders_newest_first() {
        let (_dir, db) = temp_db();
        db.create_interval("alice", t(0)).unwrap();
        db.create_interval("bob", t(5)).unwrap();
        db.create_interval("alice", t(10)).unwrap();

        let alice = db.list_intervals(Some("alice"), 10).unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].first_seen, t(10));
        assert_eq!(db.list_intervals(None, 2).unwrap().len(), 2);
    }

    #[test]
    fn reopening_closes_dangling_intervals_and_reads_from_separate_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.db");
        let id = {
            let db = PresenceDb::open(&path).unwrap();
            db.create_interval("carol", t(0)).unwrap()
        };

        let _db = PresenceDb::open(&path).unwrap();
        let reader = open_connection(&path).unwrap();
        let row = get_interval(&reader, id).unwrap().unwrap();
        assert_eq!(row.person, "carol");
        assert!(!row.open);
        assert!(get_interval(&reader, id + 100).unwrap().is_none());
    }
}
