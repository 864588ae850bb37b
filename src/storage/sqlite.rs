use crate::config::StorageConfig;
use crate::error::LeafError;
use crate::security::KeyName;
use crate::storage::{Database, DatabaseKind, Rud, stored_key};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Written to the SQLite header so other products' files are never adopted.
pub const APPLICATION_ID: i32 = 0x4C45_4146;

/// Forward-only schema revisions; revision `n` is `REVISIONS[n - 1]`.
const REVISIONS: &[&str] = &["CREATE TABLE key_value_store (
        kv_name TEXT PRIMARY KEY,
        kv_value TEXT NOT NULL
    )"];

const SELECT_VALUE: &str = "SELECT kv_value FROM key_value_store WHERE kv_name = ?1";
const UPSERT_VALUE: &str = "INSERT INTO key_value_store (kv_name, kv_value) VALUES (?1, ?2)
     ON CONFLICT(kv_name) DO UPDATE SET kv_value = excluded.kv_value";
const DELETE_VALUE: &str = "DELETE FROM key_value_store WHERE kv_name = ?1";

/// Pessimistic store on SQLite in WAL mode.
///
/// Each call opens its own connection, prepares its statements on it and
/// runs inside an `IMMEDIATE` transaction, so writers serialize on SQLite's
/// write lock instead of conflicting at commit.
pub struct SqliteDatabase {
    path: PathBuf,
    busy_timeout: Duration,
    synchronous: &'static str,
    closed: AtomicBool,
    close_lock: Mutex<()>,
}

impl SqliteDatabase {
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self, LeafError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Self {
            path: path.to_path_buf(),
            busy_timeout: Duration::from_millis(config.sqlite_busy_timeout_ms),
            synchronous: if config.fsync_commits { "FULL" } else { "NORMAL" },
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        };
        let mut conn = db.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(path = %db.path.display(), mode = %mode, "sqlite refused write-ahead logging");
        }
        let version = bootstrap_schema(&mut conn, &db.path)?;
        info!(path = %db.path.display(), version, "opened sqlite database");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, LeafError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "synchronous", self.synchronous)?;
        Ok(conn)
    }

    fn checked_connect(&self) -> Result<Connection, LeafError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LeafError::Closed);
        }
        self.connect()
    }
}

/// Brings the schema up to the newest revision in one transaction and
/// returns the resulting version.
fn bootstrap_schema(conn: &mut Connection, path: &Path) -> Result<usize, LeafError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let application_id: i32 = tx.pragma_query_value(None, "application_id", |row| row.get(0))?;
    if application_id != 0 && application_id != APPLICATION_ID {
        return Err(foreign(path, application_id));
    }
    tx.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version_application_id INTEGER NOT NULL,
            version_number INTEGER NOT NULL
        )",
        [],
    )?;
    let recorded: Option<(i32, i64)> = tx
        .query_row(
            "SELECT version_application_id, version_number FROM schema_version",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let current = match recorded {
        None => 0,
        Some((id, _)) if id != APPLICATION_ID => return Err(foreign(path, id)),
        Some((_, number)) => usize::try_from(number).map_err(|_| {
            LeafError::Storage(format!("{} records schema version {number}", path.display()))
        })?,
    };
    if current > REVISIONS.len() {
        return Err(LeafError::Storage(format!(
            "{} has schema version {current}, newer than supported {}",
            path.display(),
            REVISIONS.len()
        )));
    }

    for (index, revision) in REVISIONS.iter().enumerate().skip(current) {
        tx.execute_batch(revision)?;
        info!(path = %path.display(), revision = index + 1, "applied schema revision");
    }
    let latest = REVISIONS.len();
    if recorded.is_none() || current < latest {
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version (version_application_id, version_number) VALUES (?1, ?2)",
            params![APPLICATION_ID, latest as i64],
        )?;
    }
    tx.pragma_update(None, "application_id", APPLICATION_ID)?;
    tx.commit()?;
    Ok(latest)
}

fn foreign(path: &Path, application_id: i32) -> LeafError {
    LeafError::Storage(format!(
        "{} belongs to another application (id {application_id:#x})",
        path.display()
    ))
}

impl Database for SqliteDatabase {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn get(&self, key: &KeyName) -> Result<Option<String>, LeafError> {
        let mut conn = self.checked_connect()?;
        let tx = conn.transaction()?;
        let value = tx
            .prepare(SELECT_VALUE)?
            .query_row(params![key.as_str()], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn get_all(&self) -> Result<BTreeMap<KeyName, String>, LeafError> {
        let conn = self.checked_connect()?;
        let mut stmt =
            conn.prepare("SELECT kv_name, kv_value FROM key_value_store ORDER BY kv_name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut all = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            all.insert(stored_key(&name)?, value);
        }
        Ok(all)
    }

    fn read_update_delete(&self, rud: &Rud) -> Result<BTreeMap<KeyName, String>, LeafError> {
        let mut conn = self.checked_connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut values = BTreeMap::new();
        {
            let mut select = tx.prepare(SELECT_VALUE)?;
            for key in &rud.read {
                let value: Option<String> = select
                    .query_row(params![key.as_str()], |row| row.get(0))
                    .optional()?;
                if let Some(value) = value {
                    values.insert(key.clone(), value);
                }
            }
            let mut upsert = tx.prepare(UPSERT_VALUE)?;
            for (key, value) in &rud.update {
                upsert.execute(params![key.as_str(), value])?;
            }
            let mut delete = tx.prepare(DELETE_VALUE)?;
            for key in &rud.delete {
                delete.execute(params![key.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(values)
    }

    fn data_size_approximate(&self) -> Result<u64, LeafError> {
        let conn = self.checked_connect()?;
        let size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(kv_value AS BLOB))), 0) FROM key_value_store",
            [],
            |row| row.get(0),
        )?;
        Ok(size.max(0) as u64)
    }

    fn key_count_approximate(&self) -> Result<u64, LeafError> {
        let conn = self.checked_connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM key_value_store", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn close(&self) -> Result<(), LeafError> {
        let _guard = self.close_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conn = self.connect()?;
        if let Err(err) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
            warn!(path = %self.path.display(), error = %err, "wal checkpoint on close failed");
        }
        info!(path = %self.path.display(), "closed sqlite database");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::{APPLICATION_ID, REVISIONS, SqliteDatabase};
    use crate::config::StorageConfig;
    use crate::error::LeafError;
    use crate::security::KeyName;
    use crate::storage::{Database, Rud};
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn key(raw: &str) -> KeyName {
        KeyName::create(raw).expect("key")
    }

    #[test]
    fn fresh_store_is_stamped_with_application_and_version() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        SqliteDatabase::open(&path, &StorageConfig::default()).expect("open");

        let conn = Connection::open(&path).expect("conn");
        let id: i32 = conn
            .pragma_query_value(None, "application_id", |row| row.get(0))
            .expect("application id");
        assert_eq!(id, APPLICATION_ID);
        let (recorded_id, version): (i32, i64) = conn
            .query_row(
                "SELECT version_application_id, version_number FROM schema_version",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("version row");
        assert_eq!(recorded_id, APPLICATION_ID);
        assert_eq!(version, REVISIONS.len() as i64);
    }

    #[test]
    fn reopening_keeps_data_and_schema() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        {
            let db = SqliteDatabase::open(&path, &StorageConfig::default()).expect("open");
            db.read_update_delete(&Rud::updating(key("/a"), "1"))
                .expect("write");
            db.close().expect("close");
        }
        let db = SqliteDatabase::open(&path, &StorageConfig::default()).expect("reopen");
        assert_eq!(db.get(&key("/a")).expect("get").as_deref(), Some("1"));
        let conn = Connection::open(&path).expect("conn");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn foreign_application_id_is_refused() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("other.db");
        let conn = Connection::open(&path).expect("conn");
        conn.pragma_update(None, "application_id", 42)
            .expect("stamp");
        drop(conn);

        let err = SqliteDatabase::open(&path, &StorageConfig::default())
            .err()
            .expect("foreign store");
        assert!(matches!(err, LeafError::Storage(_)), "{err}");
        assert!(err.to_string().contains("another application"));
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        SqliteDatabase::open(&path, &StorageConfig::default()).expect("open");
        let conn = Connection::open(&path).expect("conn");
        conn.execute("UPDATE schema_version SET version_number = 99", [])
            .expect("bump");
        drop(conn);

        let err = SqliteDatabase::open(&path, &StorageConfig::default())
            .err()
            .expect("newer schema");
        assert!(err.to_string().contains("newer than supported"), "{err}");
    }

    #[test]
    fn each_call_prepares_on_its_own_connection() {
        let dir = tempdir().expect("tempdir");
        let db = SqliteDatabase::open(&dir.path().join("store.db"), &StorageConfig::default())
            .expect("open");
        for round in 0..3 {
            let mut rud = Rud::default();
            for i in 0..50 {
                rud.read.insert(key(&format!("/k/{i}")));
                rud.update.insert(key(&format!("/k/{i}")), format!("{round}"));
            }
            rud.delete.insert(key("/k/0"));
            let values = db.read_update_delete(&rud).expect("rud");
            let expected = if round == 0 { 0 } else { 49 };
            assert_eq!(values.len(), expected, "round {round}");
        }
        assert_eq!(db.key_count_approximate().expect("count"), 49);
    }

    #[test]
    fn data_size_counts_value_bytes() {
        let dir = tempdir().expect("tempdir");
        let db = SqliteDatabase::open(&dir.path().join("store.db"), &StorageConfig::default())
            .expect("open");
        let mut rud = Rud::default();
        rud.update.insert(key("/a"), "héllo".into());
        rud.update.insert(key("/b"), "xy".into());
        db.read_update_delete(&rud).expect("write");
        assert_eq!(db.data_size_approximate().expect("size"), 8);
        assert_eq!(db.key_count_approximate().expect("count"), 2);
    }
}
