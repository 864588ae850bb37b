pub mod log;
pub mod mvcc;
pub mod sqlite;

use crate::config::StorageConfig;
use crate::error::LeafError;
use crate::security::KeyName;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

pub use mvcc::MvccDatabase;
pub use sqlite::SqliteDatabase;

/// One atomic read-update-delete unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rud {
    pub read: BTreeSet<KeyName>,
    pub update: BTreeMap<KeyName, String>,
    pub delete: BTreeSet<KeyName>,
}

impl Rud {
    pub fn reading(key: KeyName) -> Self {
        Self {
            read: BTreeSet::from([key]),
            ..Self::default()
        }
    }

    pub fn updating(key: KeyName, value: impl Into<String>) -> Self {
        Self {
            update: BTreeMap::from([(key, value.into())]),
            ..Self::default()
        }
    }

    pub fn deleting(key: KeyName) -> Self {
        Self {
            delete: BTreeSet::from([key]),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.update.is_empty() && self.delete.is_empty()
    }
}

/// The storage engine contract shared by every backend.
///
/// [`Database::read_update_delete`] is the central primitive: read a set of
/// keys, upsert a set of values, then delete a set of keys, all in one
/// atomic transaction.
///
/// Implementations must be safe to call from many threads at once. Calls
/// made after [`Database::close`] fail with [`LeafError::Closed`].
pub trait Database: Send + Sync {
    fn kind(&self) -> DatabaseKind;

    /// Point lookup in a read-only transaction that never commits.
    fn get(&self, key: &KeyName) -> Result<Option<String>, LeafError>;

    /// Every stored key and value. Best effort with respect to concurrent
    /// writers.
    fn get_all(&self) -> Result<BTreeMap<KeyName, String>, LeafError>;

    /// Atomically reads `rud.read`, upserts `rud.update`, then removes
    /// `rud.delete`. The result contains only the read keys that existed
    /// before this call's writes were applied.
    fn read_update_delete(&self, rud: &Rud) -> Result<BTreeMap<KeyName, String>, LeafError>;

    /// Approximate total size of stored values, in bytes.
    fn data_size_approximate(&self) -> Result<u64, LeafError>;

    fn key_count_approximate(&self) -> Result<u64, LeafError>;

    /// Idempotent; concurrent callers all return once the store is closed.
    fn close(&self) -> Result<(), LeafError>;

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DatabaseKind {
    /// Optimistic, in-process MVCC store with a commit log.
    #[default]
    MvStore,
    /// Pessimistic SQLite store in WAL mode.
    Sqlite,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 2] = [DatabaseKind::MvStore, DatabaseKind::Sqlite];

    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseKind::MvStore => "MVSTORE",
            DatabaseKind::Sqlite => "SQLITE",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = LeafError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatabaseKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                LeafError::config(format!(
                    "no database implementation available with kind '{s}'"
                ))
            })
    }
}

/// Rebuilds a key name read back from a store. Stored names were validated
/// on the way in, so a failure here means the store itself is damaged.
pub(crate) fn stored_key(raw: &str) -> Result<KeyName, LeafError> {
    KeyName::create(raw)
        .map_err(|e| LeafError::Storage(format!("store holds an invalid key: {e}")))
}

type OpenFn = fn(&Path, &StorageConfig) -> Result<Arc<dyn Database>, LeafError>;

fn open_mvstore(path: &Path, config: &StorageConfig) -> Result<Arc<dyn Database>, LeafError> {
    Ok(Arc::new(MvccDatabase::open(path, config)?))
}

fn open_sqlite(path: &Path, config: &StorageConfig) -> Result<Arc<dyn Database>, LeafError> {
    Ok(Arc::new(SqliteDatabase::open(path, config)?))
}

/// Consulted once, when the server starts.
const REGISTRY: &[(DatabaseKind, OpenFn)] = &[
    (DatabaseKind::MvStore, open_mvstore),
    (DatabaseKind::Sqlite, open_sqlite),
];

/// Opens (creating if necessary) a store of the given kind at `path`.
pub fn open_database(
    kind: DatabaseKind,
    path: &Path,
    config: &StorageConfig,
) -> Result<Arc<dyn Database>, LeafError> {
    let open = REGISTRY
        .iter()
        .find(|(registered, _)| *registered == kind)
        .map(|(_, open)| *open)
        .ok_or_else(|| LeafError::config(format!("database kind {kind} is not registered")))?;
    open(path, config)
}

/// Copies every key of `source` into `target` in a single transaction and
/// returns the number of keys copied. Keys already in `target` and absent
/// from `source` are left alone.
pub fn copy_all(source: &dyn Database, target: &dyn Database) -> Result<usize, LeafError> {
    let update = source.get_all()?;
    let count = update.len();
    target.read_update_delete(&Rud {
        update,
        ..Rud::default()
    })?;
    tracing::info!(
        source = %source.kind(),
        target = %target.kind(),
        keys = count,
        "copied database contents"
    );
    Ok(count)
}
