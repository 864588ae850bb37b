use crate::config::StorageConfig;
use crate::error::LeafError;
use crate::security::KeyName;
use crate::storage::log::{CommitLog, CommitRecord};
use crate::storage::{Database, DatabaseKind, Rud, stored_key};
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Logs with at least this many frames are compacted on open when most of
/// their frames are superseded.
const COMPACT_MIN_FRAMES: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    value: String,
    seq: u64,
}

#[derive(Debug, Clone, Default)]
struct Committed {
    entries: OrdMap<String, Entry>,
    seq: u64,
    value_bytes: u64,
}

impl Committed {
    fn apply(&mut self, seq: u64, record: CommitRecord) {
        for (key, value) in record.puts {
            self.value_bytes += value.len() as u64;
            if let Some(old) = self.entries.insert(key, Entry { value, seq }) {
                self.value_bytes -= old.value.len() as u64;
            }
        }
        for key in record.deletes {
            if let Some(old) = self.entries.remove(&key) {
                self.value_bytes -= old.value.len() as u64;
            }
        }
        self.seq = seq;
    }
}

/// A unit of work against a private snapshot of committed state. Writes are
/// buffered until commit; dropping the transaction rolls it back.
struct Transaction {
    base_seq: u64,
    snapshot: OrdMap<String, Entry>,
    puts: BTreeMap<String, String>,
    deletes: BTreeSet<String>,
}

impl Transaction {
    fn get(&self, key: &str) -> Option<&str> {
        self.snapshot.get(key).map(|entry| entry.value.as_str())
    }

    fn put(&mut self, key: &str, value: &str) {
        self.deletes.remove(key);
        self.puts.insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.puts.remove(key);
        self.deletes.insert(key.to_string());
    }

    fn is_read_only(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Optimistic multi-version store.
///
/// Transactions read a structurally shared snapshot of the committed map
/// and never block one another. At commit, any written key whose committed
/// version changed since the snapshot was taken fails the transaction with
/// [`LeafError::StorageConflict`]: the first committer wins.
/// [`Database::read_update_delete`] retries such conflicts a bounded number
/// of times.
pub struct MvccDatabase {
    path: PathBuf,
    state: RwLock<Committed>,
    log: Mutex<CommitLog>,
    closed: AtomicBool,
    max_attempts: usize,
    conflicts: AtomicU64,
    #[cfg(test)]
    forced_conflicts: AtomicUsize,
}

impl MvccDatabase {
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self, LeafError> {
        let (mut log, replay) = CommitLog::open(path, config.fsync_commits)?;
        let mut state = Committed::default();
        for (seq, record) in replay.records {
            state.apply(seq, record);
        }

        let frames = log.frame_count();
        if frames >= COMPACT_MIN_FRAMES && frames > 2 * state.entries.len() as u64 {
            let snapshot = CommitRecord {
                puts: state
                    .entries
                    .iter()
                    .map(|(key, entry)| (key.clone(), entry.value.clone()))
                    .collect(),
                deletes: Vec::new(),
            };
            log.compact(state.seq, &snapshot)?;
        }

        info!(
            path = %path.display(),
            keys = state.entries.len(),
            seq = state.seq,
            "opened mvstore database"
        );
        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            log: Mutex::new(log),
            closed: AtomicBool::new(false),
            max_attempts: config.max_rud_attempts.max(1),
            conflicts: AtomicU64::new(0),
            #[cfg(test)]
            forced_conflicts: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write conflicts observed so far, including ones later retried away.
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<(), LeafError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LeafError::Closed);
        }
        Ok(())
    }

    fn begin(&self) -> Result<Transaction, LeafError> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(Transaction {
            base_seq: state.seq,
            snapshot: state.entries.clone(),
            puts: BTreeMap::new(),
            deletes: BTreeSet::new(),
        })
    }

    fn commit(&self, txn: Transaction) -> Result<u64, LeafError> {
        if txn.is_read_only() {
            return Ok(txn.base_seq);
        }
        if self.take_forced_conflict() {
            return Err(LeafError::StorageConflict("forced".into()));
        }

        // Committers serialize on the log mutex, so the state validated here
        // cannot change before it is applied. `state` is write-locked only
        // for the in-memory apply.
        let mut log = self.log.lock();
        self.ensure_open()?;
        let seq = {
            let state = self.state.read();
            for key in txn.puts.keys().chain(txn.deletes.iter()) {
                let seen = txn.snapshot.get(key).map(|entry| entry.seq);
                let current = state.entries.get(key).map(|entry| entry.seq);
                if seen != current {
                    return Err(LeafError::StorageConflict(format!(
                        "key '{key}' was changed by a concurrent transaction"
                    )));
                }
            }
            state.seq + 1
        };
        let record = CommitRecord {
            puts: txn.puts.into_iter().collect(),
            deletes: txn.deletes.into_iter().collect(),
        };
        log.append(seq, &record)?;
        self.state.write().apply(seq, record);
        drop(log);
        Ok(seq)
    }

    #[cfg(test)]
    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(test))]
    fn take_forced_conflict(&self) -> bool {
        false
    }

    fn attempt_rud(&self, rud: &Rud) -> Result<BTreeMap<KeyName, String>, LeafError> {
        let mut txn = self.begin()?;
        let mut values = BTreeMap::new();
        for key in &rud.read {
            if let Some(value) = txn.get(key.as_str()) {
                values.insert(key.clone(), value.to_string());
            }
        }
        for (key, value) in &rud.update {
            txn.put(key.as_str(), value);
        }
        for key in &rud.delete {
            txn.remove(key.as_str());
        }
        self.commit(txn)?;
        Ok(values)
    }
}

impl Database for MvccDatabase {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::MvStore
    }

    fn get(&self, key: &KeyName) -> Result<Option<String>, LeafError> {
        let txn = self.begin()?;
        Ok(txn.get(key.as_str()).map(str::to_string))
    }

    fn get_all(&self) -> Result<BTreeMap<KeyName, String>, LeafError> {
        let txn = self.begin()?;
        txn.snapshot
            .iter()
            .map(|(key, entry)| Ok((stored_key(key)?, entry.value.clone())))
            .collect()
    }

    fn read_update_delete(&self, rud: &Rud) -> Result<BTreeMap<KeyName, String>, LeafError> {
        let mut last_conflict = None;
        for attempt in 1..=self.max_attempts {
            match self.attempt_rud(rud) {
                Ok(values) => return Ok(values),
                Err(err) if err.is_retriable() => {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, error = %err, "retrying conflicted transaction");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        warn!(attempts = self.max_attempts, "transaction kept conflicting, giving up");
        let detail = last_conflict
            .map_or_else(|| "no attempt was made".to_string(), |e| e.to_string());
        Err(LeafError::Storage(format!(
            "transaction abandoned after {} attempts: {detail}",
            self.max_attempts
        )))
    }

    fn data_size_approximate(&self) -> Result<u64, LeafError> {
        self.ensure_open()?;
        Ok(self.state.read().value_bytes)
    }

    fn key_count_approximate(&self) -> Result<u64, LeafError> {
        self.ensure_open()?;
        Ok(self.state.read().entries.len() as u64)
    }

    fn close(&self) -> Result<(), LeafError> {
        let mut log = self.log.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log.sync()?;
        info!(path = %self.path.display(), "closed mvstore database");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::{COMPACT_MIN_FRAMES, MvccDatabase};
    use crate::config::StorageConfig;
    use crate::error::LeafError;
    use crate::security::KeyName;
    use crate::storage::{Database, Rud};
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn key(raw: &str) -> KeyName {
        KeyName::create(raw).expect("key")
    }

    fn config() -> StorageConfig {
        StorageConfig {
            fsync_commits: false,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn first_committer_wins() {
        let dir = tempdir().expect("tempdir");
        let db = MvccDatabase::open(&dir.path().join("db"), &config()).expect("open");

        let mut first = db.begin().expect("begin");
        let mut second = db.begin().expect("begin");
        first.put("/a", "1");
        second.put("/a", "2");
        db.commit(first).expect("first commit");
        let err = db.commit(second).expect_err("second must conflict");
        assert!(err.is_retriable());
        assert_eq!(db.get(&key("/a")).expect("get").as_deref(), Some("1"));
    }

    #[test]
    fn deletes_conflict_with_concurrent_deletes() {
        let dir = tempdir().expect("tempdir");
        let db = MvccDatabase::open(&dir.path().join("db"), &config()).expect("open");
        db.read_update_delete(&Rud::updating(key("/a"), "v"))
            .expect("seed");

        let mut first = db.begin().expect("begin");
        let mut second = db.begin().expect("begin");
        first.remove("/a");
        second.put("/a", "w");
        db.commit(first).expect("delete");
        assert!(matches!(
            db.commit(second),
            Err(LeafError::StorageConflict(_))
        ));
        assert_eq!(db.get(&key("/a")).expect("get"), None);
    }

    #[test]
    fn disjoint_writers_do_not_conflict() {
        let dir = tempdir().expect("tempdir");
        let db = MvccDatabase::open(&dir.path().join("db"), &config()).expect("open");
        let mut first = db.begin().expect("begin");
        let mut second = db.begin().expect("begin");
        first.put("/a", "1");
        second.put("/b", "2");
        db.commit(first).expect("first");
        db.commit(second).expect("second");
        assert_eq!(db.key_count_approximate().expect("count"), 2);
    }

    #[test]
    fn conflicts_are_retried_until_success() {
        let dir = tempdir().expect("tempdir");
        let db = MvccDatabase::open(&dir.path().join("db"), &config()).expect("open");
        db.forced_conflicts.store(3, Ordering::SeqCst);
        db.read_update_delete(&Rud::updating(key("/a"), "v"))
            .expect("retried rud");
        assert_eq!(db.conflict_count(), 3);
        assert_eq!(db.get(&key("/a")).expect("get").as_deref(), Some("v"));
    }

    #[test]
    fn exhausted_retries_are_fatal() {
        let dir = tempdir().expect("tempdir");
        let db = MvccDatabase::open(&dir.path().join("db"), &config()).expect("open");
        db.forced_conflicts.store(100, Ordering::SeqCst);
        let err = db
            .read_update_delete(&Rud::updating(key("/a"), "v"))
            .expect_err("exhausted");
        assert!(matches!(err, LeafError::Storage(_)), "{err}");
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("forced"), "{err}");
        assert_eq!(db.conflict_count(), 10);
        assert_eq!(db.get(&key("/a")).expect("get"), None);
    }

    #[test]
    fn reads_proceed_while_a_commit_holds_the_log() {
        let dir = tempdir().expect("tempdir");
        let db = MvccDatabase::open(&dir.path().join("db"), &config()).expect("open");
        db.read_update_delete(&Rud::updating(key("/a"), "v"))
            .expect("seed");

        let _log = db.log.lock();
        assert_eq!(db.get(&key("/a")).expect("get").as_deref(), Some("v"));
        assert_eq!(db.key_count_approximate().expect("count"), 1);
        let values = db
            .read_update_delete(&Rud::reading(key("/a")))
            .expect("read-only rud");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn read_only_transactions_never_conflict() {
        let dir = tempdir().expect("tempdir");
        let db = MvccDatabase::open(&dir.path().join("db"), &config()).expect("open");
        db.forced_conflicts.store(100, Ordering::SeqCst);
        let values = db
            .read_update_delete(&Rud::reading(key("/a")))
            .expect("read");
        assert!(values.is_empty());
    }

    #[test]
    fn reopen_restores_committed_state() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("db");
        {
            let db = MvccDatabase::open(&path, &StorageConfig::default()).expect("open");
            let mut rud = Rud::default();
            rud.update.insert(key("/a"), "1".into());
            rud.update.insert(key("/b"), "22".into());
            db.read_update_delete(&rud).expect("write");
            db.read_update_delete(&Rud::deleting(key("/b")))
                .expect("delete");
            db.close().expect("close");
        }
        let db = MvccDatabase::open(&path, &StorageConfig::default()).expect("reopen");
        let all = db.get_all().expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all.get(&key("/a")).map(String::as_str), Some("1"));
        assert_eq!(db.data_size_approximate().expect("size"), 1);
    }

    #[test]
    fn superseded_logs_are_compacted_on_open() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("db");
        {
            let db = MvccDatabase::open(&path, &config()).expect("open");
            for i in 0..COMPACT_MIN_FRAMES {
                db.read_update_delete(&Rud::updating(key("/counter"), i.to_string()))
                    .expect("write");
            }
            db.close().expect("close");
        }
        let db = MvccDatabase::open(&path, &config()).expect("reopen");
        assert_eq!(db.log.lock().frame_count(), 1);
        let expected = (COMPACT_MIN_FRAMES - 1).to_string();
        assert_eq!(
            db.get(&key("/counter")).expect("get").as_deref(),
            Some(expected.as_str())
        );
    }

    #[test]
    fn closed_store_rejects_operations() {
        let dir = tempdir().expect("tempdir");
        let db = MvccDatabase::open(&dir.path().join("db"), &config()).expect("open");
        db.close().expect("close");
        db.close().expect("second close is a no-op");
        assert!(db.is_closed());
        assert!(matches!(db.get(&key("/a")), Err(LeafError::Closed)));
        assert!(matches!(
            db.read_update_delete(&Rud::updating(key("/a"), "v")),
            Err(LeafError::Closed)
        ));
    }
}
