use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free request counters shared by every request task.
#[derive(Debug, Default)]
pub struct Metrics {
    keys_read: AtomicU64,
    keys_updated: AtomicU64,
    keys_deleted: AtomicU64,
    transactions_total: AtomicU64,
    rejected_requests: AtomicU64,
    storage_errors: AtomicU64,
    authentication_failures: AtomicU64,
    database_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub keys_read: u64,
    pub keys_updated: u64,
    pub keys_deleted: u64,
    pub transactions_total: u64,
    /// Requests refused before reaching storage (bad keys, denied access).
    pub rejected_requests: u64,
    pub storage_errors: u64,
    pub authentication_failures: u64,
    pub database_micros: u64,
    pub avg_database_micros: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transaction(&self, reads: usize, updates: usize, deletes: usize, took: Duration) {
        self.keys_read.fetch_add(reads as u64, Ordering::Relaxed);
        self.keys_updated.fetch_add(updates as u64, Ordering::Relaxed);
        self.keys_deleted.fetch_add(deletes as u64, Ordering::Relaxed);
        self.transactions_total.fetch_add(1, Ordering::Relaxed);
        self.database_micros
            .fetch_add(took.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authentication_failure(&self) {
        self.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let transactions_total = self.transactions_total.load(Ordering::Relaxed);
        let database_micros = self.database_micros.load(Ordering::Relaxed);
        let avg_database_micros = if transactions_total == 0 {
            0
        } else {
            database_micros / transactions_total
        };
        MetricsSnapshot {
            keys_read: self.keys_read.load(Ordering::Relaxed),
            keys_updated: self.keys_updated.load(Ordering::Relaxed),
            keys_deleted: self.keys_deleted.load(Ordering::Relaxed),
            transactions_total,
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
            database_micros,
            avg_database_micros,
        }
    }
}
