//! Pool index ledger: persisted `(pattern, current_id, last_id)` counters.
//!
//! Every read-modify-write goes through [`PoolLedger`]'s provided methods,
//! which hold the implementation's [`WriteGuard`] for the whole update. This
//! is what keeps two concurrent `advance` calls from withdrawing the same
//! pooled artifact, across threads and, for [`FileLedger`], across processes.

mod file;
mod lock;
mod memory;

pub use file::FileLedger;
pub use lock::{LOCK_TIMEOUT, LedgerLock};
pub use memory::MemoryLedger;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use clickgate_common::{LedgerError, PoolIndexRecord};

/// A sequential id taken out of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawn {
    pub pattern: String,
    pub sequential_id: u64,
    /// Pool depth after this withdrawal
    pub remaining: u64,
}

/// Outcome of trying to take one artifact from the pool.
///
/// Every variant other than `Delivered` means the caller must fall back to
/// on-demand generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Withdrawal {
    Delivered(Withdrawn),
    /// Pool exhausted, or not bootstrapped yet
    Empty,
    LedgerCorrupt(String),
    IoFailure(String),
}

/// Storage backend for the pool index record
pub trait PoolLedger: Send + Sync {
    /// Load the current record (unlocked)
    fn load(&self) -> Result<PoolIndexRecord, LedgerError>;

    /// Replace the record (unlocked); must never leave a partial record behind
    fn store(&self, record: &PoolIndexRecord) -> Result<(), LedgerError>;

    /// Exclusive access held across every read-modify-write
    fn write_lock(&self) -> Result<WriteGuard<'_>, LedgerError>;

    /// Human-readable location, for logs
    fn location(&self) -> String;

    fn read(&self) -> Result<PoolIndexRecord, LedgerError> {
        self.load()
    }

    /// Atomically take the next pooled id.
    ///
    /// Returns the previous `current_id`, or `None` if the pool is exhausted.
    fn advance(&self) -> Result<Option<Withdrawn>, LedgerError> {
        let _guard = self.write_lock()?;
        let mut record = self.load()?;
        if record.is_exhausted() {
            return Ok(None);
        }

        let sequential_id = record.current_id;
        record.current_id += 1;
        self.store(&record)?;

        Ok(Some(Withdrawn {
            sequential_id,
            remaining: record.depth(),
            pattern: record.pattern,
        }))
    }

    /// Raise `last_id` after new pending artifacts were generated
    fn extend(&self, new_last_id: u64) -> Result<PoolIndexRecord, LedgerError> {
        let _guard = self.write_lock()?;
        let mut record = self.load()?;
        if new_last_id < record.last_id {
            return Err(LedgerError::Regression {
                current: record.last_id,
                requested: new_last_id,
            });
        }

        record.last_id = new_last_id;
        self.store(&record)?;
        Ok(record)
    }

    /// Create the record for a freshly generated pool.
    ///
    /// Overwrites a corrupt record; refuses to replace a valid one.
    fn bootstrap(&self, pattern: &str, first_last_id: u64) -> Result<PoolIndexRecord, LedgerError> {
        let _guard = self.write_lock()?;
        match self.load() {
            Ok(existing) => return Err(LedgerError::AlreadyBootstrapped(existing.pattern)),
            Err(e) if e.needs_bootstrap() => {}
            Err(e) => return Err(e),
        }

        let record = PoolIndexRecord::new(pattern, 1, first_last_id.max(1));
        self.store(&record)?;
        Ok(record)
    }
}

/// Take one artifact from an optional ledger, classifying every failure
pub fn withdraw(ledger: Option<&dyn PoolLedger>) -> Withdrawal {
    let Some(ledger) = ledger else {
        return Withdrawal::Empty;
    };

    match ledger.advance() {
        Ok(Some(withdrawn)) => Withdrawal::Delivered(withdrawn),
        Ok(None) | Err(LedgerError::Missing(_)) => Withdrawal::Empty,
        Err(LedgerError::Io(e)) => Withdrawal::IoFailure(e.to_string()),
        Err(e) => Withdrawal::LedgerCorrupt(e.to_string()),
    }
}

/// Write access to a ledger; released on drop
pub struct WriteGuard<'a> {
    _file: Option<LedgerLock>,
    _local: MutexGuard<'a, ()>,
}

impl<'a> WriteGuard<'a> {
    /// Serialise writers within this process only
    pub fn local(mutex: &'a Mutex<()>) -> Self {
        Self { _file: None, _local: lock(mutex) }
    }

    /// Serialise writers in this process, then across processes via `file`
    pub fn with_file_lock(mutex: &'a Mutex<()>, path: &Path) -> Result<Self, LedgerError> {
        let local = lock(mutex);
        let file = LedgerLock::acquire(path, LOCK_TIMEOUT)?;
        Ok(Self { _file: Some(file), _local: local })
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    // the mutex guards no data, so a poisoned lock is still usable
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_withdraw_sequence() {
        let ledger = MemoryLedger::new();
        ledger.bootstrap("pre", 4).unwrap();

        let ids: Vec<u64> = (0..3)
            .map(|_| match withdraw(Some(&ledger)) {
                Withdrawal::Delivered(w) => w.sequential_id,
                other => panic!("expected delivery, got {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(withdraw(Some(&ledger)), Withdrawal::Empty);
        assert_eq!(ledger.read().unwrap(), PoolIndexRecord::new("pre", 4, 4));
    }

    #[test]
    fn test_withdraw_without_ledger() {
        assert_eq!(withdraw(None), Withdrawal::Empty);
        assert_eq!(withdraw(Some(&MemoryLedger::new())), Withdrawal::Empty);
    }

    #[test]
    fn test_remaining_depth_reported() {
        let ledger = MemoryLedger::with_record(PoolIndexRecord::new("pre", 1, 5));
        let Withdrawal::Delivered(first) = withdraw(Some(&ledger)) else {
            panic!("pool should not be empty");
        };
        assert_eq!(first, Withdrawn { pattern: "pre".into(), sequential_id: 1, remaining: 3 });
    }

    #[test]
    fn test_extend_and_regression() {
        let ledger = MemoryLedger::with_record(PoolIndexRecord::new("pre", 3, 5));
        assert_eq!(ledger.extend(9).unwrap(), PoolIndexRecord::new("pre", 3, 9));
        assert!(matches!(
            ledger.extend(7),
            Err(LedgerError::Regression { current: 9, requested: 7 })
        ));
    }

    #[test]
    fn test_bootstrap_rules() {
        let ledger = MemoryLedger::new();
        assert!(matches!(ledger.read(), Err(LedgerError::Missing(_))));
        assert!(matches!(ledger.extend(5), Err(LedgerError::Missing(_))));

        assert_eq!(ledger.bootstrap("pre", 5).unwrap(), PoolIndexRecord::new("pre", 1, 5));
        assert!(matches!(
            ledger.bootstrap("pre", 9),
            Err(LedgerError::AlreadyBootstrapped(_))
        ));
    }

    #[test]
    fn test_concurrent_advance_is_exclusive() {
        let ledger = Arc::new(MemoryLedger::with_record(PoolIndexRecord::new("pre", 1, 41)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Withdrawal::Delivered(w) = withdraw(Some(&*ledger)) {
                        taken.push(w.sequential_id);
                    }
                    taken
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique, (1..41).collect());
    }
}
