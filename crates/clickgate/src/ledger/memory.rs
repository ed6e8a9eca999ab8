//! In-process ledger, for pools that do not need to survive a restart.

use std::sync::{Mutex, RwLock};

use clickgate_common::{LedgerError, PoolIndexRecord};

use super::{PoolLedger, WriteGuard};

#[derive(Default)]
pub struct MemoryLedger {
    record: RwLock<Option<PoolIndexRecord>>,
    write_lock: Mutex<()>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: PoolIndexRecord) -> Self {
        Self {
            record: RwLock::new(Some(record)),
            write_lock: Mutex::new(()),
        }
    }
}

impl PoolLedger for MemoryLedger {
    fn load(&self) -> Result<PoolIndexRecord, LedgerError> {
        let record = self.record.read().unwrap_or_else(|e| e.into_inner());
        record
            .clone()
            .ok_or_else(|| LedgerError::Missing(self.location()))
    }

    fn store(&self, record: &PoolIndexRecord) -> Result<(), LedgerError> {
        *self.record.write().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        Ok(())
    }

    fn write_lock(&self) -> Result<WriteGuard<'_>, LedgerError> {
        Ok(WriteGuard::local(&self.write_lock))
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
