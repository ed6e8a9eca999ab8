//! File-backed ledger: a single line `"<pattern> <current_id> <last_id>"`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clickgate_common::{LedgerError, PoolIndexRecord};
use tempfile::NamedTempFile;

use super::{PoolLedger, WriteGuard};

/// Ledger persisted to one small text file.
///
/// Updates are written to a uniquely named sibling temp file and renamed
/// over the ledger, so readers always see exactly one complete line.
/// Read-modify-writes hold an advisory lock on `<ledger>.lock`, so a
/// pregeneration process and separate issuing processes can share the file.
pub struct FileLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar file carrying the cross-process lock
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }
}

impl PoolLedger for FileLedger {
    fn load(&self) -> Result<PoolIndexRecord, LedgerError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LedgerError::Missing(self.location()));
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(LedgerError::Corrupt(format!("{}: not UTF-8", self.location())));
            }
            Err(e) => return Err(LedgerError::Io(e)),
        };
        raw.parse()
    }

    fn store(&self, record: &PoolIndexRecord) -> Result<(), LedgerError> {
        let parent = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent,
            None => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(record.to_string().as_bytes())?;
        temp.persist(&self.path).map_err(|e| LedgerError::Io(e.error))?;
        Ok(())
    }

    fn write_lock(&self) -> Result<WriteGuard<'_>, LedgerError> {
        WriteGuard::with_file_lock(&self.write_lock, &self.lock_path())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
