//! Error types for Clickgate components.

use std::io;

use thiserror::Error;

/// Errors reading or checking an encoded mask
#[derive(Debug, Error)]
pub enum MaskError {
    /// Malformed header or row body
    #[error("Mask format error: {0}")]
    Format(String),

    /// Coordinates outside the declared image bounds
    #[error("Pixel ({x}, {y}) outside {width}x{height} mask")]
    OutOfRange {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },

    /// Read, write or seek failure (a short row read surfaces as `UnexpectedEof`)
    #[error("Mask I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the pool index ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No ledger record exists yet
    #[error("Ledger missing: {0}")]
    Missing(String),

    /// Record exists but cannot be parsed
    #[error("Ledger corrupt: {0}")]
    Corrupt(String),

    /// `bootstrap` called while a valid record exists
    #[error("Ledger already bootstrapped for pattern {0}")]
    AlreadyBootstrapped(String),

    /// `extend` would lower the upper bound
    #[error("Ledger cannot move last id from {current} back to {requested}")]
    Regression { current: u64, requested: u64 },

    /// Backing store failure
    #[error("Ledger I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LedgerError {
    /// Returns true if the pool should be rebuilt from scratch
    pub fn needs_bootstrap(&self) -> bool {
        matches!(self, Self::Missing(_) | Self::Corrupt(_))
    }
}

/// Errors surfaced by the artifact lifecycle
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error(transparent)]
    Mask(#[from] MaskError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Verify on an id that was already consumed, or never existed
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Client-supplied id is not a well-formed artifact id
    #[error("Invalid artifact id: {0:?}")]
    InvalidArtifactId(String),

    /// External renderer failed; never retried here
    #[error("Render failure: {0}")]
    Render(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl CaptchaError {
    /// Returns true if the caller should treat this as a rejected click
    /// rather than a server fault
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ArtifactNotFound(_)
                | Self::InvalidArtifactId(_)
                | Self::Mask(MaskError::OutOfRange { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(CaptchaError::ArtifactNotFound("x".into()).is_rejection());
        assert!(
            CaptchaError::Mask(MaskError::OutOfRange { x: 5, y: 0, width: 4, height: 2 })
                .is_rejection()
        );
        assert!(!CaptchaError::Render("boom".into()).is_rejection());
        assert!(!CaptchaError::Mask(MaskError::Format("bad".into())).is_rejection());
    }

    #[test]
    fn test_ledger_bootstrap_classification() {
        assert!(LedgerError::Missing("preindex.txt".into()).needs_bootstrap());
        assert!(LedgerError::Corrupt("abc".into()).needs_bootstrap());
        assert!(!LedgerError::Regression { current: 5, requested: 3 }.needs_bootstrap());
    }
}
