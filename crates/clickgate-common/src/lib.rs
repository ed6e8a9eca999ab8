//! # Clickgate Common
//!
//! Shared types, errors, and constants used across Clickgate components.
//!
//! ## Modules
//! - `types` - Core data structures (Symbol, PoolIndexRecord, ArtifactId)
//! - `error` - Error taxonomy for masks, the pool ledger and the artifact lifecycle
//! - `constants` - Mask format tokens, file extensions and pool defaults

pub mod constants;
pub mod error;
pub mod types;

pub use error::{CaptchaError, LedgerError, MaskError};
pub use types::*;
