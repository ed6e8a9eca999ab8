//! # Clickgate
//!
//! Click-CAPTCHA core: solution masks stored as fixed-row-width RLE files
//! that can be checked one row at a time, and a pregenerated artifact pool
//! shared between a background producer and concurrent request handlers.
//!
//! ```text
//! Pregenerator ──render──► pool/<pattern><seq>.{jpg,rle}
//!      │                          │ promote (rename)
//!      └──extend──► Ledger ◄──advance── CaptchaManager ──► live/<id>.{jpg,rle}
//!                                              │
//!                                   verify ────┘ check row, then delete
//! ```

pub mod captcha;
pub mod config;
pub mod ledger;
pub mod mask;

pub use captcha::{CaptchaManager, Pregenerator, Renderer, ShapeRenderer};
pub use config::AppConfig;
pub use ledger::{FileLedger, MemoryLedger, PoolLedger, Withdrawal};
pub use mask::{MaskHeader, MaskReader, PixelGrid};
