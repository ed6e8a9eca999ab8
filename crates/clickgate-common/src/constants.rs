//! Shared constants for Clickgate components.

/// Magic token opening every mask header line
pub const MASK_MAGIC: &str = "3DC";

/// Upper bound on a mask header line, newline included
pub const MAX_HEADER_LEN: usize = 128;

/// Random bytes behind an artifact id
pub const ARTIFACT_ID_BYTES: usize = 16;

/// Encoded length of an artifact id (URL-safe base64, no padding)
pub const ARTIFACT_ID_LEN: usize = 22;

/// Default pool file name pattern
pub const DEFAULT_POOL_PATTERN: &str = "pre";

/// Default delay between pregeneration cycles (seconds)
pub const DEFAULT_WATCH_DELAY_SECS: u64 = 60;

/// Replenish once pool depth drops to this many artifacts
pub const DEFAULT_MIN_THRESHOLD: u64 = 20;

/// Artifacts generated per replenish cycle
pub const DEFAULT_MAX_THRESHOLD: u64 = 50;

/// Artifact file extensions
pub mod extensions {
    /// Challenge image shown to the client
    pub const IMAGE: &str = "jpg";

    /// Fixed-row RLE solution mask
    pub const MASK: &str = "rle";

    /// Optional raster copy of the solution mask
    pub const DEBUG: &str = "png";

    /// Mask claimed by an in-flight verification
    pub const CLAIMED: &str = "claimed";
}
