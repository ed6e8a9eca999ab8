//! Core types shared across Clickgate components.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{ARTIFACT_ID_BYTES, ARTIFACT_ID_LEN};
use crate::error::{CaptchaError, LedgerError};

/// Pixel classification stored in a solution mask.
///
/// - `Black`: background, not clickable
/// - `White`: the clickable target region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Symbol {
    Black,
    White,
}

impl Symbol {
    /// Symbol of the region a correct click must land in
    pub const CLICKABLE: Symbol = Symbol::White;

    /// Symbol assumed for any pixel the mask does not cover
    pub const BACKGROUND: Symbol = Symbol::Black;

    /// Byte used in the encoded mask body
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Black => b'B',
            Self::White => b'W',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'B' => Some(Self::Black),
            b'W' => Some(Self::White),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

/// Order in which mask runs are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanDirection {
    /// One encoded record per image row
    Row,
    /// One encoded record per image column
    Column,
}

impl ScanDirection {
    pub fn as_char(self) -> char {
        match self {
            Self::Row => 'R',
            Self::Column => 'C',
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "R" => Some(Self::Row),
            "C" => Some(Self::Column),
            _ => None,
        }
    }
}

/// Persisted pool occupancy counters.
///
/// Pooled sequential ids form the half-open range `[current_id, last_id)`,
/// so `last_id - current_id` is the remaining pool depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolIndexRecord {
    /// File name prefix of pending artifacts
    pub pattern: String,
    /// Next sequential id to withdraw
    pub current_id: u64,
    /// First sequential id not yet generated
    pub last_id: u64,
}

impl PoolIndexRecord {
    pub fn new(pattern: impl Into<String>, current_id: u64, last_id: u64) -> Self {
        Self {
            pattern: pattern.into(),
            current_id,
            last_id,
        }
    }

    /// Remaining pending artifacts
    pub fn depth(&self) -> u64 {
        self.last_id.saturating_sub(self.current_id)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_id >= self.last_id
    }
}

impl fmt::Display for PoolIndexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.pattern, self.current_id, self.last_id)
    }
}

impl FromStr for PoolIndexRecord {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [pattern, current, last] = fields.as_slice() else {
            return Err(LedgerError::Corrupt(format!(
                "expected 3 fields, found {}",
                fields.len()
            )));
        };

        let parse = |field: &str, name: &str| {
            field
                .parse::<u64>()
                .map_err(|_| LedgerError::Corrupt(format!("{name} is not numeric: {field:?}")))
        };
        let current_id = parse(*current, "current id")?;
        let last_id = parse(*last, "last id")?;

        if current_id > last_id {
            return Err(LedgerError::Corrupt(format!(
                "current id {current_id} beyond last id {last_id}"
            )));
        }

        Ok(Self::new(*pattern, current_id, last_id))
    }
}

/// Client-facing identifier of a live artifact.
///
/// 16 random bytes, URL-safe base64 without padding. Ids received from
/// clients go through [`ArtifactId::parse`] so they are always safe to use
/// as a file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Generate a fresh, collision-improbable id
    pub fn generate() -> Self {
        use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
        use rand::Rng;

        let mut bytes = [0u8; ARTIFACT_ID_BYTES];
        rand::rng().fill(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Validate an untrusted id
    pub fn parse(raw: &str) -> Result<Self, CaptchaError> {
        let well_formed = raw.len() == ARTIFACT_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

        if well_formed {
            Ok(Self(raw.to_string()))
        } else {
            Err(CaptchaError::InvalidArtifactId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ArtifactId {
    type Err = CaptchaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_bytes() {
        assert_eq!(Symbol::from_byte(b'B'), Some(Symbol::Black));
        assert_eq!(Symbol::from_byte(b'W'), Some(Symbol::White));
        assert_eq!(Symbol::from_byte(b'w'), None);
        assert_eq!(Symbol::from_byte(b'0'), None);
        assert_eq!(Symbol::CLICKABLE.as_byte(), b'W');
    }

    #[test]
    fn test_pool_record_parse() {
        let record: PoolIndexRecord = "pre 3 9".parse().unwrap();
        assert_eq!(record, PoolIndexRecord::new("pre", 3, 9));
        assert_eq!(record.depth(), 6);
        assert_eq!(record.to_string(), "pre 3 9");

        // Trailing newline from a hand-edited file is tolerated
        let record: PoolIndexRecord = "pre 1 5\n".parse().unwrap();
        assert_eq!(record.last_id, 5);
    }

    #[test]
    fn test_pool_record_corrupt() {
        for raw in ["", "pre 1", "pre one 5", "pre 1 5 7", "pre 6 5", "pre -1 5"] {
            let err = raw.parse::<PoolIndexRecord>().unwrap_err();
            assert!(matches!(err, LedgerError::Corrupt(_)), "{raw:?} gave {err:?}");
        }
    }

    #[test]
    fn test_artifact_id_roundtrip() {
        let id = ArtifactId::generate();
        assert_eq!(id.as_str().len(), ARTIFACT_ID_LEN);
        let parsed = ArtifactId::parse(id.as_str()).unwrap();
        assert_eq!(parsed, id);
        assert_ne!(ArtifactId::generate(), id);
    }

    #[test]
    fn test_artifact_id_rejects_paths() {
        for raw in ["", "../../etc/passwd", "abc", "aaaaaaaaaaaaaaaaaaaa/.", "aaaaaaaaaaaaaaaaaaaaaaa"] {
            assert!(matches!(
                ArtifactId::parse(raw),
                Err(CaptchaError::InvalidArtifactId(_))
            ));
        }
    }
}
