//! Configuration management for Clickgate.

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use clickgate_common::constants::{
    DEFAULT_MAX_THRESHOLD, DEFAULT_MIN_THRESHOLD, DEFAULT_POOL_PATTERN, DEFAULT_WATCH_DELAY_SECS,
};

/// Environment variable prefix, e.g. `CLICKGATE_CAPTCHA__MIN_THRESHOLD=5`
const ENV_PREFIX: &str = "CLICKGATE";

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Pool, ledger and artifact storage
    #[serde(default)]
    pub captcha: CaptchaConfig,

    /// Built-in challenge renderer
    #[serde(default)]
    pub renderer: RendererConfig,
}

/// Where the pool index ledger lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// Single-line file at `ledger_path`
    #[default]
    File,
    /// Process memory; the pool is rebuilt on every start
    Memory,
    /// No pool: every artifact is rendered on demand
    Disabled,
}

/// Pool and artifact lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaConfig {
    /// Challenge images handed to clients
    #[serde(default = "default_live_dir")]
    pub live_image_dir: PathBuf,

    /// Solution masks of live artifacts
    #[serde(default = "default_live_dir")]
    pub live_mask_dir: PathBuf,

    /// Pregenerated challenge images
    #[serde(default = "default_pool_dir")]
    pub pool_image_dir: PathBuf,

    /// Pregenerated solution masks
    #[serde(default = "default_pool_dir")]
    pub pool_mask_dir: PathBuf,

    #[serde(default)]
    pub ledger: LedgerBackend,

    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// File name prefix of pending artifacts
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Pause between pregeneration cycles
    #[serde(default = "default_watch_delay")]
    pub watch_delay_secs: u64,

    /// Replenish when pool depth drops to this level
    #[serde(default = "default_min_threshold")]
    pub min_threshold: u64,

    /// Artifacts generated per replenish
    #[serde(default = "default_max_threshold")]
    pub max_threshold: u64,

    /// Start the pregeneration worker from request handling when the pool runs low
    #[serde(default = "default_true")]
    pub auto_spawn_worker: bool,

    /// Delete live artifacts never verified within this many seconds
    #[serde(default)]
    pub live_ttl_secs: Option<u64>,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            live_image_dir: default_live_dir(),
            live_mask_dir: default_live_dir(),
            pool_image_dir: default_pool_dir(),
            pool_mask_dir: default_pool_dir(),
            ledger: LedgerBackend::default(),
            ledger_path: default_ledger_path(),
            pattern: default_pattern(),
            watch_delay_secs: default_watch_delay(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            auto_spawn_worker: true,
            live_ttl_secs: None,
        }
    }
}

/// Built-in shape renderer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RendererConfig {
    /// Width of the scene (the reference panel doubles the image width)
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Shapes drawn besides the target
    #[serde(default = "default_distractors")]
    pub distractors: u32,

    /// JPEG quality 1-100; low values hurt bots more than humans
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Also write the solution mask as PNG next to the RLE mask
    #[serde(default)]
    pub debug_png: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            distractors: default_distractors(),
            jpeg_quality: default_jpeg_quality(),
            debug_png: false,
        }
    }
}

// Default value functions
fn default_live_dir() -> PathBuf { PathBuf::from("captchas/live") }
fn default_pool_dir() -> PathBuf { PathBuf::from("captchas/pool") }
fn default_ledger_path() -> PathBuf { PathBuf::from("captchas/pool/preindex.txt") }
fn default_pattern() -> String { DEFAULT_POOL_PATTERN.to_string() }
fn default_watch_delay() -> u64 { DEFAULT_WATCH_DELAY_SECS }
fn default_min_threshold() -> u64 { DEFAULT_MIN_THRESHOLD }
fn default_max_threshold() -> u64 { DEFAULT_MAX_THRESHOLD }
fn default_true() -> bool { true }
fn default_width() -> u32 { 320 }
fn default_height() -> u32 { 240 }
fn default_distractors() -> u32 { 6 }
fn default_jpeg_quality() -> u8 { 16 }

impl AppConfig {
    /// Load configuration from an optional file plus `CLICKGATE_*` environment variables
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::warn!(path = %config_path.display(), "Config file not found, using defaults");
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(config_path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load config")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool protocol cannot honour
    pub fn validate(&self) -> Result<()> {
        let captcha = &self.captcha;
        ensure!(captcha.max_threshold >= 1, "max_threshold must be at least 1");
        ensure!(
            captcha.min_threshold < captcha.max_threshold,
            "min_threshold ({}) must be below max_threshold ({})",
            captcha.min_threshold,
            captcha.max_threshold
        );
        ensure!(
            !captcha.pattern.is_empty()
                && captcha
                    .pattern
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'),
            "pattern {:?} must be a non-empty file-name-safe token",
            captcha.pattern
        );

        let renderer = &self.renderer;
        ensure!(
            renderer.width >= 32 && renderer.height >= 32,
            "renderer size {}x{} is below 32x32",
            renderer.width,
            renderer.height
        );
        ensure!(
            (1..=100).contains(&renderer.jpeg_quality),
            "jpeg_quality must be within 1-100"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.captcha.min_threshold, 20);
        assert_eq!(config.captcha.max_threshold, 50);
        assert_eq!(config.captcha.ledger, LedgerBackend::File);
        assert!(config.captcha.live_ttl_secs.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clickgate.toml");
        std::fs::write(
            &path,
            r#"
[captcha]
ledger = "memory"
pattern = "batch"
min_threshold = 1
max_threshold = 4
live_ttl_secs = 600

[renderer]
debug_png = true
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.captcha.ledger, LedgerBackend::Memory);
        assert_eq!(config.captcha.pattern, "batch");
        assert_eq!((config.captcha.min_threshold, config.captcha.max_threshold), (1, 4));
        assert_eq!(config.captcha.live_ttl_secs, Some(600));
        assert!(config.renderer.debug_png);
        assert_eq!(config.renderer.width, 320);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.captcha.pattern, "pre");
    }

    #[test]
    fn test_validation_rejects_bad_watermarks() {
        let mut config = AppConfig::default();
        config.captcha.min_threshold = 50;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.captcha.pattern = "../pre".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.renderer.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }
}
