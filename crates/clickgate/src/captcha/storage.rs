//! On-disk layout of pending and live artifacts.
//!
//! Pending artifacts live in the pool directories as `<pattern><seq>.<ext>`;
//! live artifacts are renamed to `<artifact id>.<ext>` in the live
//! directories. Every mutation of these paths goes through this module.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use clickgate_common::ArtifactId;
use clickgate_common::constants::extensions;

use crate::config::CaptchaConfig;

/// File set making up one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Challenge image
    pub image: PathBuf,
    /// RLE solution mask
    pub mask: PathBuf,
    /// Optional raster mask, only present when debug output is on
    pub debug: PathBuf,
}

impl ArtifactPaths {
    fn new(image_dir: &Path, mask_dir: &Path, stem: &str) -> Self {
        Self {
            image: image_dir.join(format!("{stem}.{}", extensions::IMAGE)),
            mask: mask_dir.join(format!("{stem}.{}", extensions::MASK)),
            debug: mask_dir.join(format!("{stem}.{}", extensions::DEBUG)),
        }
    }

    /// Where an in-flight verification parks the mask
    pub fn claimed_mask(&self) -> PathBuf {
        let mut name = self.mask.clone().into_os_string();
        name.push(".");
        name.push(extensions::CLAIMED);
        PathBuf::from(name)
    }
}

/// Pool and live directory layout
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    live_image_dir: PathBuf,
    live_mask_dir: PathBuf,
    pool_image_dir: PathBuf,
    pool_mask_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(
        live_image_dir: impl Into<PathBuf>,
        live_mask_dir: impl Into<PathBuf>,
        pool_image_dir: impl Into<PathBuf>,
        pool_mask_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            live_image_dir: live_image_dir.into(),
            live_mask_dir: live_mask_dir.into(),
            pool_image_dir: pool_image_dir.into(),
            pool_mask_dir: pool_mask_dir.into(),
        }
    }

    pub fn from_config(config: &CaptchaConfig) -> Self {
        Self::new(
            &config.live_image_dir,
            &config.live_mask_dir,
            &config.pool_image_dir,
            &config.pool_mask_dir,
        )
    }

    pub fn live(&self, id: &ArtifactId) -> ArtifactPaths {
        ArtifactPaths::new(&self.live_image_dir, &self.live_mask_dir, id.as_str())
    }

    pub fn pending(&self, pattern: &str, sequential_id: u64) -> ArtifactPaths {
        ArtifactPaths::new(
            &self.pool_image_dir,
            &self.pool_mask_dir,
            &format!("{pattern}{sequential_id}"),
        )
    }

    pub async fn ensure_live_dirs(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.live_image_dir).await?;
        tokio::fs::create_dir_all(&self.live_mask_dir).await
    }

    /// Blocking variant, for the pregeneration batch which already runs off
    /// the async executor
    pub fn ensure_pool_dirs_blocking(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.pool_image_dir)?;
        std::fs::create_dir_all(&self.pool_mask_dir)
    }

    /// Move a pending artifact to live storage under `id`.
    ///
    /// Image and mask must both exist; the debug raster is moved if present.
    /// On failure nothing is left under `id`.
    pub async fn promote(&self, pattern: &str, sequential_id: u64, id: &ArtifactId) -> io::Result<ArtifactPaths> {
        let pending = self.pending(pattern, sequential_id);
        let live = self.live(id);
        self.ensure_live_dirs().await?;

        move_file(&pending.image, &live.image).await?;
        if let Err(e) = move_file(&pending.mask, &live.mask).await {
            let _ = remove_if_exists(&live.image).await;
            return Err(e);
        }
        // the TTL sweep ages artifacts from promotion, not from pregeneration
        if let Err(e) = touch(&live.mask).await {
            tracing::warn!(path = %live.mask.display(), error = %e, "Failed to reset mask mtime");
        }
        match move_file(&pending.debug, &live.debug).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                tracing::warn!(path = %pending.debug.display(), error = %e, "Failed to move debug mask");
            }
            _ => {}
        }

        Ok(live)
    }

    /// Atomically take ownership of a live mask for verification.
    ///
    /// Fails with `NotFound` if the artifact was already consumed or claimed.
    pub async fn claim_mask(&self, id: &ArtifactId) -> io::Result<PathBuf> {
        let live = self.live(id);
        let claimed = live.claimed_mask();
        tokio::fs::rename(&live.mask, &claimed).await?;
        Ok(claimed)
    }

    /// Remove every file of a live artifact, including a claimed mask.
    ///
    /// Returns true if anything was removed.
    pub async fn remove_live(&self, id: &ArtifactId) -> io::Result<bool> {
        let live = self.live(id);
        let mut removed = false;
        for path in [&live.image, &live.mask, &live.debug, &live.claimed_mask()] {
            removed |= remove_if_exists(path).await?;
        }
        Ok(removed)
    }

    /// Delete live artifacts whose mask is older than `ttl`
    pub async fn sweep_expired(&self, ttl: Duration) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.live_mask_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut swept = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != extensions::MASK) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| ArtifactId::parse(stem).ok())
            else {
                continue;
            };

            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > ttl && self.remove_live(&id).await? {
                swept += 1;
            }
        }

        if swept > 0 {
            tracing::info!(swept = swept, ttl_secs = ttl.as_secs(), "Swept expired live artifacts");
        }
        Ok(swept)
    }
}

/// Rename, falling back to copy + remove across filesystems
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
        result => result,
    }
}

async fn touch(path: &Path) -> io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.into_std().await.set_modified(SystemTime::now())
}

async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
