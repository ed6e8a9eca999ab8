//! Challenge artifact lifecycle.
//!
//! Artifacts move `Pending -> Live -> Consumed`:
//! - [`pool`] renders Pending artifacts ahead of demand and records them in the ledger
//! - [`manager`] promotes them to Live on request (or renders on demand) and
//!   consumes them on verification
//! - [`storage`] owns every path and file move involved

mod manager;
mod pool;
mod renderer;
mod storage;

pub use manager::{CaptchaManager, ManagerStats, ManagerStatsSnapshot};
pub use pool::{
    CycleOutcome, PregenStats, PregenStatsSnapshot, Pregenerator, Watermarks,
    pregeneration_worker,
};
pub use renderer::{RenderError, RenderedArtifact, Renderer, ShapeRenderer};
pub use storage::{ArtifactPaths, ArtifactStore};

use clickgate_common::CaptchaError;

/// Run blocking file or render work off the async executor
pub(crate) async fn blocking<F, T>(f: F) -> Result<T, CaptchaError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CaptchaError::Task(e.to_string()))
}
