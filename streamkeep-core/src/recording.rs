use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{self, ArtifactLayout};
use crate::error::{CaptureError, Result};
use crate::tool::MediaTool;

/// How a capture ended. Every variant names the raw file it wrote to, which
/// may or may not exist.
#[derive(Debug)]
pub enum RecordingOutcome {
    Completed(PathBuf),
    Failed { raw: PathBuf, error: CaptureError },
    Cancelled(PathBuf),
}

impl RecordingOutcome {
    pub fn raw_path(&self) -> &Path {
        match self {
            RecordingOutcome::Completed(raw)
            | RecordingOutcome::Failed { raw, .. }
            | RecordingOutcome::Cancelled(raw) => raw,
        }
    }
}

/// One blocking capture of a live stream into a fresh raw artifact.
#[derive(Clone)]
pub struct RecordingSession {
    tool: Arc<dyn MediaTool>,
    layout: ArtifactLayout,
    failure_pause: Duration,
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("root", &self.layout.root())
            .field("failure_pause", &self.failure_pause)
            .finish()
    }
}

impl RecordingSession {
    pub fn new(tool: Arc<dyn MediaTool>, layout: ArtifactLayout, failure_pause: Duration) -> Self {
        Self {
            tool,
            layout,
            failure_pause,
        }
    }

    /// Capture `source_url` into `{entity}/{entity}_{stamp}.{ext}`. When a
    /// raw or compressed artifact already carries that stamp, `-1`, `-2`, ...
    /// is appended until the name is free, so the raw file in the outcome
    /// is always one this call created.
    ///
    /// Returns once the tool exits. A non-zero exit is followed by the
    /// failure pause and reported as [`RecordingOutcome::Failed`]; no retry
    /// happens here. Only failing to create the entity directory is an
    /// error.
    pub async fn record(
        &self,
        entity: &str,
        source_url: &str,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RecordingOutcome> {
        let dir = self.layout.entity_dir(entity);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| CaptureError::filesystem(&dir, err))?;

        let raw = self.fresh_raw_path(entity, started_at).await;
        info!(
            target: "streamkeep::record",
            %entity,
            output = %raw.display(),
            "recording started"
        );

        match self.tool.capture(source_url, &raw, cancel).await {
            Ok(()) => {
                info!(target: "streamkeep::record", %entity, output = %raw.display(), "recording finished");
                Ok(RecordingOutcome::Completed(raw))
            }
            Err(CaptureError::Cancelled(_)) => {
                info!(target: "streamkeep::record", %entity, output = %raw.display(), "recording cancelled");
                Ok(RecordingOutcome::Cancelled(raw))
            }
            Err(error) => {
                warn!(
                    target: "streamkeep::record",
                    %entity,
                    output = %raw.display(),
                    error = %error,
                    pause = ?self.failure_pause,
                    "capture failed"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.failure_pause) => {}
                }
                Ok(RecordingOutcome::Failed { raw, error })
            }
        }
    }

    async fn fresh_raw_path(&self, entity: &str, started_at: DateTime<Utc>) -> PathBuf {
        let base = self.layout.stamp(started_at);
        let mut stamp = base.clone();
        let mut suffix = 0u32;
        loop {
            let raw = self.layout.raw_path(entity, &stamp);
            let compressed = self.layout.compressed_path(entity, &stamp);
            if !artifact::path_exists(&raw).await && !artifact::path_exists(&compressed).await {
                if suffix > 0 {
                    debug!(target: "streamkeep::record", %entity, stamp = %stamp, "stamp already taken, using suffix");
                }
                return raw;
            }
            suffix += 1;
            stamp = format!("{base}-{suffix}");
        }
    }
}

/// A raw file is worth compressing when it exists and holds any bytes.
pub async fn is_salvageable(raw: &Path) -> bool {
    tokio::fs::metadata(raw)
        .await
        .map(|metadata| metadata.is_file() && metadata.len() > 0)
        .unwrap_or(false)
}
