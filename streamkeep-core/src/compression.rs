//! Raw → compressed transcoding.
//!
//! Jobs are fire-and-forget from the poller's point of view but bounded by a
//! semaphore, and their handles are kept so shutdown can wait for them. The
//! raw input is removed only after the tool reports success; on failure the
//! partial output goes and the raw file stays for the next startup's
//! recovery pass.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifact::{self, ArtifactKind, ArtifactLayout};
use crate::error::{CaptureError, Result};
use crate::recording;
use crate::tool::MediaTool;

#[derive(Clone)]
pub struct CompressionWorker {
    inner: Arc<Inner>,
}

struct Inner {
    tool: Arc<dyn MediaTool>,
    layout: ArtifactLayout,
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for CompressionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionWorker")
            .field("root", &self.inner.layout.root())
            .field("available_permits", &self.inner.permits.available_permits())
            .finish()
    }
}

impl CompressionWorker {
    pub fn new(tool: Arc<dyn MediaTool>, layout: ArtifactLayout, max_parallel: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                tool,
                layout,
                permits: Arc::new(Semaphore::new(max_parallel.max(1))),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Compress one raw artifact and wait for the result.
    pub async fn compress(&self, entity: &str, raw: &Path) -> Result<PathBuf> {
        let compressed = self
            .inner
            .layout
            .compressed_for_raw(entity, raw)
            .ok_or_else(|| {
                CaptureError::filesystem(
                    raw,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "not a raw artifact of this entity",
                    ),
                )
            })?;

        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| CaptureError::Cancelled(format!("compression of {}", raw.display())))?;

        debug!(
            target: "streamkeep::compress",
            %entity,
            input = %raw.display(),
            output = %compressed.display(),
            "compression started"
        );

        if let Err(err) = self.inner.tool.compress(raw, &compressed).await {
            if let Err(cleanup) = artifact::remove_if_exists(&compressed).await {
                warn!(
                    target: "streamkeep::compress",
                    %entity,
                    error = %cleanup,
                    "failed to remove partial compressed output"
                );
            }
            return Err(err);
        }

        tokio::fs::remove_file(raw)
            .await
            .map_err(|err| CaptureError::filesystem(raw, err))?;

        info!(
            target: "streamkeep::compress",
            %entity,
            output = %compressed.display(),
            "compression finished"
        );
        Ok(compressed)
    }

    /// Start compressing `raw` in the background.
    pub async fn submit(&self, entity: &str, raw: PathBuf) {
        let worker = self.clone();
        let entity = entity.to_string();
        let handle = tokio::spawn(async move {
            if let Err(err) = worker.compress(&entity, &raw).await {
                error!(
                    target: "streamkeep::compress",
                    %entity,
                    input = %raw.display(),
                    error = %err,
                    "compression failed; raw artifact retained"
                );
            }
        });

        let mut handles = self.inner.handles.lock().await;
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    /// Queue every raw artifact left on disk. Only call this while nothing
    /// is recording. Empty raw files are removed instead.
    pub async fn recover_pending(&self) -> Result<usize> {
        let layout = &self.inner.layout;
        let mut queued = 0;

        for entity in artifact::list_entity_dirs(layout.root()).await? {
            let entries = match artifact::list_artifacts(layout, &entity).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(target: "streamkeep::compress", %entity, error = %err, "skipping entity during recovery");
                    continue;
                }
            };

            for entry in entries.into_iter().filter(|e| e.kind == ArtifactKind::Raw) {
                if recording::is_salvageable(&entry.path).await {
                    info!(
                        target: "streamkeep::compress",
                        %entity,
                        input = %entry.path.display(),
                        "re-queueing leftover raw artifact"
                    );
                    self.submit(&entity, entry.path).await;
                    queued += 1;
                } else if let Err(err) = artifact::remove_if_exists(&entry.path).await {
                    warn!(target: "streamkeep::compress", %entity, error = %err, "failed to remove empty raw artifact");
                }
            }
        }
        Ok(queued)
    }

    pub async fn in_flight(&self) -> usize {
        let handles = self.inner.handles.lock().await;
        handles.iter().filter(|handle| !handle.is_finished()).count()
    }

    /// Wait for submitted jobs, each bounded by `grace`.
    pub async fn drain(&self, grace: Duration) {
        let handles = {
            let mut guard = self.inner.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "streamkeep::compress", "compression task failed: {err}"),
                Err(_) => warn!(target: "streamkeep::compress", "compression task still running at shutdown"),
            }
        }
    }
}
