use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{MergeJob, MergeReport};
use super::window;
use crate::activity::ActivityGate;
use crate::artifact::{self, ArtifactLayout};
use crate::error::{CaptureError, Result};
use crate::locks::DirectoryLocks;

/// Outcome of one merge window across all entity directories.
#[derive(Debug, Default)]
pub struct WindowReport {
    pub window: Option<DateTime<Utc>>,
    pub reports: Vec<MergeReport>,
    pub failures: Vec<(String, CaptureError)>,
}

impl WindowReport {
    pub fn merged(&self) -> usize {
        self.reports.iter().filter(|r| r.merged.is_some()).count()
    }
}

/// Process-wide clock-aligned merge loop.
pub struct MergeScheduler {
    job: MergeJob,
    layout: ArtifactLayout,
    locks: DirectoryLocks,
    gate: ActivityGate,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl fmt::Debug for MergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeScheduler")
            .field("root", &self.layout.root())
            .field("available_permits", &self.permits.available_permits())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl MergeScheduler {
    pub fn new(
        job: MergeJob,
        layout: ArtifactLayout,
        locks: DirectoryLocks,
        gate: ActivityGate,
        max_parallel_jobs: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            layout,
            locks,
            gate,
            permits: Arc::new(Semaphore::new(max_parallel_jobs.max(1))),
            cancel,
        }
    }

    /// Run one window: every entity directory on disk gets its own job,
    /// bounded by the job semaphore, each under its directory lock.
    pub async fn run_window(&self, window: DateTime<Utc>) -> Result<WindowReport> {
        let entities = artifact::list_entity_dirs(self.layout.root()).await?;
        debug!(target: "streamkeep::merge", %window, entities = entities.len(), "merge window opened");

        let tasks = entities.into_iter().map(|entity| {
            let job = self.job.clone();
            let locks = self.locks.clone();
            let permits = Arc::clone(&self.permits);
            let task_entity = entity.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(|_| {
                    CaptureError::Cancelled(format!("merge of {task_entity}"))
                })?;
                let _guard = locks.lock(&task_entity).await;
                job.run(&task_entity, window).await
            });
            async move { (entity, handle.await) }
        });

        let mut report = WindowReport {
            window: Some(window),
            ..WindowReport::default()
        };
        for (entity, joined) in join_all(tasks).await {
            match joined {
                Ok(Ok(merge)) => report.reports.push(merge),
                Ok(Err(err)) => {
                    warn!(target: "streamkeep::merge", %entity, error = %err, "merge job failed; manifest kept for next window");
                    report.failures.push((entity, err));
                }
                Err(err) => {
                    error!(target: "streamkeep::merge", %entity, "merge task panicked: {err}");
                }
            }
        }

        info!(
            target: "streamkeep::merge",
            %window,
            merged = report.merged(),
            failed = report.failures.len(),
            "merge window closed"
        );
        Ok(report)
    }

    /// Sleep until each `:00`/`:30` boundary and run its window. Boundaries
    /// reached while inactive are skipped. A window that has started runs to
    /// completion even if cancellation arrives meanwhile.
    pub async fn run(self) {
        info!(target: "streamkeep::merge", "merge scheduler started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.gate.wait_active() => {}
            }

            let now = Utc::now();
            let next = window::next_window_after(now);
            let wait = window::until(now, next);
            debug!(target: "streamkeep::merge", %next, ?wait, "waiting for next merge window");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if !self.gate.is_active() {
                info!(target: "streamkeep::merge", window = %next, "inactive; merge window skipped");
                continue;
            }

            if let Err(err) = self.run_window(next).await {
                error!(target: "streamkeep::merge", window = %next, error = %err, "merge window aborted");
            }
        }
        info!(target: "streamkeep::merge", "merge scheduler stopped");
    }
}
