//! On-demand disk reclamation.
//!
//! Removes merged artifacts and their thumbnails, and raw or unrecognized
//! files older than the stale threshold. Compressed artifacts and the
//! manifest are never touched; they belong to the merge pipeline.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::artifact::{self, ArtifactEntry, ArtifactKind, ArtifactLayout};
use crate::error::{CaptureError, Result};
use crate::locks::DirectoryLocks;

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub files_removed: Vec<PathBuf>,
    pub dirs_removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, CaptureError)>,
}

impl RetentionReport {
    fn absorb(&mut self, other: RetentionReport) {
        self.files_removed.extend(other.files_removed);
        self.dirs_removed.extend(other.dirs_removed);
        self.failures.extend(other.failures);
    }
}

#[derive(Clone, Debug)]
pub struct RetentionSweep {
    layout: ArtifactLayout,
    locks: DirectoryLocks,
    stale_after: Duration,
}

impl RetentionSweep {
    pub fn new(layout: ArtifactLayout, locks: DirectoryLocks, stale_after: Duration) -> Self {
        Self {
            layout,
            locks,
            stale_after,
        }
    }

    pub fn should_delete(&self, entry: &ArtifactEntry, now: DateTime<Utc>) -> bool {
        match entry.kind {
            ArtifactKind::Merged | ArtifactKind::Thumbnail => true,
            ArtifactKind::Raw | ArtifactKind::Unrecognized => {
                entry.age_at(now) > self.stale_after
            }
            ArtifactKind::Compressed | ArtifactKind::Manifest => false,
        }
    }

    /// Sweep every entity directory, one at a time, each under its lock.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        for entity in artifact::list_entity_dirs(self.layout.root()).await? {
            let _guard = self.locks.lock(&entity).await;
            report.absorb(self.sweep_entity(&entity, now).await);
        }

        info!(
            target: "streamkeep::retention",
            files = report.files_removed.len(),
            dirs = report.dirs_removed.len(),
            failures = report.failures.len(),
            "retention sweep finished"
        );
        Ok(report)
    }

    /// Sweep one directory. The caller holds its lock.
    async fn sweep_entity(&self, entity: &str, now: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport::default();
        let dir = self.layout.entity_dir(entity);

        let entries = match artifact::list_artifacts(&self.layout, entity).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(target: "streamkeep::retention", %entity, error = %err, "cannot list entity directory");
                report.failures.push((dir, err));
                return report;
            }
        };

        for entry in entries.iter().filter(|entry| self.should_delete(entry, now)) {
            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => {
                    debug!(
                        target: "streamkeep::retention",
                        %entity,
                        file = %entry.name,
                        kind = entry.kind.as_str(),
                        "removed"
                    );
                    report.files_removed.push(entry.path.clone());
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(target: "streamkeep::retention", %entity, file = %entry.name, error = %err, "failed to remove");
                    report
                        .failures
                        .push((entry.path.clone(), CaptureError::filesystem(&entry.path, err)));
                }
            }
        }

        match is_empty_dir(&dir).await {
            Ok(true) => match tokio::fs::remove_dir(&dir).await {
                Ok(()) => {
                    info!(target: "streamkeep::retention", %entity, "removed empty entity directory");
                    report.dirs_removed.push(dir);
                }
                Err(err) => {
                    warn!(target: "streamkeep::retention", %entity, error = %err, "failed to remove empty directory");
                    report.failures.push((dir.clone(), CaptureError::filesystem(&dir, err)));
                }
            },
            Ok(false) => {}
            Err(err) => report.failures.push((dir, err)),
        }
        report
    }
}

async fn is_empty_dir(dir: &std::path::Path) -> Result<bool> {
    let mut reader = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| CaptureError::filesystem(dir, err))?;
    let first = reader
        .next_entry()
        .await
        .map_err(|err| CaptureError::filesystem(dir, err))?;
    Ok(first.is_none())
}
