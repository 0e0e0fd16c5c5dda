use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::manifest;
use crate::artifact::{self, ArtifactKind, ArtifactLayout};
use crate::error::{CaptureError, Result};
use crate::tool::MediaTool;

/// What one entity's merge did in a window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub entity: String,
    /// Names appended to the manifest by this window's scan.
    pub queued: usize,
    /// Sources concatenated; zero when the job had nothing to do.
    pub merged_sources: usize,
    pub merged: Option<PathBuf>,
    pub thumbnail: Option<PathBuf>,
    pub pruned: usize,
}

/// Scan, concatenate, thumbnail, and prune for one entity directory.
///
/// Callers hold the entity's directory lock for the whole run.
#[derive(Clone)]
pub struct MergeJob {
    tool: Arc<dyn MediaTool>,
    layout: ArtifactLayout,
    min_age: Duration,
}

impl std::fmt::Debug for MergeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeJob")
            .field("root", &self.layout.root())
            .field("min_age", &self.min_age)
            .finish()
    }
}

impl MergeJob {
    pub fn new(tool: Arc<dyn MediaTool>, layout: ArtifactLayout, min_age: Duration) -> Self {
        Self {
            tool,
            layout,
            min_age,
        }
    }

    /// Compressed artifacts of `entity` aged at least `min_age` at `window`,
    /// sorted by name.
    pub async fn eligible(&self, entity: &str, window: DateTime<Utc>) -> Result<Vec<String>> {
        let entries = artifact::list_artifacts(&self.layout, entity).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.kind == ArtifactKind::Compressed)
            .filter(|entry| entry.is_aged(window, self.min_age))
            .map(|entry| entry.name)
            .collect())
    }

    /// Append eligible artifacts to the manifest. Returns how many were new.
    pub async fn scan(&self, entity: &str, window: DateTime<Utc>) -> Result<usize> {
        let names = self.eligible(entity, window).await?;
        manifest::append_to_manifest(&self.layout.manifest_path(entity), &names).await
    }

    /// Scan, then merge whatever the manifest lists.
    pub async fn run(&self, entity: &str, window: DateTime<Utc>) -> Result<MergeReport> {
        let queued = self.scan(entity, window).await?;
        let mut report = self.merge(entity, window).await?;
        report.queued = queued;
        Ok(report)
    }

    /// Consume the manifest. On a failed concat the manifest and its
    /// sources are left for the next window.
    pub async fn merge(&self, entity: &str, window: DateTime<Utc>) -> Result<MergeReport> {
        let mut report = MergeReport {
            entity: entity.to_string(),
            ..MergeReport::default()
        };
        let manifest_path = self.layout.manifest_path(entity);

        let listed = manifest::read_manifest(&manifest_path).await?.unwrap_or_default();
        let sources = self.present_sources(entity, listed.as_slice()).await;
        if sources.len() != listed.len() && !sources.is_empty() {
            manifest::write_manifest(&manifest_path, &sources).await?;
        }
        if sources.is_empty() {
            // Empty, or every listed source has disappeared.
            artifact::remove_if_exists(&manifest_path).await?;
            debug!(target: "streamkeep::merge", %entity, "nothing to merge");
            return Ok(report);
        }

        let merged = self.layout.merged_path(entity, &self.layout.stamp(window));
        if artifact::path_exists(&merged).await {
            // Another window already produced this name; keep the manifest
            // and its sources for a window whose stamp is free.
            return Err(CaptureError::ArtifactExists(merged));
        }
        info!(
            target: "streamkeep::merge",
            %entity,
            sources = sources.len(),
            output = %merged.display(),
            "merging"
        );

        if let Err(err) = self.tool.concat(&manifest_path, &merged).await {
            if let Err(cleanup) = artifact::remove_if_exists(&merged).await {
                warn!(target: "streamkeep::merge", %entity, error = %cleanup, "failed to remove partial merged output");
            }
            return Err(err);
        }
        report.merged_sources = sources.len();
        report.merged = Some(merged.clone());

        let thumbnail = ArtifactLayout::thumbnail_path(&merged);
        match self.tool.thumbnail(&merged, &thumbnail).await {
            Ok(()) => report.thumbnail = Some(thumbnail),
            Err(err) => {
                warn!(target: "streamkeep::merge", %entity, error = %err, "thumbnail generation failed")
            }
        }

        tokio::fs::remove_file(&manifest_path)
            .await
            .map_err(|err| CaptureError::filesystem(&manifest_path, err))?;

        report.pruned = self.prune(entity, window).await?;
        info!(
            target: "streamkeep::merge",
            %entity,
            pruned = report.pruned,
            "merge finished"
        );
        Ok(report)
    }

    /// Listed names whose file is still in the entity directory. Missing
    /// ones would fail every concat, so they are dropped here.
    async fn present_sources(&self, entity: &str, listed: &[String]) -> Vec<String> {
        let dir = self.layout.entity_dir(entity);
        let mut present = Vec::with_capacity(listed.len());
        for name in listed {
            if artifact::path_exists(&dir.join(name)).await {
                present.push(name.clone());
            } else {
                warn!(target: "streamkeep::merge", %entity, source = %name, "dropping missing source from manifest");
            }
        }
        present
    }

    /// Delete compressed artifacts that satisfy the scan predicate at
    /// `window`. Per-file failures are logged and skipped.
    async fn prune(&self, entity: &str, window: DateTime<Utc>) -> Result<usize> {
        let mut pruned = 0;
        for name in self.eligible(entity, window).await? {
            let path = self.layout.entity_dir(entity).join(&name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => pruned += 1,
                Err(err) => {
                    warn!(target: "streamkeep::merge", %entity, path = %path.display(), error = %err, "failed to prune merged source")
                }
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolOperation;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::SystemTime;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeConcat {
        fail_concat: bool,
        fail_thumbnail: bool,
        seen_manifests: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl MediaTool for FakeConcat {
        async fn capture(&self, _: &str, _: &Path, _: &CancellationToken) -> Result<()> {
            unreachable!()
        }

        async fn compress(&self, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }

        async fn concat(&self, manifest: &Path, output: &Path) -> Result<()> {
            let text = std::fs::read_to_string(manifest).unwrap();
            self.seen_manifests
                .lock()
                .unwrap()
                .push(manifest::parse_manifest(&text));
            std::fs::write(output, b"merged").unwrap();
            if self.fail_concat {
                return Err(CaptureError::ExternalToolFailure {
                    operation: ToolOperation::Merge,
                    target: output.to_path_buf(),
                    detail: "exit status: 1".into(),
                });
            }
            Ok(())
        }

        async fn thumbnail(&self, _: &Path, output: &Path) -> Result<()> {
            if self.fail_thumbnail {
                return Err(CaptureError::ExternalToolFailure {
                    operation: ToolOperation::Thumbnail,
                    target: output.to_path_buf(),
                    detail: "no video stream".into(),
                });
            }
            std::fs::write(output, b"png").unwrap();
            Ok(())
        }
    }

    fn window() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    fn seed(dir: &Path, name: &str, modified: DateTime<Utc>) {
        let path = dir.join(name);
        std::fs::write(&path, b"data").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::from(modified)).unwrap();
    }

    fn job(root: &Path, tool: Arc<FakeConcat>) -> MergeJob {
        MergeJob::new(
            tool,
            ArtifactLayout::new(root, "mkv", "%Y-%m-%d_%H-%M-%S"),
            Duration::from_secs(3 * 3600),
        )
    }

    #[tokio::test]
    async fn merges_aged_sources_and_prunes_them() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("bob");
        std::fs::create_dir_all(&dir).unwrap();
        seed(&dir, "bob_compressed_a.mkv", window() - chrono::Duration::hours(5));
        seed(&dir, "bob_compressed_b.mkv", window() - chrono::Duration::hours(4));
        seed(&dir, "bob_compressed_c.mkv", window() - chrono::Duration::hours(1));

        let tool = Arc::new(FakeConcat::default());
        let report = job(root.path(), Arc::clone(&tool))
            .run("bob", window())
            .await
            .expect("run");

        assert_eq!(report.queued, 2);
        assert_eq!(report.merged_sources, 2);
        assert_eq!(report.pruned, 2);
        assert_eq!(
            tool.seen_manifests.lock().unwrap().as_slice(),
            [vec![
                "bob_compressed_a.mkv".to_string(),
                "bob_compressed_b.mkv".to_string()
            ]]
        );

        let merged = dir.join("MERGED_2024-05-01_12-30-00.mkv");
        assert_eq!(report.merged.as_deref(), Some(merged.as_path()));
        assert!(merged.exists());
        assert!(dir.join("MERGED_2024-05-01_12-30-00.mkv_MERGED.png").exists());
        assert!(!dir.join("toMerge.txt").exists());
        assert!(!dir.join("bob_compressed_a.mkv").exists());
        assert!(dir.join("bob_compressed_c.mkv").exists());
    }

    #[tokio::test]
    async fn failed_concat_keeps_manifest_and_sources() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("bob");
        std::fs::create_dir_all(&dir).unwrap();
        seed(&dir, "bob_compressed_a.mkv", window() - chrono::Duration::hours(4));

        let tool = Arc::new(FakeConcat {
            fail_concat: true,
            ..FakeConcat::default()
        });
        let job = job(root.path(), tool);
        let err = job.run("bob", window()).await.unwrap_err();
        assert!(matches!(err, CaptureError::ExternalToolFailure { .. }));

        assert!(dir.join("bob_compressed_a.mkv").exists());
        assert!(dir.join("toMerge.txt").exists());
        assert!(!dir.join("MERGED_2024-05-01_12-30-00.mkv").exists());

        // The retry window does not list the source twice.
        let retry = window() + chrono::Duration::minutes(30);
        assert_eq!(job.scan("bob", retry).await.expect("rescan"), 0);
    }

    #[tokio::test]
    async fn thumbnail_failure_does_not_abort() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("bob");
        std::fs::create_dir_all(&dir).unwrap();
        seed(&dir, "bob_compressed_a.mkv", window() - chrono::Duration::hours(4));

        let tool = Arc::new(FakeConcat {
            fail_thumbnail: true,
            ..FakeConcat::default()
        });
        let report = job(root.path(), tool).run("bob", window()).await.expect("run");
        assert!(report.merged.is_some());
        assert_eq!(report.thumbnail, None);
        assert_eq!(report.pruned, 1);
        assert!(!dir.join("toMerge.txt").exists());
    }

    #[tokio::test]
    async fn missing_sources_are_dropped_from_the_manifest() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("bob");
        std::fs::create_dir_all(&dir).unwrap();
        seed(&dir, "bob_compressed_b.mkv", window() - chrono::Duration::hours(4));
        manifest::append_to_manifest(
            &dir.join("toMerge.txt"),
            &["bob_compressed_a.mkv".to_string()],
        )
        .await
        .expect("seed manifest");

        let tool = Arc::new(FakeConcat::default());
        let report = job(root.path(), Arc::clone(&tool))
            .run("bob", window())
            .await
            .expect("run");

        assert_eq!(report.merged_sources, 1);
        assert_eq!(
            tool.seen_manifests.lock().unwrap().as_slice(),
            [vec!["bob_compressed_b.mkv".to_string()]]
        );
        assert!(!dir.join("toMerge.txt").exists());
    }

    #[tokio::test]
    async fn manifest_of_only_missing_sources_is_discarded() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("bob");
        std::fs::create_dir_all(&dir).unwrap();
        manifest::append_to_manifest(
            &dir.join("toMerge.txt"),
            &["bob_compressed_gone.mkv".to_string()],
        )
        .await
        .expect("seed manifest");

        let tool = Arc::new(FakeConcat::default());
        let report = job(root.path(), Arc::clone(&tool))
            .merge("bob", window())
            .await
            .expect("merge");

        assert_eq!(report.merged, None);
        assert!(tool.seen_manifests.lock().unwrap().is_empty());
        assert!(!dir.join("toMerge.txt").exists());
    }

    #[tokio::test]
    async fn existing_merged_output_is_never_replaced() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("bob");
        std::fs::create_dir_all(&dir).unwrap();
        seed(&dir, "bob_compressed_a.mkv", window() - chrono::Duration::hours(4));
        let earlier = dir.join("MERGED_2024-05-01_12-30-00.mkv");
        std::fs::write(&earlier, b"earlier").unwrap();

        let tool = Arc::new(FakeConcat::default());
        let err = job(root.path(), Arc::clone(&tool))
            .run("bob", window())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::ArtifactExists(path) if path == earlier));
        assert_eq!(std::fs::read(&earlier).unwrap(), b"earlier");
        assert!(tool.seen_manifests.lock().unwrap().is_empty());
        assert!(dir.join("bob_compressed_a.mkv").exists());
        assert!(dir.join("toMerge.txt").exists());
    }

    #[tokio::test]
    async fn nothing_eligible_is_a_no_op() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("bob");
        std::fs::create_dir_all(&dir).unwrap();
        seed(&dir, "bob_compressed_a.mkv", window() - chrono::Duration::minutes(10));

        let tool = Arc::new(FakeConcat::default());
        let report = job(root.path(), Arc::clone(&tool))
            .run("bob", window())
            .await
            .expect("run");
        assert_eq!(report.merged, None);
        assert!(tool.seen_manifests.lock().unwrap().is_empty());
        assert!(!dir.join("toMerge.txt").exists());
    }
}
