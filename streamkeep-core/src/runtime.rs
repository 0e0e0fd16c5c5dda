//! Process supervisor.
//!
//! [`RecorderRuntime`] owns every long-lived task: one poller per tracked
//! entity, the merge scheduler, and the compression pool. It is also the
//! management surface: adding or removing an entity, toggling the activity
//! gate, and running a retention sweep all go through it. The disk watchdog
//! is handed out by [`RecorderRuntime::watchdog`] so the binary can decide
//! how to die.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activity::ActivityGate;
use crate::artifact::ArtifactLayout;
use crate::compression::CompressionWorker;
use crate::config::RecorderConfig;
use crate::error::{CaptureError, Result};
use crate::instance::InstanceLock;
use crate::locks::DirectoryLocks;
use crate::merge::{MergeJob, MergeScheduler};
use crate::poller::AvailabilityPoller;
use crate::recording::RecordingSession;
use crate::registry::{EntityRegistry, RegistryStore, RunningFlag, TrackedEntity};
use crate::retention::{RetentionReport, RetentionSweep};
use crate::status::{HttpStatusClient, StatusClient};
use crate::tool::{FfmpegTool, MediaTool};
use crate::watchdog::{DiskSpaceWatchdog, Fs2SpaceProbe, SpaceProbe};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Bound on waiting for a removed entity's poller to unwind.
const POLLER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators the runtime talks to.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub status: Arc<dyn StatusClient>,
    pub tool: Arc<dyn MediaTool>,
    pub probe: Arc<dyn SpaceProbe>,
}

impl RuntimeDeps {
    /// HTTP status client, ffmpeg, and the fs2 space probe.
    pub fn production(config: &RecorderConfig) -> Result<Self> {
        Ok(Self {
            status: Arc::new(HttpStatusClient::new(&config.status)?),
            tool: Arc::new(FfmpegTool::new(config.tool.clone())),
            probe: Arc::new(Fs2SpaceProbe),
        })
    }
}

impl fmt::Debug for RuntimeDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeDeps").finish_non_exhaustive()
    }
}

struct PollerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RecorderRuntime {
    config: Arc<RecorderConfig>,
    layout: ArtifactLayout,
    deps: RuntimeDeps,
    registry: Arc<EntityRegistry>,
    store: RegistryStore,
    gate: ActivityGate,
    locks: DirectoryLocks,
    compression: CompressionWorker,
    retention: RetentionSweep,
    shutdown_token: CancellationToken,
    pollers: Mutex<HashMap<String, PollerHandle>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes registry mutations with their persistence.
    membership: Mutex<()>,
    /// Held from `start` until `shutdown` completes.
    instance: Mutex<Option<InstanceLock>>,
}

impl fmt::Debug for RecorderRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let poller_count = self
            .pollers
            .try_lock()
            .map(|pollers| pollers.len())
            .unwrap_or_default();
        f.debug_struct("RecorderRuntime")
            .field("root", &self.layout.root())
            .field("registry", &self.registry)
            .field("active", &self.gate.is_active())
            .field("poller_count", &poller_count)
            .field("compression", &self.compression)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl RecorderRuntime {
    pub fn new(config: RecorderConfig, deps: RuntimeDeps) -> Self {
        let layout = ArtifactLayout::from_config(&config.storage);
        let locks = DirectoryLocks::new();
        let compression = CompressionWorker::new(
            Arc::clone(&deps.tool),
            layout.clone(),
            config.tool.max_parallel_compressions,
        );
        let retention = RetentionSweep::new(
            layout.clone(),
            locks.clone(),
            config.retention.stale_after(),
        );

        Self {
            store: RegistryStore::new(config.storage.registry_path.clone()),
            gate: ActivityGate::new(config.start_active),
            config: Arc::new(config),
            layout,
            deps,
            registry: Arc::new(EntityRegistry::new()),
            locks,
            compression,
            retention,
            shutdown_token: CancellationToken::new(),
            pollers: Mutex::new(HashMap::new()),
            worker_handles: Mutex::new(Vec::new()),
            membership: Mutex::new(()),
            instance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn registry(&self) -> Arc<EntityRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn watchdog(&self) -> DiskSpaceWatchdog {
        DiskSpaceWatchdog::from_config(
            Arc::clone(&self.deps.probe),
            self.layout.root(),
            &self.config.watchdog,
        )
    }

    /// Bring the system up: take the instance lock, check free space, load
    /// the registry, requeue leftover raw files, then start pollers and the
    /// merge scheduler.
    ///
    /// Recovery finishes listing raw files before the first poller exists,
    /// so a capture started by this process is never mistaken for a
    /// leftover.
    pub async fn start(&self) -> Result<()> {
        let root = self.layout.root();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|err| CaptureError::filesystem(root, err))?;

        {
            let mut instance = self.instance.lock().await;
            if instance.is_none() {
                *instance = Some(InstanceLock::acquire(root)?);
            }
        }

        let available = self.watchdog().check_once()?;
        info!(available, root = %root.display(), "storage volume ready");

        let document = self.store.load().await?;
        let membership = self.membership.lock().await;
        let mut flags = Vec::with_capacity(document.streamers.len());
        for record in document.streamers {
            match self.registry.add(&record.username).await {
                Ok(flag) => flags.push(flag),
                Err(err) => warn!(entity = %record.username, error = %err, "skipping registry entry"),
            }
        }
        // Running flags on disk describe the previous process.
        self.store.save(&self.registry.list().await).await?;

        let requeued = self.compression.recover_pending().await?;
        if requeued > 0 {
            info!(requeued, "recovering raw artifacts from a previous run");
        }

        for flag in flags {
            self.spawn_poller(flag).await;
        }
        drop(membership);

        self.spawn_merge_scheduler().await;
        info!(
            entities = self.registry.len().await,
            active = self.gate.is_active(),
            "recorder runtime started"
        );
        Ok(())
    }

    async fn spawn_poller(&self, flag: RunningFlag) {
        let entity = flag.entity().to_string();
        let cancel = self.shutdown_token.child_token();
        let poller = AvailabilityPoller::new(
            flag,
            Arc::clone(&self.deps.status),
            RecordingSession::new(
                Arc::clone(&self.deps.tool),
                self.layout.clone(),
                self.config.poller.capture_failure_pause(),
            ),
            self.compression.clone(),
            self.gate.clone(),
            self.config.poller,
            cancel.clone(),
        );
        let handle = tokio::spawn(poller.run());

        let mut pollers = self.pollers.lock().await;
        if let Some(previous) = pollers.insert(entity, PollerHandle { cancel, handle }) {
            previous.cancel.cancel();
        }
    }

    async fn spawn_merge_scheduler(&self) {
        let scheduler = MergeScheduler::new(
            MergeJob::new(
                Arc::clone(&self.deps.tool),
                self.layout.clone(),
                self.config.merge.min_age(),
            ),
            self.layout.clone(),
            self.locks.clone(),
            self.gate.clone(),
            self.config.merge.max_parallel_jobs,
            self.shutdown_token.child_token(),
        );
        let handle = tokio::spawn(scheduler.run());
        self.worker_handles.lock().await.push(handle);
    }

    /// Track a new entity, persist the registry, and start its poller.
    pub async fn add_entity(&self, id: &str) -> Result<TrackedEntity> {
        let _membership = self.membership.lock().await;
        let flag = self.registry.add(id).await?;

        if let Err(err) = self.store.save(&self.registry.list().await).await {
            self.registry.remove(id).await?;
            return Err(err);
        }

        let snapshot = TrackedEntity {
            id: id.to_string(),
            is_running: flag.get(),
        };
        self.spawn_poller(flag).await;
        info!(entity = %id, "entity added");
        Ok(snapshot)
    }

    /// Stop tracking an entity. Its poller is cancelled, which kills any
    /// capture in progress; the partial raw file is recovered next start.
    pub async fn remove_entity(&self, id: &str) -> Result<TrackedEntity> {
        let _membership = self.membership.lock().await;
        let removed = self.registry.remove(id).await?;
        self.store.save(&self.registry.list().await).await?;

        let handle = self.pollers.lock().await.remove(id);
        if let Some(PollerHandle { cancel, handle }) = handle {
            cancel.cancel();
            if tokio::time::timeout(POLLER_STOP_TIMEOUT, handle).await.is_err() {
                warn!(entity = %id, "poller did not stop in time");
            }
        }
        info!(entity = %id, "entity removed");
        Ok(removed)
    }

    pub async fn entities(&self) -> Vec<TrackedEntity> {
        self.registry.list().await
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    /// Pause or resume polling and merging. In-flight captures, compressions
    /// and merges are not interrupted.
    pub fn set_active(&self, active: bool) {
        if self.gate.set_active(active) {
            info!(active, "activity changed");
        }
    }

    pub async fn sweep_retention(&self) -> Result<RetentionReport> {
        self.retention.sweep(Utc::now()).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_grace(DEFAULT_SHUTDOWN_GRACE).await
    }

    /// Cancel every task and wait for them, each bounded by `grace`.
    pub async fn shutdown_with_grace(&self, grace: Duration) -> Result<()> {
        info!("initiating graceful shutdown of recorder runtime");
        self.shutdown_token.cancel();

        let pollers: Vec<_> = self.pollers.lock().await.drain().collect();
        for (entity, PollerHandle { handle, .. }) in pollers {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%entity, "poller task failed: {err}"),
                Err(_) => warn!(%entity, "poller timed out during shutdown"),
            }
        }

        let workers = std::mem::take(&mut *self.worker_handles.lock().await);
        for handle in workers {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("worker task failed: {err}"),
                Err(_) => warn!("worker task timed out during shutdown"),
            }
        }

        self.compression.drain(grace).await;

        {
            let _membership = self.membership.lock().await;
            self.store.save(&self.registry.list().await).await?;
        }
        self.instance.lock().await.take();
        info!("recorder runtime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusReport;
    use async_trait::async_trait;
    use std::path::Path;

    struct Offline;

    #[async_trait]
    impl StatusClient for Offline {
        async fn fetch(&self, _entity: &str) -> Result<StatusReport> {
            Ok(StatusReport::Offline)
        }
    }

    struct NoTool;

    #[async_trait]
    impl MediaTool for NoTool {
        async fn capture(&self, _: &str, _: &Path, _: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn compress(&self, _: &Path, _: &Path) -> Result<()> {
            Ok(())
        }
        async fn concat(&self, _: &Path, _: &Path) -> Result<()> {
            Ok(())
        }
        async fn thumbnail(&self, _: &Path, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct Plenty(u64);

    impl SpaceProbe for Plenty {
        fn available_bytes(&self, _: &Path) -> std::io::Result<u64> {
            Ok(self.0)
        }
    }

    fn runtime(root: &Path, free: u64) -> RecorderRuntime {
        let mut config = RecorderConfig::default();
        config.storage.download_dir = root.join("downloads");
        config.storage.registry_path = root.join("streamers.json");
        RecorderRuntime::new(
            config,
            RuntimeDeps {
                status: Arc::new(Offline),
                tool: Arc::new(NoTool),
                probe: Arc::new(Plenty(free)),
            },
        )
    }

    #[tokio::test]
    async fn refuses_to_start_without_space() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = runtime(dir.path(), 1).start().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn loads_registry_and_resets_running_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("streamers.json"),
            r#"{"streamers":[{"username":"alice","running":true},{"username":"../etc","running":false}]}"#,
        )
        .unwrap();

        let runtime = runtime(dir.path(), u64::MAX);
        runtime.start().await.expect("start");
        assert_eq!(
            runtime.entities().await,
            vec![TrackedEntity {
                id: "alice".into(),
                is_running: false,
            }]
        );

        let saved = std::fs::read_to_string(dir.path().join("streamers.json")).unwrap();
        assert!(saved.contains("\"running\": false"), "{saved}");
        runtime
            .shutdown_with_grace(Duration::from_secs(1))
            .await
            .expect("shutdown");
    }

    #[tokio::test]
    async fn membership_changes_are_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime(dir.path(), u64::MAX);
        runtime.start().await.expect("start");

        runtime.add_entity("alice").await.expect("add alice");
        runtime.add_entity("bob").await.expect("add bob");
        assert!(matches!(
            runtime.add_entity("bob").await,
            Err(CaptureError::EntityExists(_))
        ));
        runtime.remove_entity("alice").await.expect("remove alice");
        assert!(matches!(
            runtime.remove_entity("alice").await,
            Err(CaptureError::EntityNotFound(_))
        ));

        let document = RegistryStore::new(dir.path().join("streamers.json"))
            .load()
            .await
            .expect("load");
        let names: Vec<_> = document.streamers.iter().map(|s| s.username.as_str()).collect();
        assert_eq!(names, vec!["bob"]);

        runtime.set_active(false);
        assert!(!runtime.is_active());
        runtime
            .shutdown_with_grace(Duration::from_secs(1))
            .await
            .expect("shutdown");
    }

    #[tokio::test]
    async fn offline_registry_edits_are_refused_while_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloads = dir.path().join("downloads");
        let daemon = runtime(dir.path(), u64::MAX);
        daemon.start().await.expect("start");

        assert!(matches!(
            InstanceLock::acquire(&downloads),
            Err(CaptureError::AlreadyRunning { .. })
        ));
        assert!(matches!(
            runtime(dir.path(), u64::MAX).start().await,
            Err(CaptureError::AlreadyRunning { .. })
        ));

        daemon
            .shutdown_with_grace(Duration::from_secs(1))
            .await
            .expect("shutdown");
        InstanceLock::acquire(&downloads).expect("lock released after shutdown");
    }
}
