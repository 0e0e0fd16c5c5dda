//! Per-entity availability loop.
//!
//! One [`AvailabilityPoller`] runs per tracked entity. It alone writes the
//! entity's running flag, and it records synchronously: no new status
//! request is issued while a capture is in progress. Transport failures are
//! retried inside the same task with exponential backoff.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivityGate;
use crate::artifact;
use crate::compression::CompressionWorker;
use crate::config::PollerConfig;
use crate::error::CaptureError;
use crate::recording::{self, RecordingOutcome, RecordingSession};
use crate::registry::RunningFlag;
use crate::status::{StatusClient, StatusReport};

/// Exponential delay between retries of a failed status request.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_config(config: &PollerConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_max())
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Result of one poll iteration.
#[derive(Debug)]
pub enum PollOutcome {
    /// The entity was live and a capture ran to completion.
    Recorded { raw: PathBuf },
    /// The entity was live but the capture tool failed. `salvaged` tells
    /// whether the partial raw file was still queued for compression.
    CaptureFailed { raw: PathBuf, salvaged: bool },
    Offline,
    Absent,
    Unexpected(u16),
    /// Request failed or the answer was unusable; retried with backoff.
    Transient(CaptureError),
    /// Local failure while preparing to record.
    Fault(CaptureError),
    Cancelled,
}

pub struct AvailabilityPoller {
    entity: String,
    flag: RunningFlag,
    status: Arc<dyn StatusClient>,
    recorder: RecordingSession,
    compression: CompressionWorker,
    gate: ActivityGate,
    config: PollerConfig,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl fmt::Debug for AvailabilityPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvailabilityPoller")
            .field("entity", &self.entity)
            .field("running", &self.flag.get())
            .field("backoff_attempt", &self.backoff.attempt())
            .finish()
    }
}

impl AvailabilityPoller {
    pub fn new(
        flag: RunningFlag,
        status: Arc<dyn StatusClient>,
        recorder: RecordingSession,
        compression: CompressionWorker,
        gate: ActivityGate,
        config: PollerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            entity: flag.entity().to_string(),
            flag,
            status,
            recorder,
            compression,
            gate,
            backoff: Backoff::from_config(&config),
            config,
            cancel,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// One status request and, if live, one full capture.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return PollOutcome::Cancelled,
            fetched = self.status.fetch(&self.entity) => fetched,
        };

        let report = match fetched {
            Ok(report) => {
                self.backoff.reset();
                report
            }
            Err(err) if err.is_transient() => return PollOutcome::Transient(err),
            Err(err) => return PollOutcome::Fault(err),
        };

        match report {
            StatusReport::Live { media_url, .. } => self.record(&media_url).await,
            StatusReport::Offline => {
                self.flag.set(false);
                PollOutcome::Offline
            }
            StatusReport::Absent => PollOutcome::Absent,
            StatusReport::Unexpected(status) => PollOutcome::Unexpected(status),
        }
    }

    async fn record(&mut self, media_url: &str) -> PollOutcome {
        self.flag.set(true);

        let outcome = match self
            .recorder
            .record(&self.entity, media_url, Utc::now(), &self.cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return PollOutcome::Fault(err),
        };

        match outcome {
            RecordingOutcome::Completed(raw) => {
                self.compression.submit(&self.entity, raw.clone()).await;
                PollOutcome::Recorded { raw }
            }
            RecordingOutcome::Failed { raw, .. } => {
                let salvaged = recording::is_salvageable(&raw).await;
                if salvaged {
                    info!(
                        target: "streamkeep::poller",
                        entity = %self.entity,
                        raw = %raw.display(),
                        "compressing footage captured before the failure"
                    );
                    self.compression.submit(&self.entity, raw.clone()).await;
                } else if let Err(err) = artifact::remove_if_exists(&raw).await {
                    warn!(target: "streamkeep::poller", entity = %self.entity, error = %err, "failed to remove empty raw artifact");
                }
                PollOutcome::CaptureFailed { raw, salvaged }
            }
            // Left on disk; startup recovery compresses it.
            RecordingOutcome::Cancelled(_) => PollOutcome::Cancelled,
        }
    }

    /// Pause that should follow `outcome`, or `None` to stop the loop.
    fn wait_after(&mut self, outcome: &PollOutcome) -> Option<Duration> {
        match outcome {
            PollOutcome::Recorded { .. } | PollOutcome::CaptureFailed { .. } => {
                Some(Duration::ZERO)
            }
            PollOutcome::Offline | PollOutcome::Absent | PollOutcome::Unexpected(_) => {
                Some(self.config.idle_interval())
            }
            PollOutcome::Transient(_) => Some(self.backoff.next_delay()),
            PollOutcome::Fault(_) => Some(self.config.capture_failure_pause()),
            PollOutcome::Cancelled => None,
        }
    }

    /// Poll until cancelled. Parks while the activity gate is closed.
    pub async fn run(mut self) {
        info!(target: "streamkeep::poller", entity = %self.entity, "poller started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.gate.wait_active() => {}
            }

            let outcome = self.poll_once().await;
            self.log_outcome(&outcome);

            let Some(wait) = self.wait_after(&outcome) else {
                break;
            };
            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.flag.set(false);
        info!(target: "streamkeep::poller", entity = %self.entity, "poller stopped");
    }

    fn log_outcome(&self, outcome: &PollOutcome) {
        let entity = &self.entity;
        match outcome {
            PollOutcome::Recorded { raw } => {
                debug!(target: "streamkeep::poller", %entity, raw = %raw.display(), "capture completed")
            }
            PollOutcome::CaptureFailed { raw, salvaged } => {
                debug!(target: "streamkeep::poller", %entity, raw = %raw.display(), salvaged, "capture failed")
            }
            PollOutcome::Offline => debug!(target: "streamkeep::poller", %entity, "offline"),
            PollOutcome::Absent => {
                let err = CaptureError::RemoteUnavailable(entity.clone());
                info!(target: "streamkeep::poller", %entity, error = %err, "treating entity as offline")
            }
            PollOutcome::Unexpected(status) => {
                let err = CaptureError::UnexpectedStatus {
                    entity: entity.clone(),
                    status: *status,
                };
                warn!(target: "streamkeep::poller", %entity, error = %err, "status request will be retried after the idle interval")
            }
            PollOutcome::Transient(err) => {
                warn!(target: "streamkeep::poller", %entity, error = %err, attempt = self.backoff.attempt(), "status request failed")
            }
            PollOutcome::Fault(err) => {
                warn!(target: "streamkeep::poller", %entity, error = %err, "poll iteration aborted")
            }
            PollOutcome::Cancelled => {}
        }
    }
}
