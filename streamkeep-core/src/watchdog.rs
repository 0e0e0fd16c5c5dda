//! Free-space watchdog.
//!
//! Samples the storage volume on a fixed interval. The first sample below
//! the threshold, or any sample that cannot be taken, ends [`DiskSpaceWatchdog::run`]
//! with [`CaptureError::DiskExhausted`]; the binary turns that into an
//! immediate process exit.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::config::WatchdogConfig;
use crate::error::{CaptureError, Result};

/// Source of free-space readings.
pub trait SpaceProbe: Send + Sync + 'static {
    /// Bytes available to unprivileged writers on the volume holding `path`.
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Fs2SpaceProbe;

impl SpaceProbe for Fs2SpaceProbe {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }
}

pub struct DiskSpaceWatchdog {
    probe: Arc<dyn SpaceProbe>,
    volume: PathBuf,
    threshold: u64,
    interval: Duration,
}

impl fmt::Debug for DiskSpaceWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskSpaceWatchdog")
            .field("volume", &self.volume)
            .field("threshold", &self.threshold)
            .field("interval", &self.interval)
            .finish()
    }
}

impl DiskSpaceWatchdog {
    pub fn new(
        probe: Arc<dyn SpaceProbe>,
        volume: impl Into<PathBuf>,
        threshold: u64,
        interval: Duration,
    ) -> Self {
        Self {
            probe,
            volume: volume.into(),
            threshold,
            interval,
        }
    }

    pub fn from_config(
        probe: Arc<dyn SpaceProbe>,
        volume: impl Into<PathBuf>,
        config: &WatchdogConfig,
    ) -> Self {
        Self::new(probe, volume, config.min_free_bytes, config.interval())
    }

    pub fn volume(&self) -> &Path {
        &self.volume
    }

    /// One sample. Returns the free bytes when at or above the threshold.
    pub fn check_once(&self) -> Result<u64> {
        match self.probe.available_bytes(&self.volume) {
            Ok(available) if available >= self.threshold => Ok(available),
            Ok(available) => Err(CaptureError::DiskExhausted {
                volume: self.volume.clone(),
                available: Some(available),
                threshold: self.threshold,
            }),
            Err(err) => {
                error!(
                    target: "streamkeep::watchdog",
                    volume = %self.volume.display(),
                    error = %err,
                    "cannot stat storage volume"
                );
                Err(CaptureError::DiskExhausted {
                    volume: self.volume.clone(),
                    available: None,
                    threshold: self.threshold,
                })
            }
        }
    }

    /// Sample until cancelled (`Ok`) or until space runs out (`Err`).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            target: "streamkeep::watchdog",
            volume = %self.volume.display(),
            threshold = self.threshold,
            interval = ?self.interval,
            "disk watchdog started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            match self.check_once() {
                Ok(available) => {
                    trace!(target: "streamkeep::watchdog", available, "free space ok")
                }
                Err(err) => {
                    error!(target: "streamkeep::watchdog", error = %err, "free space exhausted");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GB: u64 = 1_000_000_000;

    /// Replays readings; repeats the last one when exhausted.
    struct ScriptedProbe {
        readings: Mutex<VecDeque<std::io::Result<u64>>>,
        samples: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<std::io::Result<u64>>) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings.into()),
                samples: Default::default(),
            })
        }
    }

    impl SpaceProbe for ScriptedProbe {
        fn available_bytes(&self, _path: &Path) -> std::io::Result<u64> {
            self.samples
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut readings = self.readings.lock().unwrap();
            match readings.len() {
                0 => Ok(u64::MAX),
                1 => match readings.front().unwrap() {
                    Ok(value) => Ok(*value),
                    Err(err) => Err(std::io::Error::new(err.kind(), err.to_string())),
                },
                _ => readings.pop_front().unwrap(),
            }
        }
    }

    fn watchdog(probe: Arc<ScriptedProbe>) -> DiskSpaceWatchdog {
        DiskSpaceWatchdog::new(probe, "/data", 10 * GB, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn fires_on_the_first_low_sample() {
        let probe = ScriptedProbe::new(vec![Ok(12 * GB), Ok(12 * GB), Ok(9 * GB)]);
        let started = tokio::time::Instant::now();

        let err = watchdog(Arc::clone(&probe))
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CaptureError::DiskExhausted { available: Some(a), .. } if a == 9 * GB
        ));
        assert!(err.is_fatal());
        assert_eq!(probe.samples.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stays_quiet_while_space_is_sufficient() {
        let probe = ScriptedProbe::new(vec![Ok(10 * GB)]);
        let cancel = CancellationToken::new();
        let dog = watchdog(Arc::clone(&probe));
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dog.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        handle.await.expect("join").expect("cancelled cleanly");
        assert!(probe.samples.load(std::sync::atomic::Ordering::SeqCst) >= 30);
    }

    #[test]
    fn stat_failure_fails_closed() {
        let probe = ScriptedProbe::new(vec![Err(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        ))]);
        let err = watchdog(probe).check_once().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::DiskExhausted {
                available: None,
                ..
            }
        ));
    }

    #[test]
    fn real_probe_reads_the_temp_volume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dog = DiskSpaceWatchdog::new(Arc::new(Fs2SpaceProbe), dir.path(), 0, Duration::from_secs(1));
        dog.check_once().expect("zero threshold always passes");
    }
}
