use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime knobs consumed read-only by every core task.
///
/// All sections carry defaults so a deployment only has to supply the two
/// remote endpoints. Built once at startup by `streamkeep-config` and shared
/// behind an `Arc`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Where recordings live and how their names are stamped.
    pub storage: StorageConfig,
    /// Remote status endpoint and CDN used to derive media URLs.
    pub status: StatusConfig,
    /// Per-entity polling cadence and transport backoff.
    pub poller: PollerConfig,
    /// Merge window behaviour.
    pub merge: MergeConfig,
    /// On-demand retention sweep thresholds.
    pub retention: RetentionConfig,
    /// Free-space watchdog.
    pub watchdog: WatchdogConfig,
    /// External capture/transcode tool invocation.
    pub tool: ToolConfig,
    /// Whether polling and merging start enabled.
    pub start_active: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            status: StatusConfig::default(),
            poller: PollerConfig::default(),
            merge: MergeConfig::default(),
            retention: RetentionConfig::default(),
            watchdog: WatchdogConfig::default(),
            tool: ToolConfig::default(),
            start_active: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub download_dir: PathBuf,
    /// JSON registry of tracked entities.
    pub registry_path: PathBuf,
    /// chrono strftime pattern used for every artifact timestamp.
    pub timestamp_format: String,
    pub container_extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            registry_path: PathBuf::from("./streamers.json"),
            timestamp_format: "%Y-%m-%d_%H-%M-%S".to_string(),
            container_extension: "mkv".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// `GET {site_base}/{entity}` returns the availability document.
    pub site_base: String,
    /// Media playlists live at `{cdn_base}/{stream}/master/{stream}.m3u8`.
    pub cdn_base: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

impl StatusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            site_base: String::new(),
            cdn_base: String::new(),
            user_agent: "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:75.0) \
                         Gecko/20100101 Firefox/75.0"
                .to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Pause after an offline, absent, or unexpected answer.
    pub idle_interval_secs: u64,
    /// Pause after the capture tool exits non-zero.
    pub capture_failure_pause_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl PollerConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn capture_failure_pause(&self) -> Duration {
        Duration::from_secs(self.capture_failure_pause_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 60,
            capture_failure_pause_secs: 10,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Compressed artifacts younger than this stay out of the manifest.
    pub min_age_secs: u64,
    pub max_parallel_jobs: usize,
}

impl MergeConfig {
    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            min_age_secs: 3 * 60 * 60,
            max_parallel_jobs: 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Untagged files older than this are treated as orphans.
    pub stale_after_secs: u64,
}

impl RetentionConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub min_free_bytes: u64,
    pub interval_ms: u64,
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: 10_000_000_000,
            interval_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub ffmpeg_path: String,
    pub video_codec: String,
    pub video_crf: u8,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Upper bound for compress, merge, and thumbnail runs. Zero disables it.
    /// Captures are never bounded; they last as long as the stream.
    pub timeout_secs: u64,
    pub max_parallel_compressions: usize,
}

impl ToolConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            video_codec: "libx264".to_string(),
            video_crf: 35,
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            timeout_secs: 12 * 60 * 60,
            max_parallel_compressions: 2,
        }
    }
}
