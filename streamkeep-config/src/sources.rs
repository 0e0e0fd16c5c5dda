use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::util::{non_empty, parse_bool, parse_duration};

/// Raw configuration as defined in a TOML file.
///
/// Every field is optional; anything left out falls back to the environment
/// and then to the core defaults.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub status: FileStatusConfig,
    #[serde(default)]
    pub poller: FilePollerConfig,
    #[serde(default)]
    pub merge: FileMergeConfig,
    #[serde(default)]
    pub retention: FileRetentionConfig,
    #[serde(default)]
    pub watchdog: FileWatchdogConfig,
    #[serde(default)]
    pub tool: FileToolConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_active: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_extension: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStatusConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdn_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePollerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_failure_pause_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_max_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileMergeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel_jobs: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRetentionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWatchdogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_free_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileToolConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_crf: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel_compressions: Option<usize>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub registry_path: Option<PathBuf>,
    pub timestamp_format: Option<String>,
    pub container_extension: Option<String>,
    pub site_base: Option<String>,
    pub cdn_base: Option<String>,
    pub user_agent: Option<String>,
    pub merge_min_age: Option<Duration>,
    pub retention_stale_after: Option<Duration>,
    pub min_free_bytes: Option<u64>,
    pub ffmpeg_path: Option<String>,
    pub tool_timeout: Option<Duration>,
    pub max_parallel_compressions: Option<usize>,
    pub max_parallel_merges: Option<usize>,
    pub start_active: Option<bool>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unparseable numbers and
    /// durations are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| non_empty(lookup(name));

        Self {
            config_path: var("STREAMKEEP_CONFIG").map(PathBuf::from),
            download_dir: var("DOWNLOAD_DIR").map(PathBuf::from),
            registry_path: var("REGISTRY_PATH").map(PathBuf::from),
            timestamp_format: var("DATE_TIME_FORMAT"),
            container_extension: var("CONTAINER_EXTENSION"),
            site_base: var("STREAM_SITE"),
            cdn_base: var("CDN_URL"),
            user_agent: var("STATUS_USER_AGENT"),
            merge_min_age: var("MERGE_MIN_AGE")
                .and_then(|raw| parse_duration(&raw)),
            retention_stale_after: var("RETENTION_STALE_AFTER")
                .and_then(|raw| parse_duration(&raw)),
            min_free_bytes: var("MIN_FREE_SPACE_BYTES")
                .and_then(|s| s.parse().ok()),
            ffmpeg_path: var("FFMPEG_PATH"),
            tool_timeout: var("TOOL_TIMEOUT")
                .and_then(|raw| parse_duration(&raw)),
            max_parallel_compressions: var("MAX_PARALLEL_COMPRESSIONS")
                .and_then(|s| s.parse().ok()),
            max_parallel_merges: var("MAX_PARALLEL_MERGES")
                .and_then(|s| s.parse().ok()),
            start_active: var("STREAMKEEP_START_ACTIVE")
                .and_then(|raw| parse_bool(&raw)),
        }
    }
}
