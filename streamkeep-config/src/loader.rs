use std::{
    fs,
    path::{Path, PathBuf},
};

use streamkeep_core::RecorderConfig;
use streamkeep_core::config::{
    MergeConfig, PollerConfig, RetentionConfig, StatusConfig, StorageConfig,
    ToolConfig, WatchdogConfig,
};
use thiserror::Error;

use crate::sources::{EnvConfig, FileConfig};
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};

pub const DEFAULT_CONFIG_LOCATIONS: &[&str] =
    &["streamkeep.toml", "config/streamkeep.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Read `.env` into the process environment, then resolve against the
    /// real environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };
        if env_file_loaded {
            tracing::debug!(target: "streamkeep::config", "loaded .env file");
        }

        self.load_with_env(EnvConfig::gather())
    }

    /// Resolve against an explicit environment snapshot without touching the
    /// process environment.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, source) = self.load_file_config(&env)?;
        let (config, warnings) =
            compose_config(file_config, env, source.is_some())?;
        Ok(ConfigLoad {
            config,
            warnings,
            source,
        })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = if let Some(explicit) = &self.options.config_path
        {
            (explicit.clone(), true)
        } else if let Some(from_env) = &env.config_path {
            (from_env.clone(), true)
        } else {
            match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(found) => (found, false),
                None => return Ok((None, None)),
            }
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Layer environment over file over defaults, then apply guard rails.
fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_present: bool,
) -> Result<(RecorderConfig, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if !config_present {
        warnings.push_with_hint(
            "No streamkeep.toml detected; falling back to environment variables",
            "Pass --config or set STREAMKEEP_CONFIG to use a configuration file",
        );
    }

    let FileConfig {
        storage: file_storage,
        status: file_status,
        poller: file_poller,
        merge: file_merge,
        retention: file_retention,
        watchdog: file_watchdog,
        tool: file_tool,
        start_active: file_start_active,
    } = file_config.unwrap_or_default();
    let defaults = RecorderConfig::default();

    let storage = StorageConfig {
        download_dir: env
            .download_dir
            .or(file_storage.download_dir)
            .unwrap_or(defaults.storage.download_dir),
        registry_path: env
            .registry_path
            .or(file_storage.registry_path)
            .unwrap_or(defaults.storage.registry_path),
        timestamp_format: env
            .timestamp_format
            .or(file_storage.timestamp_format)
            .unwrap_or(defaults.storage.timestamp_format),
        container_extension: env
            .container_extension
            .or(file_storage.container_extension)
            .unwrap_or(defaults.storage.container_extension),
    };

    let status = StatusConfig {
        site_base: env
            .site_base
            .or(file_status.site_base)
            .unwrap_or(defaults.status.site_base),
        cdn_base: env
            .cdn_base
            .or(file_status.cdn_base)
            .unwrap_or(defaults.status.cdn_base),
        user_agent: env
            .user_agent
            .or(file_status.user_agent)
            .unwrap_or(defaults.status.user_agent),
        request_timeout_secs: file_status
            .request_timeout_secs
            .unwrap_or(defaults.status.request_timeout_secs),
    };

    let poller = PollerConfig {
        idle_interval_secs: file_poller
            .idle_interval_secs
            .unwrap_or(defaults.poller.idle_interval_secs),
        capture_failure_pause_secs: file_poller
            .capture_failure_pause_secs
            .unwrap_or(defaults.poller.capture_failure_pause_secs),
        backoff_base_ms: file_poller
            .backoff_base_ms
            .unwrap_or(defaults.poller.backoff_base_ms),
        backoff_max_ms: file_poller
            .backoff_max_ms
            .unwrap_or(defaults.poller.backoff_max_ms),
    };

    let merge = MergeConfig {
        min_age_secs: env
            .merge_min_age
            .map(|age| age.as_secs())
            .or(file_merge.min_age_secs)
            .unwrap_or(defaults.merge.min_age_secs),
        max_parallel_jobs: env
            .max_parallel_merges
            .or(file_merge.max_parallel_jobs)
            .unwrap_or(defaults.merge.max_parallel_jobs),
    };

    let retention = RetentionConfig {
        stale_after_secs: env
            .retention_stale_after
            .map(|age| age.as_secs())
            .or(file_retention.stale_after_secs)
            .unwrap_or(defaults.retention.stale_after_secs),
    };

    let watchdog = WatchdogConfig {
        min_free_bytes: env
            .min_free_bytes
            .or(file_watchdog.min_free_bytes)
            .unwrap_or(defaults.watchdog.min_free_bytes),
        interval_ms: file_watchdog
            .interval_ms
            .unwrap_or(defaults.watchdog.interval_ms),
    };

    let tool = ToolConfig {
        ffmpeg_path: env
            .ffmpeg_path
            .or(file_tool.ffmpeg_path)
            .unwrap_or(defaults.tool.ffmpeg_path),
        video_codec: file_tool
            .video_codec
            .unwrap_or(defaults.tool.video_codec),
        video_crf: file_tool.video_crf.unwrap_or(defaults.tool.video_crf),
        audio_codec: file_tool
            .audio_codec
            .unwrap_or(defaults.tool.audio_codec),
        audio_bitrate: file_tool
            .audio_bitrate
            .unwrap_or(defaults.tool.audio_bitrate),
        timeout_secs: env
            .tool_timeout
            .map(|timeout| timeout.as_secs())
            .or(file_tool.timeout_secs)
            .unwrap_or(defaults.tool.timeout_secs),
        max_parallel_compressions: env
            .max_parallel_compressions
            .or(file_tool.max_parallel_compressions)
            .unwrap_or(defaults.tool.max_parallel_compressions),
    };

    let config = RecorderConfig {
        storage,
        status,
        poller,
        merge,
        retention,
        watchdog,
        tool,
        start_active: env
            .start_active
            .or(file_start_active)
            .unwrap_or(defaults.start_active),
    };

    let guard_warnings = validation::apply_guard_rails(&config)?;
    warnings.extend(guard_warnings);

    Ok((config, warnings))
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: RecorderConfig,
    pub warnings: ConfigWarnings,
    /// The TOML file that contributed values, if any.
    pub source: Option<PathBuf>,
}
