use chrono::format::{Item, StrftimeItems};
use chrono::{TimeZone, Utc};
use streamkeep_core::RecorderConfig;
use streamkeep_core::artifact::{COMPRESSED_TAG, MANIFEST_FILE_NAME, MERGED_TAG};
use streamkeep_core::merge::window::WINDOW_PERIOD_SECS;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{field} is required")]
    MissingEndpoint { field: &'static str },
    #[error("{field} must be an http(s) URL, got {value:?}")]
    InvalidEndpoint { field: &'static str, value: String },
    #[error("timestamp format {format:?} {reason}")]
    InvalidTimestampFormat { format: String, reason: String },
    #[error("container extension {0:?} must be non-empty and alphanumeric")]
    InvalidExtension(String),
    #[error("{field} must be at least 1")]
    ZeroParallelism { field: &'static str },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

pub fn apply_guard_rails(
    config: &RecorderConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    validate_endpoint("STREAM_SITE", &config.status.site_base)?;
    validate_endpoint("CDN_URL", &config.status.cdn_base)?;
    validate_timestamp_format(&config.storage.timestamp_format)?;
    validate_extension(&config.storage.container_extension)?;

    if config.tool.max_parallel_compressions == 0 {
        return Err(ConfigGuardRailError::ZeroParallelism {
            field: "MAX_PARALLEL_COMPRESSIONS",
        });
    }
    if config.merge.max_parallel_jobs == 0 {
        return Err(ConfigGuardRailError::ZeroParallelism {
            field: "MAX_PARALLEL_MERGES",
        });
    }

    if config.merge.min_age_secs < WINDOW_PERIOD_SECS as u64 {
        warnings.push_with_hint(
            "MERGE_MIN_AGE is shorter than one merge window",
            "Fragments still being compressed may be merged early; 3h is the usual value",
        );
    }

    if config.watchdog.min_free_bytes == 0 {
        warnings.push_with_hint(
            "MIN_FREE_SPACE_BYTES is 0; the disk watchdog will never trip",
            "Set a threshold that leaves room for in-flight recordings",
        );
    }

    Ok(warnings)
}

fn validate_endpoint(
    field: &'static str,
    value: &str,
) -> Result<(), ConfigGuardRailError> {
    if value.trim().is_empty() {
        return Err(ConfigGuardRailError::MissingEndpoint { field });
    }
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        _ => Err(ConfigGuardRailError::InvalidEndpoint {
            field,
            value: value.to_string(),
        }),
    }
}

/// The stamp ends up inside file names that are later classified by tag, so
/// it must be a usable strftime pattern whose output is a single path
/// component free of lifecycle tags.
pub fn validate_timestamp_format(
    format: &str,
) -> Result<(), ConfigGuardRailError> {
    let invalid = |reason: &str| ConfigGuardRailError::InvalidTimestampFormat {
        format: format.to_string(),
        reason: reason.to_string(),
    };

    if format.trim().is_empty() {
        return Err(invalid("is empty"));
    }
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(invalid("is not a valid strftime pattern"));
    }

    // Month and day names make the widest stamps, so check a date that has
    // every field populated.
    let sample = Utc
        .with_ymd_and_hms(2024, 12, 31, 23, 59, 59)
        .single()
        .ok_or_else(|| invalid("could not be sampled"))?;
    let rendered = sample.format(format).to_string();

    if rendered.contains('/') || rendered.contains('\\') {
        return Err(invalid("produces a path separator"));
    }
    let manifest_stem = MANIFEST_FILE_NAME.trim_end_matches(".txt");
    if [COMPRESSED_TAG, MERGED_TAG, manifest_stem]
        .iter()
        .any(|tag| rendered.contains(tag))
    {
        return Err(invalid("produces a lifecycle tag"));
    }

    // Recordings and merges are named by their start instant; two of them
    // one second apart must not collide.
    let base = Utc
        .with_ymd_and_hms(2024, 11, 28, 21, 47, 38)
        .single()
        .ok_or_else(|| invalid("could not be sampled"))?;
    let base_rendered = base.format(format).to_string();
    let neighbours = [
        (2023, 11, 28, 21, 47, 38),
        (2024, 10, 28, 21, 47, 38),
        (2024, 11, 27, 21, 47, 38),
        (2024, 11, 28, 20, 47, 38),
        (2024, 11, 28, 21, 46, 38),
        (2024, 11, 28, 21, 47, 37),
    ];
    for (year, month, day, hour, minute, second) in neighbours {
        let other = Utc
            .with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
            .ok_or_else(|| invalid("could not be sampled"))?;
        if other.format(format).to_string() == base_rendered {
            return Err(invalid("does not distinguish instants one second apart"));
        }
    }
    Ok(())
}

fn validate_extension(extension: &str) -> Result<(), ConfigGuardRailError> {
    if extension.is_empty()
        || !extension.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(ConfigGuardRailError::InvalidExtension(
            extension.to_string(),
        ));
    }
    Ok(())
}
