//! Artifact naming and classification.
//!
//! Lifecycle state is carried only by file names inside
//! `{download_dir}/{entity}/`:
//!
//! | kind        | file name                                 |
//! |-------------|-------------------------------------------|
//! | raw         | `{entity}_{stamp}.{ext}`                  |
//! | compressed  | `{entity}_compressed_{stamp}.{ext}`       |
//! | merged      | `MERGED_{stamp}.{ext}`                    |
//! | thumbnail   | `MERGED_{stamp}.{ext}_MERGED.png`         |
//! | manifest    | `toMerge.txt`                             |
//!
//! Every component formats and classifies through this module; nothing else
//! should inspect file names directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{CaptureError, Result};

pub const MANIFEST_FILE_NAME: &str = "toMerge.txt";
pub const COMPRESSED_TAG: &str = "compressed";
pub const MERGED_TAG: &str = "MERGED";
const THUMBNAIL_SUFFIX: &str = "_MERGED.png";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Raw,
    Compressed,
    Merged,
    Thumbnail,
    Manifest,
    /// Anything in an entity directory that does not follow the naming
    /// scheme. Retention treats these like stale raw files.
    Unrecognized,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Compressed => "compressed",
            ArtifactKind::Merged => "merged",
            ArtifactKind::Thumbnail => "thumbnail",
            ArtifactKind::Manifest => "manifest",
            ArtifactKind::Unrecognized => "unrecognized",
        }
    }
}

/// A classified file name. `stamp` is the formatted timestamp portion, absent
/// for the manifest and unrecognized files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactName {
    pub kind: ArtifactKind,
    pub stamp: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    root: PathBuf,
    extension: String,
    timestamp_format: String,
}

impl ArtifactLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        extension: impl Into<String>,
        timestamp_format: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            timestamp_format: timestamp_format.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(
            storage.download_dir.clone(),
            storage.container_extension.clone(),
            storage.timestamp_format.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Format `at` with the configured pattern. The pattern is validated when
    /// configuration loads, so formatting cannot fail here.
    pub fn stamp(&self, at: DateTime<Utc>) -> String {
        at.format(&self.timestamp_format).to_string()
    }

    pub fn entity_dir(&self, entity: &str) -> PathBuf {
        self.root.join(entity)
    }

    pub fn raw_path(&self, entity: &str, stamp: &str) -> PathBuf {
        self.entity_dir(entity)
            .join(format!("{entity}_{stamp}.{}", self.extension))
    }

    pub fn compressed_path(&self, entity: &str, stamp: &str) -> PathBuf {
        self.entity_dir(entity).join(format!(
            "{entity}_{COMPRESSED_TAG}_{stamp}.{}",
            self.extension
        ))
    }

    pub fn merged_path(&self, entity: &str, stamp: &str) -> PathBuf {
        self.entity_dir(entity)
            .join(format!("{MERGED_TAG}_{stamp}.{}", self.extension))
    }

    pub fn manifest_path(&self, entity: &str) -> PathBuf {
        self.entity_dir(entity).join(MANIFEST_FILE_NAME)
    }

    /// The thumbnail sits next to its merged artifact, named after the full
    /// merged file name.
    pub fn thumbnail_path(merged: &Path) -> PathBuf {
        let mut name = merged
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(THUMBNAIL_SUFFIX);
        merged.with_file_name(name)
    }

    /// Compressed counterpart of a raw artifact, or `None` when `raw` is not
    /// a raw artifact of `entity`.
    pub fn compressed_for_raw(&self, entity: &str, raw: &Path) -> Option<PathBuf> {
        let file_name = raw.file_name()?.to_str()?;
        match self.parse(entity, file_name) {
            ArtifactName {
                kind: ArtifactKind::Raw,
                stamp: Some(stamp),
            } => Some(self.compressed_path(entity, &stamp)),
            _ => None,
        }
    }

    pub fn classify(&self, entity: &str, file_name: &str) -> ArtifactKind {
        self.parse(entity, file_name).kind
    }

    pub fn parse(&self, entity: &str, file_name: &str) -> ArtifactName {
        if file_name == MANIFEST_FILE_NAME {
            return ArtifactName {
                kind: ArtifactKind::Manifest,
                stamp: None,
            };
        }

        let media_suffix = format!(".{}", self.extension);
        let merged_prefix = format!("{MERGED_TAG}_");

        if let Some(rest) = file_name.strip_prefix(&merged_prefix) {
            if let Some(stamp) = rest
                .strip_suffix(THUMBNAIL_SUFFIX)
                .and_then(|merged| merged.strip_suffix(&media_suffix))
                .filter(|stamp| !stamp.is_empty())
            {
                return ArtifactName {
                    kind: ArtifactKind::Thumbnail,
                    stamp: Some(stamp.to_string()),
                };
            }
            if let Some(stamp) = rest
                .strip_suffix(&media_suffix)
                .filter(|stamp| !stamp.is_empty())
            {
                return ArtifactName {
                    kind: ArtifactKind::Merged,
                    stamp: Some(stamp.to_string()),
                };
            }
        }

        let compressed_prefix = format!("{entity}_{COMPRESSED_TAG}_");
        if let Some(stamp) = file_name
            .strip_prefix(&compressed_prefix)
            .and_then(|rest| rest.strip_suffix(&media_suffix))
            .filter(|stamp| !stamp.is_empty())
        {
            return ArtifactName {
                kind: ArtifactKind::Compressed,
                stamp: Some(stamp.to_string()),
            };
        }

        let raw_prefix = format!("{entity}_");
        if let Some(stamp) = file_name
            .strip_prefix(&raw_prefix)
            .and_then(|rest| rest.strip_suffix(&media_suffix))
            .filter(|stamp| !stamp.is_empty())
        {
            return ArtifactName {
                kind: ArtifactKind::Raw,
                stamp: Some(stamp.to_string()),
            };
        }

        ArtifactName {
            kind: ArtifactKind::Unrecognized,
            stamp: None,
        }
    }
}

/// A file found in an entity directory.
#[derive(Clone, Debug)]
pub struct ArtifactEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub modified: DateTime<Utc>,
}

impl ArtifactEntry {
    /// Clamped to zero for files modified "in the future".
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.modified).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_aged(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age_at(now) >= threshold
    }
}

/// Remove `path`, treating an already-missing file as success.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CaptureError::filesystem(path, err)),
    }
}

/// Whether `path` exists. Errors other than absence count as present so
/// callers never overwrite something they could not inspect.
pub async fn path_exists(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(_) => true,
        Err(err) => err.kind() != std::io::ErrorKind::NotFound,
    }
}

/// Names of the entity directories under the download root, sorted.
/// A missing root yields an empty list.
pub async fn list_entity_dirs(root: &Path) -> Result<Vec<String>> {
    let mut reader = match fs::read_dir(root).await {
        Ok(reader) => reader,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Vec::new());
        }
        Err(err) => return Err(CaptureError::filesystem(root, err)),
    };

    let mut names = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|err| CaptureError::filesystem(root, err))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|err| CaptureError::filesystem(entry.path(), err))?;
        if !file_type.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Classified files of one entity directory, sorted by name. Entries that
/// vanish between listing and stat are skipped.
pub async fn list_artifacts(
    layout: &ArtifactLayout,
    entity: &str,
) -> Result<Vec<ArtifactEntry>> {
    let dir = layout.entity_dir(entity);
    let mut reader = fs::read_dir(&dir)
        .await
        .map_err(|err| CaptureError::filesystem(&dir, err))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|err| CaptureError::filesystem(&dir, err))?
    {
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "artifact vanished while listing");
                continue;
            }
            Err(err) => return Err(CaptureError::filesystem(&path, err)),
        };
        if !metadata.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let modified = metadata
            .modified()
            .map_err(|err| CaptureError::filesystem(&path, err))?;

        entries.push(ArtifactEntry {
            kind: layout.classify(entity, &name),
            name,
            path,
            modified: DateTime::<Utc>::from(modified),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
