use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::{debug, info};

use super::TrackedEntity;
use crate::error::{CaptureError, Result};

/// On-disk shape of the registry file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub streamers: Vec<StreamerRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerRecord {
    pub username: String,
    #[serde(default)]
    pub running: bool,
}

impl From<&TrackedEntity> for StreamerRecord {
    fn from(entity: &TrackedEntity) -> Self {
        Self {
            username: entity.id.clone(),
            running: entity.is_running,
        }
    }
}

/// JSON file backing the entity registry.
#[derive(Clone, Debug)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing file is an empty registry.
    pub async fn load(&self) -> Result<RegistryDocument> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    path = %self.path.display(),
                    "registry file not found; starting with no entities"
                );
                return Ok(RegistryDocument::default());
            }
            Err(err) => return Err(CaptureError::filesystem(&self.path, err)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(RegistryDocument::default());
        }

        serde_json::from_slice(&bytes).map_err(|source| CaptureError::Registry {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the file with `entities`, atomically.
    pub async fn save(&self, entities: &[TrackedEntity]) -> Result<()> {
        let document = RegistryDocument {
            streamers: entities.iter().map(StreamerRecord::from).collect(),
        };
        let encoded = encode_document(&document).map_err(|source| {
            CaptureError::Registry {
                path: self.path.clone(),
                source,
            }
        })?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &encoded))
            .await
            .map_err(|err| {
                CaptureError::filesystem(&self.path, std::io::Error::other(err))
            })??;

        debug!(
            path = %self.path.display(),
            entities = entities.len(),
            "registry saved"
        );
        Ok(())
    }
}

fn encode_document(document: &RegistryDocument) -> serde_json::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buffer, formatter);
    document.serialize(&mut serializer)?;
    Ok(buffer)
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .map_err(|err| CaptureError::filesystem(&dir, err))?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|err| CaptureError::filesystem(&dir, err))?;
    temp.write_all(contents)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|err| CaptureError::filesystem(temp.path(), err))?;
    temp.persist(path)
        .map_err(|err| CaptureError::filesystem(path, err.error))?;
    Ok(())
}
