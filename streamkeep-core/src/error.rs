use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::tool::ToolOperation;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("status request for {entity} failed: {message}")]
    TransientNetwork { entity: String, message: String },

    /// The status endpoint answered 404. Callers treat this as "not live".
    #[error("status endpoint has no record of {0}")]
    RemoteUnavailable(String),

    #[error("status endpoint returned HTTP {status} for {entity}")]
    UnexpectedStatus { entity: String, status: u16 },

    #[error("malformed status payload for {entity}: {message}")]
    MalformedStatus { entity: String, message: String },

    #[error("{operation} failed for {target}: {detail}")]
    ExternalToolFailure {
        operation: ToolOperation,
        target: PathBuf,
        detail: String,
    },

    #[error("{operation} for {target} exceeded {timeout:?}")]
    ToolTimeout {
        operation: ToolOperation,
        target: PathBuf,
        timeout: Duration,
    },

    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "free space on {volume} below threshold ({available:?} < {threshold} bytes)"
    )]
    DiskExhausted {
        volume: PathBuf,
        /// `None` when the volume could not be statted.
        available: Option<u64>,
        threshold: u64,
    },

    #[error("entity already tracked: {0}")]
    EntityExists(String),

    #[error("entity not tracked: {0}")]
    EntityNotFound(String),

    #[error("entity id {0:?} cannot be used as a directory name")]
    InvalidEntityId(String),

    #[error("registry file {path} is invalid: {source}")]
    Registry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("another streamkeep process (pid {pid:?}) holds {lock}")]
    AlreadyRunning { lock: PathBuf, pid: Option<u32> },

    #[error("refusing to overwrite existing artifact {0}")]
    ArtifactExists(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl CaptureError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Disk exhaustion is the only condition allowed to end the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DiskExhausted { .. })
    }

    /// Failures the poller retries with backoff instead of the idle interval.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::MalformedStatus { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
