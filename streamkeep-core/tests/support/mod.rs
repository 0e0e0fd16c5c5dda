#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use streamkeep_core::error::{CaptureError, Result};
use streamkeep_core::status::{StatusClient, StatusReport, media_url};
use streamkeep_core::tool::{MediaTool, ToolOperation};
use streamkeep_core::watchdog::SpaceProbe;
use tokio_util::sync::CancellationToken;

pub const CDN: &str = "https://cdn.test/hls";

pub fn live(stream_name: &str) -> StatusReport {
    StatusReport::Live {
        stream_name: stream_name.to_string(),
        media_url: media_url(CDN, stream_name),
    }
}

pub fn network_error(entity: &str) -> CaptureError {
    CaptureError::TransientNetwork {
        entity: entity.to_string(),
        message: "connection refused".to_string(),
    }
}

/// Replays scripted answers per entity; repeats `Offline` once a script
/// runs dry.
#[derive(Default)]
pub struct ScriptedStatus {
    scripts: Mutex<HashMap<String, VecDeque<Result<StatusReport>>>>,
    calls: AtomicUsize,
}

impl ScriptedStatus {
    pub fn script(&self, entity: &str, answers: Vec<Result<StatusReport>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(entity.to_string(), answers.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusClient for ScriptedStatus {
    async fn fetch(&self, entity: &str) -> Result<StatusReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .unwrap()
            .get_mut(entity)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(StatusReport::Offline))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureMode {
    /// Write some bytes and exit zero.
    #[default]
    Finish,
    /// Write some bytes and exit non-zero.
    FailAfterWriting,
    /// Exit non-zero without writing anything.
    FailEmpty,
    /// Write some bytes and block until cancelled.
    UntilCancelled,
}

/// In-process stand-in for ffmpeg that touches the same files the real
/// tool would.
#[derive(Default)]
pub struct FakeTool {
    pub capture_mode: Mutex<CaptureMode>,
    pub fail_compress: AtomicBool,
    pub fail_concat: AtomicBool,
    calls: Mutex<Vec<(ToolOperation, String, PathBuf)>>,
}

impl FakeTool {
    pub fn set_capture_mode(&self, mode: CaptureMode) {
        *self.capture_mode.lock().unwrap() = mode;
    }

    pub fn calls(&self, operation: ToolOperation) -> Vec<(String, PathBuf)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _, _)| *op == operation)
            .map(|(_, input, output)| (input.clone(), output.clone()))
            .collect()
    }

    fn record(&self, operation: ToolOperation, input: impl Into<String>, output: &Path) {
        self.calls
            .lock()
            .unwrap()
            .push((operation, input.into(), output.to_path_buf()));
    }

    fn failure(operation: ToolOperation, output: &Path) -> CaptureError {
        CaptureError::ExternalToolFailure {
            operation,
            target: output.to_path_buf(),
            detail: "exit status: 1".to_string(),
        }
    }
}

#[async_trait]
impl MediaTool for FakeTool {
    async fn capture(
        &self,
        source_url: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.record(ToolOperation::Capture, source_url, output);
        let mode = *self.capture_mode.lock().unwrap();
        if mode != CaptureMode::FailEmpty {
            tokio::fs::write(output, b"frames").await.unwrap();
        }
        match mode {
            CaptureMode::Finish => Ok(()),
            CaptureMode::FailAfterWriting | CaptureMode::FailEmpty => {
                Err(Self::failure(ToolOperation::Capture, output))
            }
            CaptureMode::UntilCancelled => {
                cancel.cancelled().await;
                Err(CaptureError::Cancelled(output.display().to_string()))
            }
        }
    }

    async fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        self.record(ToolOperation::Compress, input.display().to_string(), output);
        tokio::fs::write(output, b"smaller").await.unwrap();
        if self.fail_compress.load(Ordering::SeqCst) {
            return Err(Self::failure(ToolOperation::Compress, output));
        }
        Ok(())
    }

    async fn concat(&self, manifest: &Path, output: &Path) -> Result<()> {
        let listing = tokio::fs::read_to_string(manifest).await.unwrap();
        self.record(ToolOperation::Merge, listing, output);
        tokio::fs::write(output, b"merged").await.unwrap();
        if self.fail_concat.load(Ordering::SeqCst) {
            return Err(Self::failure(ToolOperation::Merge, output));
        }
        Ok(())
    }

    async fn thumbnail(&self, media: &Path, output: &Path) -> Result<()> {
        self.record(ToolOperation::Thumbnail, media.display().to_string(), output);
        tokio::fs::write(output, b"png").await.unwrap();
        Ok(())
    }
}

pub struct FixedProbe(pub u64);

impl SpaceProbe for FixedProbe {
    fn available_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

/// Create `dir/name` with a chosen modification time.
pub fn seed_file(dir: &Path, name: &str, modified: DateTime<Utc>) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, b"data").unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::from(modified))
        .unwrap();
    path
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
