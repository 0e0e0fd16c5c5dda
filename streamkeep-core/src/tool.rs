//! External capture/transcode tool.
//!
//! Every media operation shells out to ffmpeg with a fixed argument
//! template. [`MediaTool`] is the seam the rest of the crate talks to so
//! tests can substitute an in-process fake.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ToolConfig;
use crate::error::{CaptureError, Result};

/// Bytes of stderr kept for error reports.
const STDERR_TAIL_BYTES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolOperation {
    Capture,
    Compress,
    Merge,
    Thumbnail,
}

impl fmt::Display for ToolOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolOperation::Capture => "capture",
            ToolOperation::Compress => "compress",
            ToolOperation::Merge => "merge",
            ToolOperation::Thumbnail => "thumbnail",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait MediaTool: Send + Sync + 'static {
    /// Stream-copy `source_url` into `output` until the stream ends.
    /// Cancelling `cancel` kills the capture and returns
    /// [`CaptureError::Cancelled`].
    async fn capture(
        &self,
        source_url: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Re-encode `input` into `output` at the configured quality.
    async fn compress(&self, input: &Path, output: &Path) -> Result<()>;

    /// Concatenate the files listed in a concat-demuxer `manifest`.
    async fn concat(&self, manifest: &Path, output: &Path) -> Result<()>;

    /// Extract a single frame of `media` into the image at `output`.
    async fn thumbnail(&self, media: &Path, output: &Path) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct FfmpegTool {
    config: ToolConfig,
}

impl FfmpegTool {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    async fn run(
        &self,
        operation: ToolOperation,
        target: &Path,
        args: Vec<OsString>,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        debug!(
            target: "streamkeep::tool",
            %operation,
            target_path = %target.display(),
            program = %self.config.ffmpeg_path,
            "spawning external tool"
        );

        let child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| CaptureError::ExternalToolFailure {
                operation,
                target: target.to_path_buf(),
                detail: format!("failed to spawn {}: {err}", self.config.ffmpeg_path),
            })?;

        // Dropping the wait future drops the child, which kills it.
        let wait = child.wait_with_output();
        let output = match (timeout, cancel) {
            (_, Some(cancel)) => tokio::select! {
                output = wait => output,
                _ = cancel.cancelled() => {
                    warn!(
                        target: "streamkeep::tool",
                        %operation,
                        target_path = %target.display(),
                        "external tool killed on cancellation"
                    );
                    return Err(CaptureError::Cancelled(format!(
                        "{operation} of {}",
                        target.display()
                    )));
                }
            },
            (Some(limit), None) => tokio::time::timeout(limit, wait).await.map_err(
                |_| CaptureError::ToolTimeout {
                    operation,
                    target: target.to_path_buf(),
                    timeout: limit,
                },
            )?,
            (None, None) => wait.await,
        }
        .map_err(|err| CaptureError::ExternalToolFailure {
            operation,
            target: target.to_path_buf(),
            detail: format!("failed to wait for tool: {err}"),
        })?;

        if output.status.success() {
            return Ok(());
        }

        Err(CaptureError::ExternalToolFailure {
            operation,
            target: target.to_path_buf(),
            detail: failure_detail(output.status, &output.stderr),
        })
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn capture(
        &self,
        source_url: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = capture_args(source_url, output);
        self.run(ToolOperation::Capture, output, args, None, Some(cancel))
            .await
    }

    async fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        let args = compress_args(&self.config, input, output);
        self.run(
            ToolOperation::Compress,
            output,
            args,
            self.config.timeout(),
            None,
        )
        .await
    }

    async fn concat(&self, manifest: &Path, output: &Path) -> Result<()> {
        let args = concat_args(manifest, output);
        self.run(ToolOperation::Merge, output, args, self.config.timeout(), None)
            .await
    }

    async fn thumbnail(&self, media: &Path, output: &Path) -> Result<()> {
        let args = thumbnail_args(media, output);
        self.run(
            ToolOperation::Thumbnail,
            output,
            args,
            self.config.timeout(),
            None,
        )
        .await
    }
}

fn base_args() -> Vec<OsString> {
    ["-nostdin", "-hide_banner", "-loglevel", "error"]
        .into_iter()
        .map(OsString::from)
        .collect()
}

pub fn capture_args(source_url: &str, output: &Path) -> Vec<OsString> {
    let mut args = base_args();
    args.extend(
        ["-i", source_url, "-c:v", "copy", "-c:a", "copy"]
            .into_iter()
            .map(OsString::from),
    );
    args.push(output.as_os_str().to_os_string());
    args
}

pub fn compress_args(config: &ToolConfig, input: &Path, output: &Path) -> Vec<OsString> {
    let mut args = base_args();
    args.push("-y".into());
    args.push("-i".into());
    args.push(input.as_os_str().to_os_string());
    args.extend(
        [
            "-c:v",
            config.video_codec.as_str(),
            "-crf",
            &config.video_crf.to_string(),
            "-c:a",
            config.audio_codec.as_str(),
            "-b:a",
            config.audio_bitrate.as_str(),
        ]
        .into_iter()
        .map(OsString::from),
    );
    args.push(output.as_os_str().to_os_string());
    args
}

/// `-n`: an existing merged artifact is never replaced.
pub fn concat_args(manifest: &Path, output: &Path) -> Vec<OsString> {
    let mut args = base_args();
    args.extend(
        ["-n", "-fflags", "+genpts", "-f", "concat", "-safe", "0", "-i"]
            .into_iter()
            .map(OsString::from),
    );
    args.push(manifest.as_os_str().to_os_string());
    args.push("-c".into());
    args.push("copy".into());
    args.push(output.as_os_str().to_os_string());
    args
}

pub fn thumbnail_args(media: &Path, output: &Path) -> Vec<OsString> {
    let mut args = base_args();
    args.push("-y".into());
    args.push("-i".into());
    args.push(media.as_os_str().to_os_string());
    args.push("-vframes".into());
    args.push("1".into());
    args.push(output.as_os_str().to_os_string());
    args
}

fn failure_detail(status: std::process::ExitStatus, stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    let tail = String::from_utf8_lossy(&stderr[start..]);
    let tail = tail.trim();
    if tail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {tail}")
    }
}
