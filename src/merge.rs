//! External media merge tool
//!
//! Assembly shells out to ffmpeg to concatenate staged segments into the
//! final audio file. The tool sits behind the [`MediaMerger`] trait so
//! the pipeline can run against a test double and so a missing binary
//! degrades to a clear assembly error instead of a panic at spawn time.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Merges staged segment files into one output file
#[async_trait]
pub trait MediaMerger: Send + Sync {
    /// Merge `inputs`, in order, into `output`
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;

    /// Tool name for logs
    fn name(&self) -> &str;
}

/// ffmpeg-backed merger using the concat demuxer
pub struct FfmpegMerger {
    binary_path: PathBuf,
    timeout: Duration,
}

impl FfmpegMerger {
    /// Use the binary at an explicit path
    pub fn new(binary_path: PathBuf, timeout: Duration) -> Self {
        Self {
            binary_path,
            timeout,
        }
    }

    /// Discover ffmpeg on PATH; None when it is not installed
    pub fn discover(timeout: Duration) -> Option<Self> {
        let binary_path = which::which("ffmpeg").ok()?;
        tracing::info!(path = %binary_path.display(), "Found ffmpeg");
        Some(Self::new(binary_path, timeout))
    }

    /// Path to the driven binary
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

#[async_trait]
impl MediaMerger for FfmpegMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::AssemblyFailed(
                "no input segments to merge".to_string(),
            ));
        }

        let list_path = concat_list_path(output);
        tokio::fs::write(&list_path, concat_list(inputs)).await?;

        tracing::debug!(
            inputs = inputs.len(),
            output = %output.display(),
            "Running ffmpeg concat"
        );

        let run = Command::new(&self.binary_path)
            .arg("-y")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(&list_path)
            .arg("-c")
            .arg("copy")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let result = tokio::time::timeout(self.timeout, run).await;
        let _ = tokio::fs::remove_file(&list_path).await;

        let command_output = match result {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::AssemblyFailed(format!(
                    "ffmpeg did not finish within {:?}",
                    self.timeout
                )));
            }
        };

        if !command_output.status.success() {
            let stderr = String::from_utf8_lossy(&command_output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::AssemblyFailed(format!(
                "ffmpeg exited with {}: {tail}",
                command_output.status
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

/// Stand-in used when no merge tool could be found.
///
/// Fails every merge with a clear message; the job keeps its staged
/// segments so installing the tool and retrying resumes at assembly.
pub struct UnavailableMerger;

#[async_trait]
impl MediaMerger for UnavailableMerger {
    async fn merge(&self, _inputs: &[PathBuf], _output: &Path) -> Result<()> {
        Err(Error::AssemblyFailed(
            "ffmpeg is not installed and no explicit tool path is configured".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

fn concat_list_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".concat");
    PathBuf::from(name)
}

/// Render the concat demuxer's input list; single quotes in paths are
/// closed, escaped and reopened per its quoting rules
fn concat_list(inputs: &[PathBuf]) -> String {
    let mut list = String::new();
    for input in inputs {
        let escaped = input.display().to_string().replace('\'', "'\\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }
    list
}
