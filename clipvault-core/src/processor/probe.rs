use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::error::{ProcessorError, ProcessorResult};
use crate::config::ProcessorSection;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

/// Wraps the external probing and frame-extraction tools. Every invocation
/// carries an explicit timeout; a hung tool surfaces as a failure for that
/// task, never as a stalled pipeline.
pub struct MediaProbe {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
    thumbnail_width: u32,
    frame_offset_s: f64,
    tool_timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl MediaProbe {
    pub fn new(config: &ProcessorSection, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            ffprobe: PathBuf::from(&config.ffprobe),
            ffmpeg: PathBuf::from(&config.ffmpeg),
            thumbnail_width: config.thumbnail_width,
            frame_offset_s: config.frame_offset_s,
            tool_timeout: config.subprocess_timeout(),
            executor,
        }
    }

    /// Returns the media duration in seconds.
    pub async fn duration(&self, file: &Path) -> ProcessorResult<f64> {
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("csv=p=0")
            .arg(file);
        let output = self.invoke(&mut command).await?;
        if !output.status.success() {
            return Err(ProcessorError::Probe {
                path: file.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| ProcessorError::Probe {
                path: file.to_path_buf(),
                reason: format!("no duration in output: {:?}", stdout.trim()),
            })?;
        if !(value > 0.0) {
            return Err(ProcessorError::Probe {
                path: file.to_path_buf(),
                reason: format!("non-positive duration {value}"),
            });
        }
        Ok(value)
    }

    /// Extracts a single scaled frame into `output`.
    pub async fn extract_thumbnail(&self, file: &Path, output: &Path) -> ProcessorResult<()> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-ss")
            .arg(format!("{}", self.frame_offset_s))
            .arg("-i")
            .arg(file)
            .arg("-vf")
            .arg(format!("scale={}:-1", self.thumbnail_width))
            .arg("-frames:v")
            .arg("1")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg(output);
        let result = self.invoke(&mut command).await?;
        if !result.status.success() {
            return Err(ProcessorError::Extract {
                path: file.to_path_buf(),
                reason: String::from_utf8_lossy(&result.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn invoke(&self, command: &mut Command) -> ProcessorResult<std::process::Output> {
        match timeout(self.tool_timeout, self.executor.run(command)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(ProcessorError::Io {
                source,
                path: PathBuf::new(),
            }),
            Err(_) => Err(ProcessorError::ToolTimeout(self.tool_timeout)),
        }
    }
}
