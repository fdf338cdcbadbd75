//! Screenshot capture for reported steps.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::AgentConfig;
use crate::error::CaptureError;

/// Placeholder replaced by the target file in a capture command.
pub const PATH_PLACEHOLDER: &str = "{path}";

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(15);

/// Captures the screen into a PNG file.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self, target: &Path) -> Result<(), CaptureError>;
}

/// Platform without a capture facility.
#[derive(Debug, Default)]
pub struct NoCapture;

#[async_trait]
impl ScreenCapture for NoCapture {
    async fn capture(&self, _target: &Path) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported)
    }
}

/// Runs an external tool such as `scrot {path}` or `screencapture -x {path}`.
#[derive(Debug)]
pub struct CommandCapture {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: CAPTURE_TIMEOUT,
        }
    }
}

#[async_trait]
impl ScreenCapture for CommandCapture {
    async fn capture(&self, target: &Path) -> Result<(), CaptureError> {
        let target_str = target.to_string_lossy();
        let mut argv = self
            .command
            .iter()
            .map(|arg| arg.replace(PATH_PLACEHOLDER, &target_str));
        let Some(program) = argv.next() else {
            return Err(CaptureError::Unsupported);
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&program)
                .args(argv)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CaptureError::Failed(format!("{program} timed out after {:?}", self.timeout)))??;

        if !output.status.success() {
            return Err(CaptureError::Failed(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !target.exists() {
            return Err(CaptureError::Failed(format!("{program} produced no file")));
        }
        Ok(())
    }
}

/// Capture backend for the configuration.
pub fn from_config(config: &AgentConfig) -> Arc<dyn ScreenCapture> {
    match &config.screenshot_command {
        Some(command) if !command.is_empty() => Arc::new(CommandCapture::new(command.clone())),
        _ => Arc::new(NoCapture),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn no_capture_is_unsupported() {
        let err = NoCapture.capture(Path::new("/tmp/x.png")).await.unwrap_err();
        assert!(matches!(err, CaptureError::Unsupported));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_substitutes_path() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("shots/step.png");
        let capture = CommandCapture::new(vec!["touch".into(), PATH_PLACEHOLDER.into()]);

        capture.capture(&target).await.unwrap();
        assert!(target.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_reported() {
        let dir = TempDir::new().unwrap();
        let capture = CommandCapture::new(vec!["false".into()]);
        let err = capture
            .capture(&dir.path().join("x.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Failed(_)));
    }

    #[tokio::test]
    async fn config_without_command_has_no_capture() {
        let capture = from_config(&AgentConfig::default());
        let err = capture.capture(Path::new("/tmp/x.png")).await.unwrap_err();
        assert!(matches!(err, CaptureError::Unsupported));
    }
}
