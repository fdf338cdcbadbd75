//! Dependency installation for extracted packages.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::PackageError;

/// Dependency manifest looked for at the package root.
pub const DEPENDENCY_MANIFEST: &str = "requirements.txt";

/// Runs the host package manager for packages that ship a manifest.
#[derive(Debug, Clone)]
pub struct DependencyInstaller {
    command: Vec<String>,
}

impl DependencyInstaller {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Install dependencies for the package at `dir`.
    ///
    /// No manifest means nothing to do. A non-zero exit fails the install.
    pub async fn install(&self, dir: &Path) -> Result<(), PackageError> {
        if !dir.join(DEPENDENCY_MANIFEST).is_file() {
            return Ok(());
        }

        let Some((program, args)) = self.command.split_first() else {
            return Err(PackageError::DependencyInstallFailed {
                path: dir.to_path_buf(),
                reason: "no install command configured".to_string(),
            });
        };

        tracing::info!(dir = %dir.display(), program = %program, "Installing package dependencies");

        let output = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PackageError::DependencyInstallFailed {
                path: dir.to_path_buf(),
                reason: format!("failed to spawn {program}: {e}"),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        Err(PackageError::DependencyInstallFailed {
            path: dir.to_path_buf(),
            reason: format!(
                "{program} exited with {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                tail.join(" | ")
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn sh(script: &str) -> DependencyInstaller {
        DependencyInstaller::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn no_manifest_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        sh("exit 1").install(dir.path()).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_package_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DEPENDENCY_MANIFEST), "requests\n").unwrap();

        sh("touch installed.flag").install(dir.path()).await.unwrap();
        assert!(dir.path().join("installed.flag").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DEPENDENCY_MANIFEST), "requests\n").unwrap();

        let err = sh("echo 'no such package' >&2; exit 3")
            .install(dir.path())
            .await
            .unwrap_err();
        match err {
            PackageError::DependencyInstallFailed { reason, .. } => {
                assert!(reason.contains("exited with 3"), "{reason}");
                assert!(reason.contains("no such package"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DEPENDENCY_MANIFEST), "x\n").unwrap();

        let installer = DependencyInstaller::new(vec!["fleet-no-such-binary-xyz".into()]);
        let err = installer.install(dir.path()).await.unwrap_err();
        assert!(matches!(err, PackageError::DependencyInstallFailed { .. }));
    }
}
