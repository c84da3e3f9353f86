use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ArchiveError, RemoteArchive};

/// Flags shared by every copy.
const COPY_FLAGS: &[&str] = &["--transfers=20", "--drive-chunk-size=256M"];

/// Remote archive backed by `rclone copy`.
///
/// rclone exits non-zero when any file of a batch fails, so a zero exit
/// status means the whole folder made it.
#[derive(Debug, Clone)]
pub struct Rclone {
    program: String,
}

impl Rclone {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn copy_args(local: &Path, remote: &str, include: &[&str]) -> Vec<String> {
        let mut args = vec![
            "copy".to_string(),
            local.to_string_lossy().to_string(),
            remote.to_string(),
        ];
        args.extend(COPY_FLAGS.iter().map(|f| (*f).to_string()));
        if include.is_empty() {
            args.push("--exclude=.DS_Store".to_string());
        } else {
            for pattern in include {
                args.push("--include".to_string());
                args.push((*pattern).to_string());
            }
        }
        args
    }

    async fn run(&self, args: &[String]) -> Result<String, ArchiveError> {
        debug!(program = %self.program, ?args, "Running rclone");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ArchiveError::Spawn {
                program: self.program.clone(),
                source,
            })?
            .wait_with_output()
            .await
            .map_err(|source| ArchiveError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ArchiveError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl RemoteArchive for Rclone {
    async fn copy(
        &self,
        local: &Path,
        remote: &str,
        include: &[&str],
    ) -> Result<(), ArchiveError> {
        self.run(&Self::copy_args(local, remote, include)).await?;
        Ok(())
    }

    async fn list(&self, remote: &str) -> Result<Vec<String>, ArchiveError> {
        let stdout = self
            .run(&["lsf".to_string(), remote.to_string()])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
