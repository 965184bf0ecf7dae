//! External transform invocation
//!
//! The pipeline never shells out directly; it goes through a
//! [`TransformRunner`], which lets tests substitute a fake that fabricates
//! output files instead of running ImageMagick.

use crate::error::ExitInfo;
use crate::{Error, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Runs one named external transform to completion.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    /// Run `program` with `args`. Returns once the process has exited;
    /// anything other than a successful exit is a [`Error::TransformFailure`].
    async fn run_transform(&self, program: &str, args: &[String]) -> Result<()>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    working_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative program paths (such as `./aspect`) against `dir`.
    pub fn with_working_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl TransformRunner for ProcessRunner {
    async fn run_transform(&self, program: &str, args: &[String]) -> Result<()> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(target: "boardshot::transform", "{} {}", program, args.join(" "));

        let output = cmd.output().await.map_err(|e| {
            warn!(target: "boardshot::transform", "could not start {}: {}", program, e);
            Error::TransformFailure {
                transform: program.to_string(),
                exit: ExitInfo::Spawn(e.to_string()),
            }
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit = match output.status.code() {
            Some(code) => ExitInfo::Code { code, stderr },
            None => ExitInfo::Terminated { stderr },
        };
        Err(Error::TransformFailure {
            transform: program.to_string(),
            exit,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_exit_is_ok() {
        let runner = ProcessRunner::new();
        runner.run_transform("true", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_carries_code_and_stderr() {
        let runner = ProcessRunner::new();
        let args = vec!["-c".to_string(), "echo broken >&2; exit 3".to_string()];
        let err = runner.run_transform("sh", &args).await.unwrap_err();
        match err {
            Error::TransformFailure { transform, exit } => {
                assert_eq!(transform, "sh");
                assert_eq!(exit, ExitInfo::Code { code: 3, stderr: "broken".to_string() });
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let runner = ProcessRunner::new();
        let err = runner
            .run_transform("definitely-not-an-installed-transform", &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TransformFailure { exit: ExitInfo::Spawn(_), .. }
        ));
    }

    #[tokio::test]
    async fn dropped_transform_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("written");
        let runner = ProcessRunner::with_working_dir(dir.path());
        let args = vec!["-c".to_string(), "sleep 0.3; echo late > written".to_string()];

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            runner.run_transform("sh", &args),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert!(!marker.exists());
    }
}
