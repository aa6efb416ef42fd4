//! Out-of-process copy through an independently configured sync tool.
//!
//! Last-resort transfer path: the tool uses its own remote profile and
//! credentials, so it can succeed where the primary client cannot reach
//! the store.

use crate::config::RcloneConfig;
use async_trait::async_trait;
use std::{io, path::Path};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SyncToolError {
    #[error("sync tool exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("cannot run sync tool: {0}")]
    Spawn(#[from] io::Error),
}

#[async_trait]
pub trait ExternalSync: Send + Sync {
    /// Copy `local` into `bucket/dest_dir`, keeping its file name.
    async fn copy(&self, local: &Path, bucket: &str, dest_dir: &str) -> Result<(), SyncToolError>;

    /// The equivalent shell command, for operators to run by hand.
    fn command_line(&self, local: &Path, bucket: &str, dest_dir: &str) -> String;
}

/// `rclone --config=<path> copy <local> <remote>:<bucket>/<dir>`
#[derive(Clone, Debug)]
pub struct Rclone {
    cfg: RcloneConfig,
}

impl Rclone {
    pub fn new(cfg: RcloneConfig) -> Self {
        Self { cfg }
    }

    fn args(&self, local: &Path, bucket: &str, dest_dir: &str) -> Vec<String> {
        vec![
            format!("--config={}", self.cfg.config_path),
            "copy".to_string(),
            local.display().to_string(),
            format!(
                "{}:{}/{}",
                self.cfg.remote_name,
                bucket,
                dest_dir.trim_end_matches('/')
            ),
        ]
    }
}

#[async_trait]
impl ExternalSync for Rclone {
    async fn copy(&self, local: &Path, bucket: &str, dest_dir: &str) -> Result<(), SyncToolError> {
        debug!("{}", self.command_line(local, bucket, dest_dir));
        let output = Command::new(&self.cfg.binary)
            .args(self.args(local, bucket, dest_dir))
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SyncToolError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn command_line(&self, local: &Path, bucket: &str, dest_dir: &str) -> String {
        let mut line = self.cfg.binary.clone();
        for arg in self.args(local, bucket, dest_dir) {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}
