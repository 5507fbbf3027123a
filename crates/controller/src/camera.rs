//! Still-image capture for controller snapshots.
//!
//! Capture shells out to the Pi camera stack's still tool, which writes a
//! JPEG to stdout.  It is slow (sensor start-up plus exposure) and only ever
//! runs on the snapshot worker.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::CameraConfig;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera disabled")]
    Disabled,
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("'{command}' produced no image data")]
    Empty { command: String },
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Capture one frame and return it JPEG-encoded.
    async fn capture_encoded(&self) -> Result<Vec<u8>, CaptureError>;
}

pub fn from_config(cfg: &CameraConfig) -> Arc<dyn SnapshotProvider> {
    if cfg.enabled {
        tracing::info!(command = %cfg.command, width = cfg.width, height = cfg.height, "camera ready");
        Arc::new(CommandCamera::new(cfg))
    } else {
        tracing::info!("camera disabled — controller records carry no image");
        Arc::new(DisabledCamera)
    }
}

// ---------------------------------------------------------------------------
// External still-capture command
// ---------------------------------------------------------------------------

pub struct CommandCamera {
    command: String,
    args: Vec<String>,
}

impl CommandCamera {
    pub fn new(cfg: &CameraConfig) -> Self {
        let args = vec![
            "-n".to_string(), // no preview window
            "-t".into(),
            "1".into(),
            "--width".into(),
            cfg.width.to_string(),
            "--height".into(),
            cfg.height.to_string(),
            "-e".into(),
            "jpg".into(),
            "-o".into(),
            "-".into(),
        ];

        Self {
            command: cfg.command.clone(),
            args,
        }
    }
}

#[async_trait]
impl SnapshotProvider for CommandCamera {
    async fn capture_encoded(&self) -> Result<Vec<u8>, CaptureError> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CaptureError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CaptureError::Exit {
                command: self.command.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if output.stdout.is_empty() {
            return Err(CaptureError::Empty {
                command: self.command.clone(),
            });
        }
        Ok(output.stdout)
    }
}

pub struct DisabledCamera;

#[async_trait]
impl SnapshotProvider for DisabledCamera {
    async fn capture_encoded(&self) -> Result<Vec<u8>, CaptureError> {
        Err(CaptureError::Disabled)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
