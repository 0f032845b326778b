//! 错误类型定义
//! Error types for lifecycle transitions and control-plane calls

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::face::LibraryError;
use crate::input::IpcError;
use crate::manager::LifecycleState;

/// 跟踪目标设置失败原因
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("neither ReID nor focus tracking is enabled")]
    NoTracker,
    #[error("no body in the detection history overlaps the requested region")]
    NoMatch,
    #[error("no frame has been received yet")]
    NoFrame,
    #[error("{tracker} tracker rejected the target: {reason}")]
    Tracker {
        tracker: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("cannot {action} while {from:?}")]
    InvalidTransition {
        action: &'static str,
        from: LifecycleState,
    },
    #[error("vision manager is not active")]
    NotActive,
    #[error("frame channel: {0}")]
    Ipc(#[from] IpcError),
    #[error("algorithm backend failed: {0:#}")]
    Backend(anyhow::Error),
    #[error("camera stream {action} failed: {reason}")]
    Camera {
        action: &'static str,
        reason: String,
    },
    #[error("camera stream {action} timed out after {timeout:?}")]
    CameraTimeout {
        action: &'static str,
        timeout: Duration,
    },
    #[error(transparent)]
    Tracking(#[from] TrackingError),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("face library: {0}")]
    Library(#[from] LibraryError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn { name: String, source: io::Error },
    #[error("config {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
}
