//! 视觉管理器配置 - 通过JSON文件调整参数
//! Vision manager configuration, loaded from JSON

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::VisionError;
use crate::input::FrameLayout;

/// 人脸姿态阈值 (录入时使用)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseLimits {
    pub max_yaw: f32,   // 偏航角上限(度)
    pub max_pitch: f32, // 俯仰角上限(度)
    pub max_roll: f32,  // 翻滚角上限(度)
    pub min_score: f32, // 最低人脸检测置信度
}

impl Default for PoseLimits {
    fn default() -> Self {
        Self {
            max_yaw: 20.0,
            max_pitch: 20.0,
            max_roll: 20.0,
            min_score: 0.6,
        }
    }
}

/// 视觉管理器参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    // === 图像参数 ===
    pub image_width: u32,  // 共享内存图像宽度
    pub image_height: u32, // 共享内存图像高度

    // === IPC参数 ===
    pub ipc_key_path: PathBuf, // ftok 路径
    pub shm_proj_id: u8,       // 共享内存 proj id
    pub sem_proj_id: u8,       // 信号量 proj id
    pub ingest_poll_ms: u64,   // 取帧等待超时,超时后检查退出标志

    // === 调度参数 ===
    pub history_capacity: usize, // 人体检测历史长度
    pub output_capacity: usize,  // 发布队列长度

    // === 控制面参数 ===
    pub camera_timeout_ms: u64,   // 相机开关流调用超时
    pub match_iou_threshold: f64, // 跟踪目标匹配IOU阈值

    // === 人脸录入参数 ===
    pub enroll_timeout_ms: u64,          // 录入超时
    pub duplicate_threshold: f32,        // 重复人脸匹配阈值
    pub pose: PoseLimits,                // 姿态阈值
    pub face_library_path: Option<PathBuf>, // 人脸库文件
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            image_width: 640,
            image_height: 480,

            ipc_key_path: PathBuf::from("/"),
            shm_proj_id: b'A',
            sem_proj_id: b'B',
            ingest_poll_ms: 100,

            history_capacity: 6,
            output_capacity: 64,

            camera_timeout_ms: 10_000,
            match_iou_threshold: 0.5,

            enroll_timeout_ms: 40_000,
            duplicate_threshold: 0.65,
            pose: PoseLimits::default(),
            face_library_path: None,
        }
    }
}

impl VisionConfig {
    /// 从JSON文件加载配置, 缺省字段使用默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VisionError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| VisionError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| VisionError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 加载配置, 失败时退回默认值
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("⚠️  {}, 使用默认值", e);
                Self::default()
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VisionError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|e| VisionError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, json).map_err(|e| VisionError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn frame_layout(&self) -> FrameLayout {
        FrameLayout::rgb(self.image_width, self.image_height)
    }

    pub fn ingest_poll(&self) -> Duration {
        Duration::from_millis(self.ingest_poll_ms.max(1))
    }

    pub fn camera_timeout(&self) -> Duration {
        Duration::from_millis(self.camera_timeout_ms)
    }

    pub fn enroll_timeout(&self) -> Duration {
        Duration::from_millis(self.enroll_timeout_ms)
    }
}
