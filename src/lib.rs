// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

pub mod algorithms; // 算法接口
pub mod config; // 管理器配置参数
pub mod detection; // 检测结果类型
pub mod error; // 错误类型
pub mod face; // 人脸库与录入
pub mod input; // 帧输入系统
pub mod manager; // 生命周期与控制面
pub mod pipeline; // 两级调度流水线
pub mod telemetry; // 日志
pub mod tracking; // 跟踪目标匹配

pub use crate::algorithms::{Algorithm, Algorithms};
pub use crate::config::{PoseLimits, VisionConfig};
pub use crate::detection::{FrameReport, ProcessingStatus, Rect};
pub use crate::error::{TrackingError, VisionError};
pub use crate::face::{EnrollmentStatus, FaceLibrary, FaceResult};
pub use crate::manager::{
    CameraControl, FaceCommand, FaceRequest, FaceResponse, LifecycleState, Platform,
    VisionManager,
};
pub use crate::pipeline::VisionOutputs;

/// 当前时间字符串 (北京时间), 用于截图文件名
pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = match chrono::FixedOffset::east_opt(8 * 60 * 60) {
        Some(offset) => chrono::Utc::now().with_timezone(&offset).naive_local(),
        None => chrono::Utc::now().naive_utc(),
    };
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}
