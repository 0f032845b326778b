/// 检测数据 (Detection data)
///
/// 各算法工作线程共享的结果类型
/// - Rect:        像素矩形与IOU
/// - BodyInfo:    人体 + 对齐的手势/关键点/ReID
/// - FrameReport: 每帧合并报告
pub mod types;

pub use types::{
    BodyBox, BodyInfo, FaceInfo, FaceObservation, FrameReport, Gesture, Point2, ProcessingStatus,
    Rect,
};
