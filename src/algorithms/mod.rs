/// 算法统一接口
///
/// # 架构说明
///
/// 六个推理引擎均由外部提供, 此处只定义调用接口:
/// - **一级 (Stage 1)**: Body / Face / Focus, 输入为最新帧
/// - **二级 (Stage 2)**: ReID / Gesture / Keypoints, 输入为人体检测历史
///
/// 所有调用都是同步阻塞的, 失败返回 `anyhow::Error`,
/// 由工作线程记录日志后视为本帧无输出.
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use image::RgbImage;

use crate::detection::{BodyBox, FaceInfo, FaceObservation, Gesture, Point2, Rect};
use crate::face::FaceFeatures;

// ========== 算法标识 ==========

/// 算法类型 (控制面编码与原系统一致)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Face,
    Body,
    Gesture,
    Keypoints,
    Reid,
    Focus,
}

/// 所属调度级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Primary,
    Dependent,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::Face,
        Algorithm::Body,
        Algorithm::Gesture,
        Algorithm::Keypoints,
        Algorithm::Reid,
        Algorithm::Focus,
    ];

    pub fn code(self) -> i32 {
        match self {
            Algorithm::Face => 0,
            Algorithm::Body => 1,
            Algorithm::Gesture => 2,
            Algorithm::Keypoints => 3,
            Algorithm::Reid => 4,
            Algorithm::Focus => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.code() == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            Algorithm::Face => "face",
            Algorithm::Body => "body",
            Algorithm::Gesture => "gesture",
            Algorithm::Keypoints => "keypoints",
            Algorithm::Reid => "reid",
            Algorithm::Focus => "focus",
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            Algorithm::Body | Algorithm::Face | Algorithm::Focus => Stage::Primary,
            Algorithm::Reid | Algorithm::Gesture | Algorithm::Keypoints => Stage::Dependent,
        }
    }

    fn bit(self) -> u8 {
        1 << self.code()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 已启用算法快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnabledAlgorithms(u8);

impl EnabledAlgorithms {
    pub fn contains(self, algo: Algorithm) -> bool {
        self.0 & algo.bit() != 0
    }

    pub fn any_primary(self) -> bool {
        Algorithm::ALL
            .iter()
            .any(|a| a.stage() == Stage::Primary && self.contains(*a))
    }

    pub fn any_dependent(self) -> bool {
        Algorithm::ALL
            .iter()
            .any(|a| a.stage() == Stage::Dependent && self.contains(*a))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Algorithm> {
        Algorithm::ALL.into_iter().filter(move |a| self.contains(*a))
    }
}

impl FromIterator<Algorithm> for EnabledAlgorithms {
    fn from_iter<I: IntoIterator<Item = Algorithm>>(iter: I) -> Self {
        Self(iter.into_iter().fold(0, |bits, a| bits | a.bit()))
    }
}

/// 算法开关表, 仅由控制面修改
#[derive(Debug, Default)]
pub struct AlgorithmSet {
    bits: AtomicU8,
}

impl AlgorithmSet {
    pub fn snapshot(&self) -> EnabledAlgorithms {
        EnabledAlgorithms(self.bits.load(Ordering::Acquire))
    }

    /// 设置开关, 返回之前是否启用
    pub fn set(&self, algo: Algorithm, enabled: bool) -> bool {
        let prev = if enabled {
            self.bits.fetch_or(algo.bit(), Ordering::AcqRel)
        } else {
            self.bits.fetch_and(!algo.bit(), Ordering::AcqRel)
        };
        prev & algo.bit() != 0
    }

    pub fn clear(&self) {
        self.bits.store(0, Ordering::Release);
    }
}

// ========== 外部算法接口 ==========

/// 人体检测
pub trait BodyDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BodyBox>>;
}

/// 人脸识别
pub trait FaceRecognizer: Send {
    /// 检测并与人脸库比对
    fn recognize(&mut self, image: &RgbImage, library: &FaceFeatures) -> Result<Vec<FaceInfo>>;

    /// 人脸属性与特征 (录入用)
    fn face_info(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>>;
}

/// 跟踪结果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackOutcome {
    pub rect: Option<Rect>,
    pub lost: bool,
}

/// 自动跟随 (单目标跟踪)
pub trait FocusTracker: Send {
    fn track(&mut self, image: &RgbImage) -> Result<TrackOutcome>;
    fn set_tracker(&mut self, image: &RgbImage, rect: Rect) -> Result<bool>;
    fn reset(&mut self);
}

/// ReID 跟踪结果, 目标为 (人员ID, 位置)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReidOutcome {
    pub target: Option<(i32, Rect)>,
    pub lost: bool,
}

/// 行人重识别
pub trait PersonReid: Send {
    fn track(&mut self, image: &RgbImage, bodies: &[BodyBox]) -> Result<ReidOutcome>;
    fn set_tracker(&mut self, image: &RgbImage, rect: Rect) -> Result<bool>;
    fn reset(&mut self);
}

/// 手势识别, 返回值按下标与输入区域对齐
pub trait GestureRecognizer: Send {
    fn get_gesture(&mut self, image: &RgbImage, regions: &[Rect]) -> Result<Vec<Option<Gesture>>>;
}

/// 关键点检测, 返回值按下标与输入区域对齐
pub trait KeypointsDetector: Send {
    fn get_keypoints(&mut self, image: &RgbImage, regions: &[Rect]) -> Result<Vec<Vec<Point2>>>;
}

/// 线程间共享的算法实例
pub type Shared<T> = Arc<Mutex<Box<T>>>;

pub fn shared<T: ?Sized>(model: Box<T>) -> Shared<T> {
    Arc::new(Mutex::new(model))
}

/// 全部算法实例
#[derive(Clone)]
pub struct Algorithms {
    pub body: Shared<dyn BodyDetector>,
    pub face: Shared<dyn FaceRecognizer>,
    pub focus: Shared<dyn FocusTracker>,
    pub reid: Shared<dyn PersonReid>,
    pub gesture: Shared<dyn GestureRecognizer>,
    pub keypoints: Shared<dyn KeypointsDetector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for algo in Algorithm::ALL {
            assert_eq!(Algorithm::from_code(algo.code()), Some(algo));
        }
        assert_eq!(Algorithm::from_code(6), None);
        assert_eq!(Algorithm::from_code(-1), None);
    }

    #[test]
    fn test_algorithm_set() {
        let set = AlgorithmSet::default();
        assert!(!set.set(Algorithm::Body, true));
        assert!(set.set(Algorithm::Body, true));
        set.set(Algorithm::Gesture, true);

        let enabled = set.snapshot();
        assert!(enabled.contains(Algorithm::Body));
        assert!(enabled.any_primary());
        assert!(enabled.any_dependent());
        assert!(!enabled.contains(Algorithm::Face));

        assert!(set.set(Algorithm::Gesture, false));
        assert!(!set.snapshot().any_dependent());

        set.clear();
        assert!(set.snapshot().is_empty());
    }
}
