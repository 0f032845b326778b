/// 视觉管道数据结构定义
/// Data structures shared by workers, aggregator and publishers
use serde::{Deserialize, Serialize};

use crate::input::Timestamp;

// ========== 几何类型 ==========

/// 像素坐标矩形 (左上角 + 宽高)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn xmax(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn ymax(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    pub fn intersection_area(&self, another: &Rect) -> i64 {
        let l = (self.x as i64).max(another.x as i64);
        let r = self.xmax().min(another.xmax());
        let t = (self.y as i64).max(another.y as i64);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0) * (b - t).max(0)
    }

    pub fn union(&self, another: &Rect) -> i64 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// 交并比, 两个空矩形返回 0
    pub fn iou(&self, another: &Rect) -> f64 {
        let union = self.union(another);
        if union <= 0 {
            return 0.0;
        }
        self.intersection_area(another) as f64 / union as f64
    }
}

/// 关键点 (x, y, 置信度)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }
}

// ========== 算法输出 ==========

/// 人体检测框
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyBox {
    pub rect: Rect,
    pub score: f32,
}

/// 手势识别结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gesture {
    pub rect: Rect,
    pub label: String,
    pub score: f32,
}

/// 人脸识别结果 (用于发布)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceInfo {
    pub rect: Rect,
    /// 人脸库中匹配到的身份, 未匹配为空
    pub id: String,
    pub score: f32,
    pub match_score: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub age: u32,
    pub emotion: String,
}

/// 人脸属性 (录入时使用, 带特征向量)
#[derive(Clone, Debug, PartialEq)]
pub struct FaceObservation {
    pub rect: Rect,
    pub score: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub feature: Vec<f32>,
}

// ========== 发布报告 ==========

/// 报告中的单个人体, 手势/关键点/ReID 按下标与人体列表对齐
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyInfo {
    pub rect: Rect,
    pub score: f32,
    pub reid: Option<i32>,
    pub gesture: Option<Gesture>,
    pub keypoints: Vec<Point2>,
}

impl From<&BodyBox> for BodyInfo {
    fn from(body: &BodyBox) -> Self {
        Self {
            rect: body.rect,
            score: body.score,
            reid: None,
            gesture: None,
            keypoints: Vec::new(),
        }
    }
}

/// 跟踪状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    #[default]
    Selecting,
    Tracking,
}

/// 每帧合并后的检测报告
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    pub cycle: u64,
    pub stamp: Timestamp,
    pub bodies: Vec<BodyInfo>,
    pub faces: Vec<FaceInfo>,
    pub track: Option<Rect>,
}

impl FrameReport {
    pub fn new(cycle: u64, stamp: Timestamp) -> Self {
        Self {
            cycle,
            stamp,
            ..Default::default()
        }
    }

    /// 用一级的人脸和跟踪框补全二级报告
    pub fn merge_primary(&mut self, primary: FrameReport) {
        self.faces = primary.faces;
        if self.track.is_none() {
            self.track = primary.track;
        }
        if self.bodies.is_empty() {
            self.bodies = primary.bodies;
        }
    }

    /// 报告中与目标框IOU最大的人体下标
    pub fn best_body_for(&self, target: &Rect) -> Option<usize> {
        self.bodies
            .iter()
            .enumerate()
            .map(|(i, body)| (i, body.rect.iou(target)))
            .filter(|(_, iou)| *iou > 0.0)
            .fold(None, |best: Option<(usize, f64)>, (i, iou)| match best {
                Some((_, best_iou)) if best_iou >= iou => best,
                _ => Some((i, iou)),
            })
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_disjoint() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 20, 10, 10);
        assert_eq!(a.intersection_area(&b), 0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_identical() {
        let a = Rect::new(5, 5, 10, 10);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_iou_contained_quarter() {
        let outer = Rect::new(0, 0, 20, 20);
        let inner = Rect::new(0, 0, 10, 10);
        assert!((outer.iou(&inner) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_iou_touching_edges() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_empty_rects() {
        let a = Rect::new(3, 3, 0, 0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_best_body_for() {
        let mut report = FrameReport::new(1, Timestamp(0));
        for rect in [Rect::new(0, 0, 10, 10), Rect::new(100, 100, 50, 50)] {
            report.bodies.push(BodyInfo::from(&BodyBox { rect, score: 0.9 }));
        }
        assert_eq!(report.best_body_for(&Rect::new(110, 110, 40, 40)), Some(1));
        assert_eq!(report.best_body_for(&Rect::new(300, 300, 5, 5)), None);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&ProcessingStatus::Tracking).unwrap();
        assert_eq!(json, "\"TRACKING\"");
    }
}
