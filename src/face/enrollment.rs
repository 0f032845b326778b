//! 人脸录入任务
//!
//! 独立线程, 在截止时间内逐帧检查姿态, 结果只发布一次.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{ImageFormat, RgbImage};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::library::{check_face_pose, FaceLibrary};
use crate::algorithms::{FaceRecognizer, Shared};
use crate::config::PoseLimits;
use crate::detection::FaceObservation;
use crate::input::LatestFrameCell;
use crate::pipeline::sync::{lock, CancelToken};
use crate::pipeline::Publisher;

/// 录入结果状态码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Ok,
    Cancelled,
    Timeout,
    Duplicate,
    InvalidArgs,
}

impl EnrollmentStatus {
    pub fn code(self) -> i32 {
        match self {
            EnrollmentStatus::Ok => 0,
            EnrollmentStatus::Cancelled => 2,
            EnrollmentStatus::Timeout => 3,
            EnrollmentStatus::Duplicate => 17,
            EnrollmentStatus::InvalidArgs => -1,
        }
    }
}

/// 录入结果事件, OK/DUPLICATE 附带截图 (PNG)
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FaceResult {
    pub status: EnrollmentStatus,
    pub name: String,
    pub message: String,
    #[serde(skip)]
    pub image_png: Option<Vec<u8>>,
}

impl FaceResult {
    pub fn new(status: EnrollmentStatus, name: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            name: name.to_string(),
            message: message.into(),
            image_png: None,
        }
    }

    pub fn with_image(mut self, image: &RgbImage) -> Self {
        self.image_png = encode_png(image);
        self
    }
}

pub fn encode_png(image: &RgbImage) -> Option<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    match image.write_to(&mut buf, ImageFormat::Png) {
        Ok(()) => Some(buf.into_inner()),
        Err(e) => {
            warn!("⚠️  PNG 编码失败: {}", e);
            None
        }
    }
}

/// 一次录入会话
pub struct EnrollmentSession {
    name: String,
    deadline: Instant,
    token: CancelToken,
    finished: AtomicBool,
    best: Mutex<Option<FaceObservation>>,
}

impl EnrollmentSession {
    /// `parent` 取消 (停用) 时会话随之取消
    pub fn new(name: &str, timeout: Duration, parent: &CancelToken) -> Self {
        Self {
            name: name.to_string(),
            deadline: Instant::now() + timeout,
            token: parent.child(),
            finished: AtomicBool::new(false),
            best: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// 发布终态, 每个会话只成功一次
    pub fn finish(&self, result: FaceResult, publisher: &Publisher) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("录入 {} 已结束, 忽略 {:?}", self.name, result.status);
            return false;
        }
        info!(
            "👤 录入 {} 结束: {:?} ({})",
            self.name, result.status, result.message
        );
        publisher.publish_face_result(result);
        true
    }

    /// 取消会话; 已有终态时不再发布
    pub fn cancel(&self, publisher: &Publisher) -> bool {
        let published = self.finish(
            FaceResult::new(EnrollmentStatus::Cancelled, &self.name, "cancelled"),
            publisher,
        );
        self.token.cancel();
        published
    }

    fn remember(&self, face: &FaceObservation) {
        let mut best = lock(&self.best);
        if best.as_ref().map_or(true, |b| face.score > b.score) {
            *best = Some(face.clone());
        }
    }

    pub fn best_score(&self) -> Option<f32> {
        lock(&self.best).as_ref().map(|b| b.score)
    }
}

/// 录入任务依赖
#[derive(Clone)]
pub struct EnrollmentContext {
    pub cell: Arc<LatestFrameCell>,
    pub recognizer: Shared<dyn FaceRecognizer>,
    pub library: Arc<FaceLibrary>,
    pub publisher: Publisher,
    pub pose: PoseLimits,
    pub duplicate_threshold: f32,
}

/// 录入主循环: 等帧 → 姿态检查 → 查重 → 缓存待确认特征
pub fn run_enrollment(session: &EnrollmentSession, ctx: &EnrollmentContext) {
    info!("👤 开始录入人脸: {}", session.name);
    session.token.register(&ctx.cell);
    let mut seen = 0;
    loop {
        let remaining = session.remaining();
        if remaining.is_zero() {
            break;
        }
        let Some((sequence, frame)) = ctx.cell.wait_newer_timeout(seen, &session.token, remaining)
        else {
            if session.token.is_cancelled() {
                session.finish(
                    FaceResult::new(EnrollmentStatus::Cancelled, &session.name, "cancelled"),
                    &ctx.publisher,
                );
                return;
            }
            continue;
        };
        seen = sequence;
        if session.is_finished() {
            return;
        }

        let faces = match lock(&ctx.recognizer).face_info(&frame.image) {
            Ok(faces) => faces,
            Err(e) => {
                warn!("⚠️  人脸属性获取失败: {:#}", e);
                continue;
            }
        };
        let face = match check_face_pose(&faces, &ctx.pose) {
            Ok(face) => face,
            Err(reason) => {
                if let Some(best) = faces.iter().max_by(|a, b| a.score.total_cmp(&b.score)) {
                    session.remember(best);
                }
                debug!("录入 {} 姿态不合格: {}", session.name, reason);
                continue;
            }
        };

        let features = ctx.library.features();
        let matches = match lock(&ctx.recognizer).recognize(&frame.image, &features) {
            Ok(matches) => matches,
            Err(e) => {
                warn!("⚠️  人脸比对失败: {:#}", e);
                continue;
            }
        };
        let duplicate = matches
            .iter()
            .filter(|m| !m.id.is_empty())
            .max_by(|a, b| a.match_score.total_cmp(&b.match_score))
            .filter(|m| m.match_score > ctx.duplicate_threshold);

        let result = match duplicate {
            Some(existing) => {
                warn!(
                    "⚠️  {} 已在人脸库中, 匹配分数 {:.2}",
                    existing.id, existing.match_score
                );
                FaceResult::new(
                    EnrollmentStatus::Duplicate,
                    &existing.id,
                    "face already in library",
                )
            }
            None => {
                ctx.library.cache_candidate(&session.name, face.feature.clone());
                FaceResult::new(EnrollmentStatus::Ok, &session.name, "ok")
            }
        };
        session.finish(result.with_image(&frame.image), &ctx.publisher);
        return;
    }

    if let Some(score) = session.best_score() {
        debug!("录入 {} 超时, 最佳候选置信度 {:.2}", session.name, score);
    }
    session.finish(
        FaceResult::new(EnrollmentStatus::Timeout, &session.name, "timeout"),
        &ctx.publisher,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{shared, AlgorithmSet};
    use crate::detection::{FaceInfo, Rect};
    use crate::face::FaceFeatures;
    use crate::input::{Frame, Timestamp};
    use crate::pipeline::{StatusCell, VisionOutputs};
    use anyhow::Result;

    struct ScriptedFaces {
        yaw: f32,
        match_score: f32,
    }

    impl FaceRecognizer for ScriptedFaces {
        fn recognize(
            &mut self,
            _image: &RgbImage,
            _library: &FaceFeatures,
        ) -> Result<Vec<FaceInfo>> {
            Ok(vec![FaceInfo {
                rect: Rect::new(0, 0, 4, 4),
                id: "carol".into(),
                score: 0.9,
                match_score: self.match_score,
                yaw: self.yaw,
                pitch: 0.0,
                roll: 0.0,
                age: 30,
                emotion: String::new(),
            }])
        }

        fn face_info(&mut self, _image: &RgbImage) -> Result<Vec<FaceObservation>> {
            Ok(vec![FaceObservation {
                rect: Rect::new(0, 0, 4, 4),
                score: 0.9,
                yaw: self.yaw,
                pitch: 0.0,
                roll: 0.0,
                feature: vec![1.0, 2.0],
            }])
        }
    }

    fn context(yaw: f32, match_score: f32) -> (EnrollmentContext, VisionOutputs) {
        let (publisher, outputs) = Publisher::new(
            8,
            Arc::new(StatusCell::default()),
            Arc::new(AlgorithmSet::default()),
        );
        let ctx = EnrollmentContext {
            cell: Arc::new(LatestFrameCell::new()),
            recognizer: shared::<dyn FaceRecognizer>(Box::new(ScriptedFaces {
                yaw,
                match_score,
            })),
            library: Arc::new(FaceLibrary::in_memory()),
            publisher,
            pose: PoseLimits::default(),
            duplicate_threshold: 0.65,
        };
        (ctx, outputs)
    }

    fn push_frame(cell: &LatestFrameCell) {
        cell.publish(Arc::new(Frame::new(RgbImage::new(4, 4), Timestamp(1))));
    }

    #[test]
    fn test_ok_caches_candidate_with_png() {
        let (ctx, outputs) = context(0.0, 0.1);
        push_frame(&ctx.cell);
        let session = EnrollmentSession::new("dave", Duration::from_secs(5), &CancelToken::new());
        run_enrollment(&session, &ctx);

        let result = outputs.face_results.try_recv().unwrap();
        assert_eq!(result.status, EnrollmentStatus::Ok);
        assert_eq!(result.name, "dave");
        assert!(result.image_png.is_some());
        assert!(ctx.library.has_candidate());
        assert!(outputs.face_results.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_names_existing_identity() {
        let (ctx, outputs) = context(0.0, 0.9);
        push_frame(&ctx.cell);
        let session = EnrollmentSession::new("dave", Duration::from_secs(5), &CancelToken::new());
        run_enrollment(&session, &ctx);

        let result = outputs.face_results.try_recv().unwrap();
        assert_eq!(result.status, EnrollmentStatus::Duplicate);
        assert_eq!(result.name, "carol");
        assert_eq!(result.status.code(), 17);
        assert!(!ctx.library.has_candidate());
    }

    #[test]
    fn test_single_timeout_then_silent_after_cancel() {
        let (ctx, outputs) = context(80.0, 0.0);
        push_frame(&ctx.cell);
        let token = CancelToken::new();
        let session = EnrollmentSession::new("erin", Duration::from_millis(50), &token);
        run_enrollment(&session, &ctx);

        let result = outputs.face_results.try_recv().unwrap();
        assert_eq!(result.status, EnrollmentStatus::Timeout);
        assert!(session.best_score().is_some());

        assert!(!session.cancel(&ctx.publisher));
        assert!(outputs.face_results.try_recv().is_err());
    }

    #[test]
    fn test_timeout_without_frames() {
        let (ctx, outputs) = context(0.0, 0.0);
        let token = CancelToken::new();
        let session = EnrollmentSession::new("finn", Duration::from_millis(30), &token);
        run_enrollment(&session, &ctx);
        assert_eq!(
            outputs.face_results.try_recv().unwrap().status,
            EnrollmentStatus::Timeout
        );
    }

    #[test]
    fn test_parent_cancel_stops_session() {
        let (ctx, outputs) = context(0.0, 0.0);
        let parent = CancelToken::new();
        let session = EnrollmentSession::new("gail", Duration::from_secs(30), &parent);
        parent.cancel();
        run_enrollment(&session, &ctx);
        assert_eq!(
            outputs.face_results.try_recv().unwrap().status,
            EnrollmentStatus::Cancelled
        );
    }
}
