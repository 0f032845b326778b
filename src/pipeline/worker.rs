/// 算法工作线程
/// 职责: 等待触发 → 取快照 → 调用算法 → 写入本级报告并递减计数
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::algorithms::{
    Algorithm, BodyDetector, FaceRecognizer, FocusTracker, GestureRecognizer, KeypointsDetector,
    PersonReid, Shared,
};
use crate::detection::{ProcessingStatus, Rect};
use crate::face::FaceLibrary;
use crate::input::Frame;
use crate::pipeline::aggregator::{Contribution, StageScope, StatusCell};
use crate::pipeline::history::{DetectionEntry, DetectionHistory};
use crate::pipeline::sync::{lock, CancelToken, Trigger};

/// 一级任务: 最新帧
#[derive(Clone)]
pub struct PrimaryJob {
    pub cycle: u64,
    pub frame: Arc<Frame>,
    pub publish_in_stage2: bool,
}

/// 二级任务: 人体检测历史条目
#[derive(Clone)]
pub struct DependentJob {
    pub entry: Arc<DetectionEntry>,
}

pub trait Job: Send {
    fn cycle(&self) -> u64;
}

impl Job for PrimaryJob {
    fn cycle(&self) -> u64 {
        self.cycle
    }
}

impl Job for DependentJob {
    fn cycle(&self) -> u64 {
        self.entry.cycle
    }
}

pub trait StageWorker: Send {
    type Job: Job;

    fn algorithm(&self) -> Algorithm;

    fn process(&mut self, job: &Self::Job) -> Result<Contribution>;
}

/// 工作线程主循环, 取消后退出
pub fn run_worker<W: StageWorker>(
    mut worker: W,
    trigger: &Trigger<W::Job>,
    scope: &StageScope,
    cancel: &CancelToken,
) {
    let algo = worker.algorithm();
    info!("🚀 {} 工作线程启动", algo);
    while let Some(job) = trigger.wait(cancel) {
        let start = Instant::now();
        let contribution = match worker.process(&job) {
            Ok(contribution) => contribution,
            Err(e) => {
                warn!("⚠️  {} 推理失败 (cycle {}): {:#}", algo, job.cycle(), e);
                Contribution::Nothing
            }
        };
        debug!(
            "{} cycle {} 耗时 {:.1}ms",
            algo,
            job.cycle(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        scope.complete(job.cycle(), contribution);
    }
    info!("🛑 {} 工作线程退出", algo);
}

// ========== 一级 ==========

pub struct BodyWorker {
    pub detector: Shared<dyn BodyDetector>,
    pub history: Arc<DetectionHistory>,
}

impl StageWorker for BodyWorker {
    type Job = PrimaryJob;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Body
    }

    fn process(&mut self, job: &PrimaryJob) -> Result<Contribution> {
        let bodies = lock(&self.detector).detect(&job.frame.image)?;
        // 先写历史, 二级调度才能在本轮计数归零前开始
        self.history.push(DetectionEntry {
            cycle: job.cycle,
            frame: job.frame.clone(),
            bodies: bodies.clone(),
            publish_in_stage2: job.publish_in_stage2,
        });
        Ok(Contribution::Bodies(bodies))
    }
}

pub struct FaceWorker {
    pub recognizer: Shared<dyn FaceRecognizer>,
    pub library: Arc<FaceLibrary>,
}

impl StageWorker for FaceWorker {
    type Job = PrimaryJob;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Face
    }

    fn process(&mut self, job: &PrimaryJob) -> Result<Contribution> {
        let features = self.library.features();
        let faces = lock(&self.recognizer).recognize(&job.frame.image, &features)?;
        Ok(Contribution::Faces(faces))
    }
}

pub struct FocusWorker {
    pub tracker: Shared<dyn FocusTracker>,
    pub status: Arc<StatusCell>,
}

impl StageWorker for FocusWorker {
    type Job = PrimaryJob;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Focus
    }

    fn process(&mut self, job: &PrimaryJob) -> Result<Contribution> {
        let outcome = lock(&self.tracker).track(&job.frame.image)?;
        if outcome.lost
            && self.status.set(ProcessingStatus::Selecting) == ProcessingStatus::Tracking
        {
            info!("🔍 跟随目标丢失, 切换到选择状态");
        }
        Ok(Contribution::Focus(outcome.rect))
    }
}

// ========== 二级 ==========

pub struct ReidWorker {
    pub reid: Shared<dyn PersonReid>,
    pub status: Arc<StatusCell>,
}

impl StageWorker for ReidWorker {
    type Job = DependentJob;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Reid
    }

    fn process(&mut self, job: &DependentJob) -> Result<Contribution> {
        let entry = &job.entry;
        let outcome = lock(&self.reid).track(&entry.frame.image, &entry.bodies)?;
        if outcome.lost
            && self.status.set(ProcessingStatus::Selecting) == ProcessingStatus::Tracking
        {
            info!("🔍 ReID 目标丢失, 切换到选择状态");
        }
        Ok(Contribution::Reid(outcome.target))
    }
}

pub struct GestureWorker {
    pub recognizer: Shared<dyn GestureRecognizer>,
}

impl StageWorker for GestureWorker {
    type Job = DependentJob;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Gesture
    }

    fn process(&mut self, job: &DependentJob) -> Result<Contribution> {
        let regions = body_regions(&job.entry);
        if regions.is_empty() {
            return Ok(Contribution::Nothing);
        }
        let gestures = lock(&self.recognizer).get_gesture(&job.entry.frame.image, &regions)?;
        Ok(Contribution::Gestures(gestures))
    }
}

pub struct KeypointsWorker {
    pub detector: Shared<dyn KeypointsDetector>,
}

impl StageWorker for KeypointsWorker {
    type Job = DependentJob;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Keypoints
    }

    fn process(&mut self, job: &DependentJob) -> Result<Contribution> {
        let regions = body_regions(&job.entry);
        if regions.is_empty() {
            return Ok(Contribution::Nothing);
        }
        let keypoints = lock(&self.detector).get_keypoints(&job.entry.frame.image, &regions)?;
        Ok(Contribution::Keypoints(keypoints))
    }
}

fn body_regions(entry: &DetectionEntry) -> Vec<Rect> {
    entry.bodies.iter().map(|b| b.rect).collect()
}
