/// 视觉处理流水线 (Vision Processing Pipeline)
///
/// 每个职责一个线程, 通过触发器与条件变量协作:
/// - Ingest:    共享内存取帧 (独立线程)
/// - Primary:   一级调度 Body/Face/Focus
/// - Dependent: 二级调度 ReID/Gesture/Keypoints
/// - Workers:   六个算法工作线程
pub mod aggregator;
pub mod history;
pub mod scheduler;
pub mod sync;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::algorithms::{Algorithm, AlgorithmSet, Algorithms, Stage};
use crate::error::VisionError;
use crate::face::FaceLibrary;
use crate::input::{run_ingestion, LatestFrameCell, SharedFrameSource};

pub use aggregator::{Contribution, Handoff, Publisher, StageScope, StatusCell, VisionOutputs};
pub use history::{DetectionEntry, DetectionHistory};
pub use scheduler::{DependentScheduler, PrimaryScheduler};
pub use sync::{CancelToken, TaskGroup, Trigger, Wake};
pub use worker::{
    run_worker, BodyWorker, DependentJob, FaceWorker, FocusWorker, GestureWorker, KeypointsWorker,
    PrimaryJob, ReidWorker, StageWorker,
};

/// 跨激活周期保留的共享状态
#[derive(Clone)]
pub struct PipelineContext {
    pub cell: Arc<LatestFrameCell>,
    pub history: Arc<DetectionHistory>,
    pub algorithms: Arc<AlgorithmSet>,
    pub status: Arc<StatusCell>,
    pub library: Arc<FaceLibrary>,
    pub publisher: Publisher,
}

fn spawn_stage_worker<W>(
    group: &TaskGroup,
    worker: W,
    scope: &Arc<StageScope>,
) -> Result<Arc<Trigger<W::Job>>, VisionError>
where
    W: StageWorker + 'static,
    W::Job: 'static,
{
    let trigger = Arc::new(Trigger::new());
    group.token().register(&trigger);
    let name = format!("{}-worker", worker.algorithm());
    let (t, s) = (trigger.clone(), scope.clone());
    group.spawn(&name, move |token| run_worker(worker, &t, &s, &token))?;
    Ok(trigger)
}

/// 启动取帧、两级调度和六个工作线程
///
/// 返回的线程组在 `shutdown` 或析构时取消并回收全部线程.
pub fn spawn_pipeline(
    ctx: &PipelineContext,
    algos: &Algorithms,
    source: SharedFrameSource,
    poll: Duration,
) -> Result<TaskGroup, VisionError> {
    let group = TaskGroup::new(CancelToken::new());
    let token = group.token();
    token.register(&ctx.cell);
    token.register(&ctx.history);

    let primary_scope = Arc::new(StageScope::new(Stage::Primary));
    let dependent_scope = Arc::new(StageScope::new(Stage::Dependent));
    let handoff = Arc::new(Handoff::new());
    token.register(&primary_scope);
    token.register(&dependent_scope);
    token.register(&handoff);

    let body = spawn_stage_worker(
        &group,
        BodyWorker {
            detector: algos.body.clone(),
            history: ctx.history.clone(),
        },
        &primary_scope,
    )?;
    let face = spawn_stage_worker(
        &group,
        FaceWorker {
            recognizer: algos.face.clone(),
            library: ctx.library.clone(),
        },
        &primary_scope,
    )?;
    let focus = spawn_stage_worker(
        &group,
        FocusWorker {
            tracker: algos.focus.clone(),
            status: ctx.status.clone(),
        },
        &primary_scope,
    )?;
    let reid = spawn_stage_worker(
        &group,
        ReidWorker {
            reid: algos.reid.clone(),
            status: ctx.status.clone(),
        },
        &dependent_scope,
    )?;
    let gesture = spawn_stage_worker(
        &group,
        GestureWorker {
            recognizer: algos.gesture.clone(),
        },
        &dependent_scope,
    )?;
    let keypoints = spawn_stage_worker(
        &group,
        KeypointsWorker {
            detector: algos.keypoints.clone(),
        },
        &dependent_scope,
    )?;

    let mut primary = PrimaryScheduler {
        cell: ctx.cell.clone(),
        history: ctx.history.clone(),
        algorithms: ctx.algorithms.clone(),
        triggers: vec![
            (Algorithm::Body, body),
            (Algorithm::Face, face),
            (Algorithm::Focus, focus),
        ],
        scope: primary_scope,
        handoff: handoff.clone(),
        publisher: ctx.publisher.clone(),
    };
    group.spawn("primary-scheduler", move |token| primary.run(&token))?;

    let mut dependent = DependentScheduler {
        history: ctx.history.clone(),
        algorithms: ctx.algorithms.clone(),
        triggers: vec![
            (Algorithm::Reid, reid),
            (Algorithm::Gesture, gesture),
            (Algorithm::Keypoints, keypoints),
        ],
        scope: dependent_scope,
        handoff,
        publisher: ctx.publisher.clone(),
    };
    group.spawn("dependent-scheduler", move |token| dependent.run(&token))?;

    let cell = ctx.cell.clone();
    group.spawn("frame-ingest", move |token| {
        run_ingestion(&source, &cell, poll, &token)
    })?;

    info!("✅ 流水线已启动: {} 个线程", group.len());
    Ok(group)
}
