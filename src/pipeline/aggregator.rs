/// 结果汇总与发布
///
/// 每级一个 `StageScope`: 报告 + 未完成计数, 工作线程在同一临界区内
/// 写入自己的字段并递减计数, 计数归零时唤醒调度线程.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::algorithms::{Algorithm, AlgorithmSet, Stage};
use crate::detection::{
    BodyBox, BodyInfo, FaceInfo, FrameReport, Gesture, Point2, ProcessingStatus, Rect,
};
use crate::face::FaceResult;
use crate::pipeline::sync::{lock, wait, CancelToken, Wake};

// ========== 工作线程贡献 ==========

/// 单个工作线程对报告的贡献, 各变体写入互不相交的字段
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    Bodies(Vec<BodyBox>),
    Faces(Vec<FaceInfo>),
    Focus(Option<Rect>),
    Reid(Option<(i32, Rect)>),
    Gestures(Vec<Option<Gesture>>),
    Keypoints(Vec<Vec<Point2>>),
    Nothing,
}

impl Contribution {
    fn apply(self, report: &mut FrameReport) {
        match self {
            Contribution::Bodies(bodies) => {
                report.bodies = bodies.iter().map(BodyInfo::from).collect();
            }
            Contribution::Faces(faces) => report.faces = faces,
            Contribution::Focus(track) => {
                if track.is_some() {
                    report.track = track;
                }
            }
            Contribution::Reid(Some((id, rect))) => {
                report.track = Some(rect);
                if let Some(i) = report.best_body_for(&rect) {
                    report.bodies[i].reid = Some(id);
                }
            }
            Contribution::Gestures(gestures) => {
                for (body, gesture) in report.bodies.iter_mut().zip(gestures) {
                    body.gesture = gesture;
                }
            }
            Contribution::Keypoints(keypoints) => {
                for (body, points) in report.bodies.iter_mut().zip(keypoints) {
                    body.keypoints = points;
                }
            }
            Contribution::Reid(None) | Contribution::Nothing => {}
        }
    }
}

// ========== 单级汇总 ==========

#[derive(Default)]
struct ScopeState {
    cycle: u64,
    outstanding: usize,
    report: FrameReport,
}

pub struct StageScope {
    stage: Stage,
    state: Mutex<ScopeState>,
    idle: Condvar,
}

impl StageScope {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            state: Mutex::new(ScopeState::default()),
            idle: Condvar::new(),
        }
    }

    /// 开始新的一轮, 以 `report` 为初始内容
    pub fn open(&self, report: FrameReport) {
        let mut state = lock(&self.state);
        state.cycle = report.cycle;
        state.outstanding = 0;
        state.report = report;
    }

    pub fn add_outstanding(&self) {
        lock(&self.state).outstanding += 1;
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.state).outstanding
    }

    /// 写入贡献并递减计数; 非当前轮的结果丢弃
    pub fn complete(&self, cycle: u64, contribution: Contribution) {
        let mut state = lock(&self.state);
        if cycle != state.cycle || state.outstanding == 0 {
            warn!(
                "⚠️  {:?} 丢弃过期结果: cycle {} (当前 {})",
                self.stage, cycle, state.cycle
            );
            return;
        }
        contribution.apply(&mut state.report);
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.idle.notify_all();
        }
    }

    /// 等待计数归零并取走报告; 取消时返回 None
    pub fn wait_idle(&self, cancel: &CancelToken) -> Option<FrameReport> {
        let mut state = lock(&self.state);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if state.outstanding == 0 {
                return Some(std::mem::take(&mut state.report));
            }
            state = wait(&self.idle, state);
        }
    }
}

impl Wake for StageScope {
    fn wake(&self) {
        let _state = lock(&self.state);
        self.idle.notify_all();
    }
}

// ========== 一级 → 二级 报告交接 ==========

/// 由二级发布的一级报告, 按轮次排队
#[derive(Default)]
pub struct Handoff {
    reports: Mutex<VecDeque<FrameReport>>,
    deposited: Condvar,
}

impl Handoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(&self, report: FrameReport) {
        lock(&self.reports).push_back(report);
        self.deposited.notify_all();
    }

    /// 取走早于 `cycle` 的报告 (二级跳过的轮次)
    pub fn take_before(&self, cycle: u64) -> Vec<FrameReport> {
        let mut reports = lock(&self.reports);
        let mut stale = Vec::new();
        while reports.front().is_some_and(|r| r.cycle < cycle) {
            if let Some(report) = reports.pop_front() {
                stale.push(report);
            }
        }
        stale
    }

    /// 等待并取走 `cycle` 轮的报告; 取消时返回 None
    pub fn take_cycle(&self, cycle: u64, cancel: &CancelToken) -> Option<FrameReport> {
        let mut reports = lock(&self.reports);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(pos) = reports.iter().position(|r| r.cycle == cycle) {
                return reports.remove(pos);
            }
            reports = wait(&self.deposited, reports);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.reports).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Wake for Handoff {
    fn wake(&self) {
        let _reports = lock(&self.reports);
        self.deposited.notify_all();
    }
}

// ========== 跟踪状态 ==========

#[derive(Default)]
pub struct StatusCell {
    tracking: AtomicBool,
}

impl StatusCell {
    pub fn get(&self) -> ProcessingStatus {
        if self.tracking.load(Ordering::Acquire) {
            ProcessingStatus::Tracking
        } else {
            ProcessingStatus::Selecting
        }
    }

    /// 返回之前的状态
    pub fn set(&self, status: ProcessingStatus) -> ProcessingStatus {
        let was = self
            .tracking
            .swap(status == ProcessingStatus::Tracking, Ordering::AcqRel);
        if was {
            ProcessingStatus::Tracking
        } else {
            ProcessingStatus::Selecting
        }
    }
}

// ========== 发布 ==========

/// 调用方持有的输出队列
pub struct VisionOutputs {
    pub reports: Receiver<FrameReport>,
    pub status: Receiver<ProcessingStatus>,
    pub face_results: Receiver<FaceResult>,
}

/// 发布端, 队列满时丢弃并告警
#[derive(Clone)]
pub struct Publisher {
    reports: Sender<FrameReport>,
    status: Sender<ProcessingStatus>,
    face_results: Sender<FaceResult>,
    status_cell: Arc<StatusCell>,
    algorithms: Arc<AlgorithmSet>,
}

impl Publisher {
    pub fn new(
        capacity: usize,
        status_cell: Arc<StatusCell>,
        algorithms: Arc<AlgorithmSet>,
    ) -> (Self, VisionOutputs) {
        let capacity = capacity.max(1);
        let (reports_tx, reports_rx) = bounded(capacity);
        let (status_tx, status_rx) = bounded(capacity);
        let (face_tx, face_rx) = bounded(capacity);
        let publisher = Self {
            reports: reports_tx,
            status: status_tx,
            face_results: face_tx,
            status_cell,
            algorithms,
        };
        let outputs = VisionOutputs {
            reports: reports_rx,
            status: status_rx,
            face_results: face_rx,
        };
        (publisher, outputs)
    }

    /// 发布报告, Body 或 Focus 启用时随后发布跟踪状态
    pub fn publish_report(&self, report: FrameReport) {
        debug!(
            "📤 发布 cycle {}: {} 人体, {} 人脸",
            report.cycle,
            report.bodies.len(),
            report.faces.len()
        );
        send("report", &self.reports, report);

        let enabled = self.algorithms.snapshot();
        if enabled.contains(Algorithm::Body) || enabled.contains(Algorithm::Focus) {
            send("status", &self.status, self.status_cell.get());
        }
    }

    pub fn publish_face_result(&self, result: FaceResult) {
        send("face result", &self.face_results, result);
    }
}

fn send<T>(what: &str, tx: &Sender<T>, value: T) {
    match tx.try_send(value) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("⚠️  {} 队列已满, 丢弃", what),
        Err(TrySendError::Disconnected(_)) => debug!("{} 接收端已关闭", what),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Timestamp;
    use std::thread;
    use std::time::Duration;

    fn bodies() -> Vec<BodyBox> {
        vec![
            BodyBox {
                rect: Rect::new(0, 0, 10, 20),
                score: 0.9,
            },
            BodyBox {
                rect: Rect::new(50, 0, 10, 20),
                score: 0.8,
            },
        ]
    }

    #[test]
    fn test_scope_counts_to_zero() {
        let scope = StageScope::new(Stage::Primary);
        let token = CancelToken::new();
        scope.open(FrameReport::new(1, Timestamp(1)));
        scope.add_outstanding();
        scope.add_outstanding();

        scope.complete(1, Contribution::Bodies(bodies()));
        assert_eq!(scope.outstanding(), 1);
        scope.complete(1, Contribution::Nothing);

        let report = scope.wait_idle(&token).unwrap();
        assert_eq!(report.cycle, 1);
        assert_eq!(report.bodies.len(), 2);
    }

    #[test]
    fn test_stale_cycle_is_ignored() {
        let scope = StageScope::new(Stage::Dependent);
        scope.open(FrameReport::new(5, Timestamp(5)));
        scope.add_outstanding();
        scope.complete(4, Contribution::Faces(vec![]));
        assert_eq!(scope.outstanding(), 1);
    }

    #[test]
    fn test_alignment_by_index() {
        let mut report = FrameReport::new(1, Timestamp(1));
        Contribution::Bodies(bodies()).apply(&mut report);
        Contribution::Gestures(vec![
            None,
            Some(Gesture {
                rect: Rect::new(52, 2, 4, 4),
                label: "wave".into(),
                score: 0.7,
            }),
        ])
        .apply(&mut report);
        Contribution::Keypoints(vec![vec![Point2::new(1.0, 2.0, 0.9)], vec![]]).apply(&mut report);
        Contribution::Reid(Some((7, Rect::new(49, 0, 10, 20)))).apply(&mut report);

        assert_eq!(report.bodies[0].gesture, None);
        assert_eq!(report.bodies[1].gesture.as_ref().unwrap().label, "wave");
        assert_eq!(report.bodies[0].keypoints.len(), 1);
        assert!(report.bodies[1].keypoints.is_empty());
        assert_eq!(report.bodies[1].reid, Some(7));
        assert_eq!(report.bodies[0].reid, None);
        assert_eq!(report.track, Some(Rect::new(49, 0, 10, 20)));
    }

    #[test]
    fn test_wait_idle_wakes_on_last_completion() {
        let scope = Arc::new(StageScope::new(Stage::Primary));
        let token = CancelToken::new();
        scope.open(FrameReport::new(3, Timestamp(3)));
        scope.add_outstanding();
        let worker = {
            let scope = scope.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                scope.complete(3, Contribution::Focus(Some(Rect::new(1, 1, 2, 2))));
            })
        };
        let report = scope.wait_idle(&token).unwrap();
        worker.join().unwrap();
        assert_eq!(report.track, Some(Rect::new(1, 1, 2, 2)));
    }

    #[test]
    fn test_handoff() {
        let handoff = Handoff::new();
        let token = CancelToken::new();
        for cycle in [1, 2, 4] {
            handoff.deposit(FrameReport::new(cycle, Timestamp(cycle)));
        }
        let stale: Vec<u64> = handoff.take_before(4).iter().map(|r| r.cycle).collect();
        assert_eq!(stale, vec![1, 2]);
        assert_eq!(handoff.take_cycle(4, &token).unwrap().cycle, 4);
        assert!(handoff.is_empty());
    }

    #[test]
    fn test_status_published_only_with_body_or_focus() {
        let algorithms = Arc::new(AlgorithmSet::default());
        let status = Arc::new(StatusCell::default());
        let (publisher, outputs) = Publisher::new(4, status.clone(), algorithms.clone());

        algorithms.set(Algorithm::Face, true);
        publisher.publish_report(FrameReport::new(1, Timestamp(1)));
        assert!(outputs.reports.try_recv().is_ok());
        assert!(outputs.status.try_recv().is_err());

        algorithms.set(Algorithm::Focus, true);
        status.set(ProcessingStatus::Tracking);
        publisher.publish_report(FrameReport::new(2, Timestamp(2)));
        assert_eq!(outputs.status.try_recv().unwrap(), ProcessingStatus::Tracking);
    }

    #[test]
    fn test_full_queue_drops() {
        let (publisher, outputs) = Publisher::new(
            1,
            Arc::new(StatusCell::default()),
            Arc::new(AlgorithmSet::default()),
        );
        publisher.publish_report(FrameReport::new(1, Timestamp(1)));
        publisher.publish_report(FrameReport::new(2, Timestamp(2)));
        assert_eq!(outputs.reports.try_recv().unwrap().cycle, 1);
        assert!(outputs.reports.try_recv().is_err());
    }
}
