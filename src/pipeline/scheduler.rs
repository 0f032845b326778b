/// 两级调度线程
///
/// 一级: 新帧 → 触发 Body/Face/Focus → 等待计数归零 → 发布或交给二级
/// 二级: 新的人体历史 → 触发 ReID/Gesture/Keypoints → 等待计数归零 → 合并发布
use std::sync::Arc;

use tracing::{debug, info};

use crate::algorithms::{Algorithm, AlgorithmSet};
use crate::detection::{BodyInfo, FrameReport};
use crate::input::LatestFrameCell;
use crate::pipeline::aggregator::{Handoff, Publisher, StageScope};
use crate::pipeline::history::DetectionHistory;
use crate::pipeline::sync::{CancelToken, Trigger};
use crate::pipeline::worker::{DependentJob, PrimaryJob};

pub struct PrimaryScheduler {
    pub cell: Arc<LatestFrameCell>,
    pub history: Arc<DetectionHistory>,
    pub algorithms: Arc<AlgorithmSet>,
    pub triggers: Vec<(Algorithm, Arc<Trigger<PrimaryJob>>)>,
    pub scope: Arc<StageScope>,
    pub handoff: Arc<Handoff>,
    pub publisher: Publisher,
}

impl PrimaryScheduler {
    pub fn run(&mut self, cancel: &CancelToken) {
        info!("🚀 一级调度启动");
        let mut seen = self.cell.sequence();
        while let Some((cycle, frame)) = self.cell.wait_newer(seen, cancel) {
            seen = cycle;
            let enabled = self.algorithms.snapshot();
            if !enabled.any_primary() {
                continue;
            }
            let publish_in_stage2 = enabled.contains(Algorithm::Body) && enabled.any_dependent();

            self.scope.open(FrameReport::new(cycle, frame.stamp));
            let mut fired = 0;
            for (algo, trigger) in &self.triggers {
                if !enabled.contains(*algo) {
                    continue;
                }
                let job = PrimaryJob {
                    cycle,
                    frame: frame.clone(),
                    publish_in_stage2,
                };
                if trigger.fire_with(job, || self.scope.add_outstanding()) {
                    fired += 1;
                } else {
                    debug!("{} 上一任务未完成, 跳过 cycle {}", algo, cycle);
                }
            }
            if fired == 0 {
                continue;
            }

            let Some(report) = self.scope.wait_idle(cancel) else {
                break;
            };
            let recorded = self.history.latest().is_some_and(|e| e.cycle == cycle);
            if publish_in_stage2 && recorded {
                self.handoff.deposit(report);
            } else {
                self.publisher.publish_report(report);
            }
        }
        info!("🛑 一级调度退出");
    }
}

pub struct DependentScheduler {
    pub history: Arc<DetectionHistory>,
    pub algorithms: Arc<AlgorithmSet>,
    pub triggers: Vec<(Algorithm, Arc<Trigger<DependentJob>>)>,
    pub scope: Arc<StageScope>,
    pub handoff: Arc<Handoff>,
    pub publisher: Publisher,
}

impl DependentScheduler {
    pub fn run(&mut self, cancel: &CancelToken) {
        info!("🚀 二级调度启动");
        let mut seen_version = 0;
        let mut last_cycle = 0;
        while let Some((version, entry)) = self.history.wait_update(seen_version, cancel) {
            seen_version = version;
            if entry.cycle <= last_cycle {
                continue;
            }
            last_cycle = entry.cycle;

            // 二级忙时被跳过的轮次, 按一级结果发布
            for stale in self.handoff.take_before(entry.cycle) {
                debug!("二级跳过 cycle {}, 发布一级结果", stale.cycle);
                self.publisher.publish_report(stale);
            }
            if !entry.publish_in_stage2 {
                continue;
            }

            let enabled = self.algorithms.snapshot();
            let mut report = FrameReport::new(entry.cycle, entry.frame.stamp);
            report.bodies = entry.bodies.iter().map(BodyInfo::from).collect();
            self.scope.open(report);
            for (algo, trigger) in &self.triggers {
                if !enabled.contains(*algo) {
                    continue;
                }
                let job = DependentJob {
                    entry: entry.clone(),
                };
                if !trigger.fire_with(job, || self.scope.add_outstanding()) {
                    debug!("{} 上一任务未完成, 跳过 cycle {}", algo, entry.cycle);
                }
            }

            let Some(mut report) = self.scope.wait_idle(cancel) else {
                break;
            };
            let Some(primary) = self.handoff.take_cycle(entry.cycle, cancel) else {
                break;
            };
            report.merge_primary(primary);
            self.publisher.publish_report(report);
        }
        info!("🛑 二级调度退出");
    }
}
