/// 人体检测历史 (环形缓冲)
///
/// 由 Body 工作线程写入, 二级调度与跟踪目标匹配读取.
/// 条目写入后不可变, 以 `Arc` 快照共享.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::detection::BodyBox;
use crate::input::Frame;
use crate::pipeline::sync::{lock, wait, CancelToken, Wake};

/// 单帧人体检测结果
#[derive(Debug)]
pub struct DetectionEntry {
    pub cycle: u64,
    pub frame: Arc<Frame>,
    pub bodies: Vec<BodyBox>,
    /// 本帧报告由二级发布
    pub publish_in_stage2: bool,
}

#[derive(Default)]
struct Ring {
    entries: VecDeque<Arc<DetectionEntry>>,
    version: u64,
}

pub struct DetectionHistory {
    capacity: usize,
    ring: Mutex<Ring>,
    updated: Condvar,
}

impl DetectionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(Ring::default()),
            updated: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 追加条目 (满时淘汰最旧的) 并唤醒二级调度
    pub fn push(&self, entry: DetectionEntry) -> Arc<DetectionEntry> {
        let entry = Arc::new(entry);
        let mut ring = lock(&self.ring);
        if ring.entries.len() == self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(entry.clone());
        ring.version += 1;
        self.updated.notify_all();
        entry
    }

    pub fn latest(&self) -> Option<Arc<DetectionEntry>> {
        lock(&self.ring).entries.back().cloned()
    }

    /// 从旧到新的全部条目
    pub fn snapshot(&self) -> Vec<Arc<DetectionEntry>> {
        lock(&self.ring).entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.ring).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 等待版本号大于 `seen` 的写入, 返回 (版本号, 最新条目)
    pub fn wait_update(
        &self,
        seen: u64,
        cancel: &CancelToken,
    ) -> Option<(u64, Arc<DetectionEntry>)> {
        let mut ring = lock(&self.ring);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if ring.version > seen {
                if let Some(entry) = ring.entries.back() {
                    return Some((ring.version, entry.clone()));
                }
            }
            ring = wait(&self.updated, ring);
        }
    }

    /// 清空条目, 版本号保持递增
    pub fn clear(&self) {
        lock(&self.ring).entries.clear();
    }
}

impl Wake for DetectionHistory {
    fn wake(&self) {
        let _ring = lock(&self.ring);
        self.updated.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Rect;
    use crate::input::Timestamp;
    use image::RgbImage;

    fn entry(cycle: u64) -> DetectionEntry {
        DetectionEntry {
            cycle,
            frame: Arc::new(Frame::new(RgbImage::new(2, 2), Timestamp(cycle))),
            bodies: vec![BodyBox {
                rect: Rect::new(0, 0, 1, 1),
                score: 0.5,
            }],
            publish_in_stage2: false,
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let history = DetectionHistory::new(6);
        for cycle in 1..=8 {
            history.push(entry(cycle));
        }
        let cycles: Vec<u64> = history.snapshot().iter().map(|e| e.cycle).collect();
        assert_eq!(cycles, vec![3, 4, 5, 6, 7, 8]);
        assert_eq!(history.latest().unwrap().cycle, 8);
    }

    #[test]
    fn test_wait_update_returns_newest() {
        let history = DetectionHistory::new(3);
        let token = CancelToken::new();
        history.push(entry(1));
        history.push(entry(2));
        let (version, latest) = history.wait_update(0, &token).unwrap();
        assert_eq!(version, 2);
        assert_eq!(latest.cycle, 2);
    }

    #[test]
    fn test_clear_keeps_version() {
        let history = DetectionHistory::new(3);
        history.push(entry(1));
        history.clear();
        assert!(history.is_empty());
        history.push(entry(2));
        let (version, _) = history.wait_update(1, &CancelToken::new()).unwrap();
        assert_eq!(version, 2);
    }
}
