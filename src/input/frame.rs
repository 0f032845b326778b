//! 帧与最新帧槽位
//!
//! 取帧线程写入, 一级调度与人脸录入读取. 读取方按序号判断新旧,
//! 互不抢占, 任何读取方都不会看到比最新帧更旧的帧.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::pipeline::sync::{lock, wait, wait_timeout, CancelToken, Wake};

/// 采集时间戳 (单调时钟, 纳秒)
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }
}

/// 一帧图像, 创建后不可变, 通过 `Arc` 共享
#[derive(Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub stamp: Timestamp,
}

impl Frame {
    pub fn new(image: RgbImage, stamp: Timestamp) -> Self {
        Self { image, stamp }
    }
}

#[derive(Default)]
struct Slot {
    sequence: u64,
    frame: Option<Arc<Frame>>,
}

/// 最新帧槽位 (latest-wins)
#[derive(Default)]
pub struct LatestFrameCell {
    slot: Mutex<Slot>,
    filled: Condvar,
}

impl LatestFrameCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入新帧并唤醒所有等待者, 返回帧序号 (从1开始)
    pub fn publish(&self, frame: Arc<Frame>) -> u64 {
        let mut slot = lock(&self.slot);
        slot.sequence += 1;
        slot.frame = Some(frame);
        self.filled.notify_all();
        slot.sequence
    }

    pub fn sequence(&self) -> u64 {
        lock(&self.slot).sequence
    }

    pub fn latest(&self) -> Option<(u64, Arc<Frame>)> {
        let slot = lock(&self.slot);
        slot.frame.clone().map(|frame| (slot.sequence, frame))
    }

    /// 等待序号大于 `seen` 的帧; 取消时返回 None
    pub fn wait_newer(&self, seen: u64, cancel: &CancelToken) -> Option<(u64, Arc<Frame>)> {
        let mut slot = lock(&self.slot);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if slot.sequence > seen {
                if let Some(frame) = &slot.frame {
                    return Some((slot.sequence, frame.clone()));
                }
            }
            slot = wait(&self.filled, slot);
        }
    }

    /// 同 `wait_newer`, 超时返回 None
    pub fn wait_newer_timeout(
        &self,
        seen: u64,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Option<(u64, Arc<Frame>)> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.slot);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if slot.sequence > seen {
                if let Some(frame) = &slot.frame {
                    return Some((slot.sequence, frame.clone()));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = wait_timeout(&self.filled, slot, remaining);
        }
    }
}

impl Wake for LatestFrameCell {
    fn wake(&self) {
        let _slot = lock(&self.slot);
        self.filled.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(stamp: u64) -> Arc<Frame> {
        Arc::new(Frame::new(RgbImage::new(4, 4), Timestamp(stamp)))
    }

    #[test]
    fn test_latest_wins() {
        let cell = LatestFrameCell::new();
        assert!(cell.latest().is_none());
        cell.publish(frame(1));
        cell.publish(frame(2));
        let seq = cell.publish(frame(3));
        assert_eq!(seq, 3);

        let token = CancelToken::new();
        let (seen, newest) = cell.wait_newer(0, &token).unwrap();
        assert_eq!(seen, 3);
        assert_eq!(newest.stamp, Timestamp(3));
    }

    #[test]
    fn test_consumers_do_not_steal() {
        let cell = LatestFrameCell::new();
        cell.publish(frame(7));
        let token = CancelToken::new();
        let a = cell.wait_newer(0, &token).unwrap();
        let b = cell.wait_newer(0, &token).unwrap();
        assert_eq!(a.0, b.0);
        assert!(Arc::ptr_eq(&a.1, &b.1));
    }

    #[test]
    fn test_monotonic_observation() {
        let cell = Arc::new(LatestFrameCell::new());
        let token = CancelToken::new();
        let producer = {
            let cell = cell.clone();
            thread::spawn(move || {
                for i in 1..=200 {
                    cell.publish(frame(i));
                }
            })
        };
        let mut seen = 0;
        let mut last_stamp = Timestamp(0);
        while seen < 200 {
            let (seq, f) = cell.wait_newer(seen, &token).unwrap();
            assert!(seq > seen);
            assert!(f.stamp > last_stamp);
            seen = seq;
            last_stamp = f.stamp;
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_wait_newer_timeout() {
        let cell = LatestFrameCell::new();
        let token = CancelToken::new();
        cell.publish(frame(1));
        assert!(cell
            .wait_newer_timeout(1, &token, Duration::from_millis(20))
            .is_none());
    }

    #[test]
    fn test_cancel_wakes_frame_waiter() {
        let cell = Arc::new(LatestFrameCell::new());
        let token = CancelToken::new();
        token.register(&cell);
        let waiter = {
            let cell = cell.clone();
            let token = token.clone();
            thread::spawn(move || cell.wait_newer(0, &token).is_none())
        };
        thread::sleep(Duration::from_millis(30));
        token.cancel();
        assert!(waiter.join().unwrap());
    }
}
