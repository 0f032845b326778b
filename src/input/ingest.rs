//! 取帧线程: 帧来源 → 最新帧槽位

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, info};

use super::channel::FrameSource;
use super::frame::LatestFrameCell;
use crate::pipeline::sync::{lock, CancelToken};

/// 在线程组中共享的帧来源
pub type SharedFrameSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// 循环取帧直到取消; 协议错误结束循环
pub fn run_ingestion(
    source: &Mutex<Box<dyn FrameSource>>,
    cell: &LatestFrameCell,
    poll: Duration,
    cancel: &CancelToken,
) {
    info!("📥 取帧线程启动");
    let mut source = lock(source);

    let mut count = 0u64;
    let mut window = 0u64;
    let mut last = Instant::now();
    while !cancel.is_cancelled() {
        match source.next_frame(poll) {
            Ok(Some(frame)) => {
                cell.publish(Arc::new(frame));
                count += 1;
                window += 1;
                if last.elapsed() >= Duration::from_secs(10) {
                    let fps = window as f64 / last.elapsed().as_secs_f64();
                    info!("📥 取帧 FPS: {:.1}", fps);
                    window = 0;
                    last = Instant::now();
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("❌ 取帧失败, 取帧线程退出: {}", e);
                break;
            }
        }
    }
    info!("📥 取帧线程退出, 共 {} 帧", count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::channel::{FrameLayout, IpcError};
    use crate::input::frame::{Frame, Timestamp};
    use image::RgbImage;

    struct Scripted {
        frames: u64,
    }

    impl FrameSource for Scripted {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>, IpcError> {
            if self.frames == 0 {
                return Err(IpcError::MutexTimeout(Duration::ZERO));
            }
            self.frames -= 1;
            let layout = FrameLayout::rgb(2, 2);
            Ok(Some(Frame::new(
                RgbImage::new(layout.width, layout.height),
                Timestamp(self.frames),
            )))
        }
    }

    #[test]
    fn test_error_ends_loop() {
        let source: Mutex<Box<dyn FrameSource>> = Mutex::new(Box::new(Scripted { frames: 3 }));
        let cell = LatestFrameCell::new();
        run_ingestion(&source, &cell, Duration::from_millis(1), &CancelToken::new());
        assert_eq!(cell.sequence(), 3);
    }
}
