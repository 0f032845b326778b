//! 进程内取帧通道 (无共享内存平台及测试使用)
//!
//! 与共享内存版本执行相同的三信号量协议.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use image::RgbImage;

use super::channel::{
    FrameLayout, FrameRegion, IpcError, SemaphoreSet, ShmFrameSource, SEM_EMPTY, SEM_FULL,
    SEM_MUTEX,
};
use super::frame::Timestamp;
use crate::pipeline::sync::{lock, wait_timeout};

/// 进程内计数信号量组
pub struct LocalSemaphores {
    values: Mutex<[i32; 3]>,
    changed: Condvar,
}

impl LocalSemaphores {
    /// 初始值: 互斥=1, 空=1, 满=0
    pub fn new() -> Self {
        Self {
            values: Mutex::new([1, 1, 0]),
            changed: Condvar::new(),
        }
    }

    pub fn value(&self, index: usize) -> Option<i32> {
        lock(&self.values).get(index).copied()
    }

    fn check(index: usize, op: &'static str) -> Result<(), IpcError> {
        if index < 3 {
            return Ok(());
        }
        Err(IpcError::Semaphore {
            index,
            op,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })
    }
}

impl Default for LocalSemaphores {
    fn default() -> Self {
        Self::new()
    }
}

impl SemaphoreSet for LocalSemaphores {
    fn wait(&self, index: usize, timeout: Duration) -> Result<bool, IpcError> {
        Self::check(index, "wait")?;
        let deadline = Instant::now() + timeout;
        let mut values = lock(&self.values);
        loop {
            if values[index] > 0 {
                values[index] -= 1;
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            values = wait_timeout(&self.changed, values, remaining);
        }
    }

    fn signal(&self, index: usize) -> Result<(), IpcError> {
        Self::check(index, "signal")?;
        lock(&self.values)[index] += 1;
        self.changed.notify_all();
        Ok(())
    }
}

/// 进程内内存区
pub struct LocalRegion {
    bytes: Mutex<Vec<u8>>,
}

impl LocalRegion {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len]),
        }
    }
}

impl FrameRegion for LocalRegion {
    fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    fn read_into(&self, buf: &mut [u8]) -> Result<(), IpcError> {
        let bytes = lock(&self.bytes);
        if buf.len() != bytes.len() {
            return Err(IpcError::Size {
                expected: bytes.len(),
                actual: buf.len(),
            });
        }
        buf.copy_from_slice(&bytes);
        Ok(())
    }
}

pub type LocalFrameSource = ShmFrameSource<Arc<LocalSemaphores>, Arc<LocalRegion>>;

/// 生产方: 等待空 → 等待互斥 → 写入 → 释放互斥 → 释放满
#[derive(Clone)]
pub struct LocalFrameProducer {
    semaphores: Arc<LocalSemaphores>,
    region: Arc<LocalRegion>,
    layout: FrameLayout,
}

impl LocalFrameProducer {
    /// 写入一帧; 消费方未取走上一帧且超时返回 Ok(false)
    pub fn send(
        &self,
        stamp: Timestamp,
        image: &RgbImage,
        timeout: Duration,
    ) -> Result<bool, IpcError> {
        if !self.semaphores.wait(SEM_EMPTY, timeout)? {
            return Ok(false);
        }
        if !self.semaphores.wait(SEM_MUTEX, timeout)? {
            self.semaphores.signal(SEM_EMPTY)?;
            return Ok(false);
        }
        let written = {
            let mut bytes = lock(&self.region.bytes);
            self.layout.encode(stamp, image, &mut bytes)
        };
        self.semaphores.signal(SEM_MUTEX)?;
        written?;
        self.semaphores.signal(SEM_FULL)?;
        Ok(true)
    }

    pub fn semaphores(&self) -> &Arc<LocalSemaphores> {
        &self.semaphores
    }
}

/// 创建进程内通道 (生产方, 消费方)
pub fn local_frame_channel(
    layout: FrameLayout,
) -> Result<(LocalFrameProducer, LocalFrameSource), IpcError> {
    let semaphores = Arc::new(LocalSemaphores::new());
    let region = Arc::new(LocalRegion::new(layout.total_bytes()));
    let source = ShmFrameSource::new(semaphores.clone(), region.clone(), layout)?;
    let producer = LocalFrameProducer {
        semaphores,
        region,
        layout,
    };
    Ok((producer, source))
}
