//! 共享内存取帧协议
//!
//! 内存布局: `[u64 时间戳 (本机字节序)][原始RGB数据]`
//! 信号量: 0 = 互斥, 1 = 空, 2 = 满
//!
//! 消费方: 等待满 → 等待互斥 → 拷贝 → 释放互斥 → 释放空

use std::io;
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use thiserror::Error;

use super::frame::{Frame, Timestamp};

pub const SEM_MUTEX: usize = 0;
pub const SEM_EMPTY: usize = 1;
pub const SEM_FULL: usize = 2;

/// 时间戳字节数
pub const STAMP_BYTES: usize = std::mem::size_of::<u64>();

/// 取得 "满" 之后等待互斥锁的上限, 超时视为协议错误
const MUTEX_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to derive IPC key from {path}: {source}")]
    Key { path: String, source: io::Error },
    #[error("failed to create {what}: {source}")]
    Create {
        what: &'static str,
        source: io::Error,
    },
    #[error("semaphore {index} {op} failed: {source}")]
    Semaphore {
        index: usize,
        op: &'static str,
        source: io::Error,
    },
    #[error("shared memory mutex not released within {0:?}")]
    MutexTimeout(Duration),
    #[error("region holds {actual} bytes, expected {expected}")]
    Size { expected: usize, actual: usize },
}

/// 三信号量集合
pub trait SemaphoreSet: Send + Sync {
    /// P 操作; 超时返回 Ok(false)
    fn wait(&self, index: usize, timeout: Duration) -> Result<bool, IpcError>;
    /// V 操作
    fn signal(&self, index: usize) -> Result<(), IpcError>;
}

impl<T: SemaphoreSet + ?Sized> SemaphoreSet for Arc<T> {
    fn wait(&self, index: usize, timeout: Duration) -> Result<bool, IpcError> {
        (**self).wait(index, timeout)
    }

    fn signal(&self, index: usize) -> Result<(), IpcError> {
        (**self).signal(index)
    }
}

/// 固定大小共享内存区
pub trait FrameRegion: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 拷贝整个区域到 `buf` (长度必须等于 `len()`)
    fn read_into(&self, buf: &mut [u8]) -> Result<(), IpcError>;
}

impl<T: FrameRegion + ?Sized> FrameRegion for Arc<T> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn read_into(&self, buf: &mut [u8]) -> Result<(), IpcError> {
        (**self).read_into(buf)
    }
}

/// 帧来源
pub trait FrameSource: Send {
    /// 等待下一帧; 超时返回 Ok(None), 协议错误返回 Err
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, IpcError>;
}

/// 图像尺寸与区域大小
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
}

impl FrameLayout {
    pub fn rgb(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn image_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn total_bytes(&self) -> usize {
        STAMP_BYTES + self.image_bytes()
    }

    /// 解析 `[时间戳][图像]`
    pub fn decode(&self, raw: &[u8]) -> Result<Frame, IpcError> {
        if raw.len() != self.total_bytes() {
            return Err(IpcError::Size {
                expected: self.total_bytes(),
                actual: raw.len(),
            });
        }
        let (stamp, pixels) = raw.split_at(STAMP_BYTES);
        let mut stamp_bytes = [0u8; STAMP_BYTES];
        stamp_bytes.copy_from_slice(stamp);
        let image = RgbImage::from_raw(self.width, self.height, pixels.to_vec()).ok_or(
            IpcError::Size {
                expected: self.image_bytes(),
                actual: pixels.len(),
            },
        )?;
        Ok(Frame::new(image, Timestamp(u64::from_ne_bytes(stamp_bytes))))
    }

    /// 编码 `[时间戳][图像]` (生产方使用)
    pub fn encode(
        &self,
        stamp: Timestamp,
        image: &RgbImage,
        out: &mut [u8],
    ) -> Result<(), IpcError> {
        let pixels = image.as_raw();
        if out.len() != self.total_bytes() || pixels.len() != self.image_bytes() {
            return Err(IpcError::Size {
                expected: self.total_bytes(),
                actual: STAMP_BYTES + pixels.len(),
            });
        }
        out[..STAMP_BYTES].copy_from_slice(&stamp.as_nanos().to_ne_bytes());
        out[STAMP_BYTES..].copy_from_slice(pixels);
        Ok(())
    }
}

/// 基于信号量 + 共享内存的帧来源
pub struct ShmFrameSource<S, R> {
    semaphores: S,
    region: R,
    layout: FrameLayout,
    buf: Vec<u8>,
}

impl<S: SemaphoreSet, R: FrameRegion> ShmFrameSource<S, R> {
    pub fn new(semaphores: S, region: R, layout: FrameLayout) -> Result<Self, IpcError> {
        if region.len() < layout.total_bytes() {
            return Err(IpcError::Size {
                expected: layout.total_bytes(),
                actual: region.len(),
            });
        }
        Ok(Self {
            buf: vec![0; region.len()],
            semaphores,
            region,
            layout,
        })
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }
}

impl<S: SemaphoreSet, R: FrameRegion> FrameSource for ShmFrameSource<S, R> {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, IpcError> {
        if !self.semaphores.wait(SEM_FULL, timeout)? {
            return Ok(None);
        }
        if !self.semaphores.wait(SEM_MUTEX, MUTEX_TIMEOUT)? {
            return Err(IpcError::MutexTimeout(MUTEX_TIMEOUT));
        }
        let copied = self.region.read_into(&mut self.buf);
        self.semaphores.signal(SEM_MUTEX)?;
        copied?;
        self.semaphores.signal(SEM_EMPTY)?;

        let total = self.layout.total_bytes();
        self.layout.decode(&self.buf[..total]).map(Some)
    }
}
