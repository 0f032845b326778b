/// 帧输入系统 (Frame Input System)
///
/// 独立取帧线程, 负责从生产进程接收图像
/// - ShmFrameSource:  三信号量 + 共享内存协议
/// - sysv:            System V 实现 (Linux)
/// - local:           进程内实现
/// - LatestFrameCell: 最新帧槽位
pub mod channel;
pub mod frame;
pub mod ingest;
pub mod local;
#[cfg(target_os = "linux")]
pub mod sysv;

pub use channel::{FrameLayout, FrameRegion, FrameSource, IpcError, SemaphoreSet, ShmFrameSource};
pub use frame::{Frame, LatestFrameCell, Timestamp};
pub use ingest::{run_ingestion, SharedFrameSource};
pub use local::{local_frame_channel, LocalFrameProducer, LocalFrameSource};
