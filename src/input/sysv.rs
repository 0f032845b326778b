//! System V 共享内存 + 信号量 (Linux)

use std::ffi::CString;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use libc::{c_int, c_void, key_t};
use tracing::{debug, info, warn};

use super::channel::{FrameRegion, IpcError, SemaphoreSet, ShmFrameSource};
use crate::config::VisionConfig;

/// 非阻塞 semop 轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// 由路径和 proj id 生成 IPC key
pub fn ipc_key(path: &str, proj_id: u8) -> Result<key_t, IpcError> {
    let c_path = CString::new(path).map_err(|e| IpcError::Key {
        path: path.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;
    // SAFETY: c_path 是以 NUL 结尾的有效字符串
    let key = unsafe { libc::ftok(c_path.as_ptr(), proj_id as c_int) };
    if key == -1 {
        return Err(IpcError::Key {
            path: path.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(key)
}

// ========== 信号量 ==========

pub struct SysvSemaphores {
    id: c_int,
    owner: bool,
}

impl SysvSemaphores {
    /// 打开信号量组; `create` 为真时创建并初始化为 互斥=1, 空=1, 满=0
    pub fn open(key: key_t, create: bool) -> Result<Self, IpcError> {
        let flags = if create { libc::IPC_CREAT | 0o666 } else { 0o666 };
        // SAFETY: 纯系统调用, 无指针参数
        let id = unsafe { libc::semget(key, 3, flags) };
        if id == -1 {
            return Err(IpcError::Create {
                what: "semaphore set",
                source: io::Error::last_os_error(),
            });
        }
        // 创建方在 Drop 时删除信号量组, 初始化失败也会经 Drop 回收
        let semaphores = Self { id, owner: create };
        if create {
            for (index, value) in [1, 1, 0].into_iter().enumerate() {
                semaphores.set_value(index, value)?;
            }
        }
        Ok(semaphores)
    }

    fn set_value(&self, index: usize, value: c_int) -> Result<(), IpcError> {
        // SAFETY: SETVAL 的可变参数为 int
        let rc = unsafe { libc::semctl(self.id, index as c_int, libc::SETVAL, value) };
        if rc == -1 {
            return Err(IpcError::Semaphore {
                index,
                op: "init",
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn op(&self, index: usize, delta: i16, nowait: bool) -> io::Result<()> {
        let mut op = libc::sembuf {
            sem_num: index as u16,
            sem_op: delta,
            sem_flg: if nowait { libc::IPC_NOWAIT as i16 } else { 0 },
        };
        // SAFETY: op 在调用期间有效, 数量为1
        let rc = unsafe { libc::semop(self.id, &mut op, 1) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for SysvSemaphores {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        // SAFETY: IPC_RMID 不使用可变参数
        if unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) } == -1 {
            warn!("⚠️  删除信号量组失败: {}", io::Error::last_os_error());
        } else {
            debug!("信号量组 {} 已删除", self.id);
        }
    }
}

impl SemaphoreSet for SysvSemaphores {
    fn wait(&self, index: usize, timeout: Duration) -> Result<bool, IpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.op(index, -1, true) {
                Ok(()) => return Ok(true),
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(source) => {
                    return Err(IpcError::Semaphore {
                        index,
                        op: "wait",
                        source,
                    })
                }
            }
        }
    }

    fn signal(&self, index: usize) -> Result<(), IpcError> {
        self.op(index, 1, false).map_err(|source| IpcError::Semaphore {
            index,
            op: "signal",
            source,
        })
    }
}

// ========== 共享内存 ==========

pub struct SysvSharedMemory {
    id: c_int,
    addr: *mut c_void,
    len: usize,
    owner: bool,
}

// SAFETY: 映射在 Drop 前一直有效, 只做整块拷贝读取, 并发由信号量保护
unsafe impl Send for SysvSharedMemory {}
unsafe impl Sync for SysvSharedMemory {}

impl SysvSharedMemory {
    pub fn open(key: key_t, len: usize, create: bool) -> Result<Self, IpcError> {
        let flags = if create { libc::IPC_CREAT | 0o666 } else { 0o666 };
        // SAFETY: 纯系统调用
        let id = unsafe { libc::shmget(key, len, flags) };
        if id == -1 {
            return Err(IpcError::Create {
                what: "shared memory",
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: id 有效, 由内核选择映射地址
        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            let source = io::Error::last_os_error();
            if create {
                // SAFETY: IPC_RMID 不使用 buf 参数
                unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
            }
            return Err(IpcError::Create {
                what: "shared memory mapping",
                source,
            });
        }
        Ok(Self {
            id,
            addr,
            len,
            owner: create,
        })
    }
}

impl FrameRegion for SysvSharedMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn read_into(&self, buf: &mut [u8]) -> Result<(), IpcError> {
        if buf.len() != self.len {
            return Err(IpcError::Size {
                expected: self.len,
                actual: buf.len(),
            });
        }
        // SAFETY: 映射长度为 len, buf 长度已校验, 两者不重叠
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr as *const u8, buf.as_mut_ptr(), self.len);
        }
        Ok(())
    }
}

impl Drop for SysvSharedMemory {
    fn drop(&mut self) {
        // SAFETY: addr 由 shmat 返回且只解除一次
        if unsafe { libc::shmdt(self.addr) } == -1 {
            warn!("⚠️  shmdt 失败: {}", io::Error::last_os_error());
        }
        if self.owner {
            // SAFETY: IPC_RMID 不使用 buf 参数
            if unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
                warn!("⚠️  删除共享内存失败: {}", io::Error::last_os_error());
            } else {
                debug!("共享内存 {} 已标记删除", self.id);
            }
        }
    }
}

pub type SysvFrameSource = ShmFrameSource<SysvSemaphores, SysvSharedMemory>;

/// 建立共享内存取帧通道
///
/// `create` 为真时创建并初始化 (视觉管理器), 否则仅附加到已有通道.
/// 创建方释放时删除共享内存与信号量组.
pub fn open_shared_frame_source(
    config: &VisionConfig,
    create: bool,
) -> Result<SysvFrameSource, IpcError> {
    let layout = config.frame_layout();
    let path = config.ipc_key_path.to_string_lossy();
    let shm_key = ipc_key(&path, config.shm_proj_id)?;
    let sem_key = ipc_key(&path, config.sem_proj_id)?;

    let region = SysvSharedMemory::open(shm_key, layout.total_bytes(), create)?;
    let semaphores = SysvSemaphores::open(sem_key, create)?;
    info!(
        "✅ 共享内存通道就绪: {}x{}, {} 字节",
        layout.width,
        layout.height,
        layout.total_bytes()
    );
    ShmFrameSource::new(semaphores, region, layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::channel::{FrameSource, SEM_EMPTY, SEM_FULL, SEM_MUTEX};
    use crate::input::frame::Timestamp;
    use image::{Rgb, RgbImage};
    use std::fs::File;
    use std::path::PathBuf;

    /// ftok 需要一个存在的路径
    struct KeyFile(PathBuf);

    impl KeyFile {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "vision-sysv-{}-{}",
                tag,
                std::process::id()
            ));
            File::create(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for KeyFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn config(key_file: &KeyFile) -> VisionConfig {
        VisionConfig {
            image_width: 8,
            image_height: 6,
            ipc_key_path: key_file.0.clone(),
            shm_proj_id: b'v',
            sem_proj_id: b'w',
            ..VisionConfig::default()
        }
    }

    #[test]
    fn test_frame_roundtrip_and_owner_cleanup() {
        let key_file = KeyFile::new("roundtrip");
        let config = config(&key_file);
        let layout = config.frame_layout();
        let path = key_file.0.to_string_lossy().into_owned();
        let shm_key = ipc_key(&path, config.shm_proj_id).unwrap();
        let sem_key = ipc_key(&path, config.sem_proj_id).unwrap();

        let mut source = open_shared_frame_source(&config, true).unwrap();
        {
            // 生产方附加到同一通道
            let sems = SysvSemaphores::open(sem_key, false).unwrap();
            let region = SysvSharedMemory::open(shm_key, layout.total_bytes(), false).unwrap();

            assert!(sems.wait(SEM_EMPTY, Duration::from_millis(100)).unwrap());
            assert!(sems.wait(SEM_MUTEX, Duration::from_millis(100)).unwrap());
            let image = RgbImage::from_pixel(8, 6, Rgb([10, 20, 30]));
            let mut buf = vec![0; layout.total_bytes()];
            layout.encode(Timestamp(42), &image, &mut buf).unwrap();
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), region.addr as *mut u8, buf.len());
            }
            sems.signal(SEM_MUTEX).unwrap();
            sems.signal(SEM_FULL).unwrap();

            let frame = source.next_frame(Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(frame.stamp, Timestamp(42));
            assert_eq!(frame.image.get_pixel(7, 5), &Rgb([10, 20, 30]));

            // 消费后空槽位归还, 满槽位清零
            assert!(sems.wait(SEM_EMPTY, Duration::ZERO).unwrap());
            assert!(!sems.wait(SEM_FULL, Duration::ZERO).unwrap());
            assert!(source.next_frame(Duration::from_millis(5)).unwrap().is_none());
        }

        // 附加方释放不影响通道
        assert!(SysvSemaphores::open(sem_key, false).is_ok());

        drop(source);
        assert!(SysvSemaphores::open(sem_key, false).is_err());
        assert!(SysvSharedMemory::open(shm_key, layout.total_bytes(), false).is_err());
    }
}
