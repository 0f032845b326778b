/// 线程同步原语
///
/// - CancelToken: 取消令牌, 取消时唤醒所有已注册的等待者
/// - Trigger:     单槽任务触发器, 任务本身即触发标志
/// - TaskGroup:   命名线程组, 统一取消与回收
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::VisionError;
use crate::telemetry;

/// 加锁, 忽略中毒 (持锁线程 panic 后数据仍然可用)
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

pub fn wait_timeout<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match cv.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

// ========== 取消令牌 ==========

/// 可被取消令牌唤醒的阻塞点
///
/// 实现者须先获取自身条件变量对应的锁再 `notify_all`,
/// 这样等待方在锁内检查取消标志时不会丢失唤醒.
pub trait Wake: Send + Sync {
    fn wake(&self);
}

struct CancelInner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Weak<dyn Wake>>>,
}

impl CancelInner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let wakers = std::mem::take(&mut *lock(&self.wakers));
        for waker in wakers.iter().filter_map(Weak::upgrade) {
            waker.wake();
        }
    }
}

impl Wake for CancelInner {
    fn wake(&self) {
        self.cancel();
    }
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// 注册唤醒者, 令牌已取消时立即唤醒
    pub fn register<W: Wake + 'static>(&self, waker: &Arc<W>) {
        let weak: Weak<dyn Wake> = Arc::downgrade(waker) as Weak<dyn Wake>;
        self.register_weak(weak);
        if self.is_cancelled() {
            waker.wake();
        }
    }

    fn register_weak(&self, weak: Weak<dyn Wake>) {
        let mut wakers = lock(&self.inner.wakers);
        wakers.retain(|w| w.strong_count() > 0);
        wakers.push(weak);
    }

    /// 子令牌: 父令牌取消时一并取消, 子令牌取消不影响父令牌
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        self.register(&child.inner);
        child
    }
}

// ========== 触发器 ==========

/// 单槽触发器
///
/// 槽位非空即表示已触发; 工作线程取走任务时清除.
/// 槽位未被消费前不会被再次填充.
pub struct Trigger<J> {
    slot: Mutex<Option<J>>,
    ready: Condvar,
}

impl<J> Default for Trigger<J> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }
}

impl<J> Trigger<J> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入任务并唤醒工作线程; 上一个任务尚未取走时跳过, 返回 false
    ///
    /// `before` 在触发器锁内、任务可见之前执行, 用于递增完成计数.
    pub fn fire_with(&self, job: J, before: impl FnOnce()) -> bool {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return false;
        }
        before();
        *slot = Some(job);
        self.ready.notify_one();
        true
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// 阻塞直到取得任务; 令牌取消时返回 None
    pub fn wait(&self, cancel: &CancelToken) -> Option<J> {
        let mut slot = lock(&self.slot);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(job) = slot.take() {
                return Some(job);
            }
            slot = wait(&self.ready, slot);
        }
    }
}

impl<J: Send> Wake for Trigger<J> {
    fn wake(&self) {
        let _slot = lock(&self.slot);
        self.ready.notify_all();
    }
}

// ========== 线程组 ==========

/// 命名线程组, 关闭时取消令牌并回收全部线程
pub struct TaskGroup {
    token: CancelToken,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskGroup {
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn spawn<F>(&self, name: &str, f: F) -> Result<(), VisionError>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let token = self.token.clone();
        let handle = telemetry::spawn_thread(name, move || f(token)).map_err(|source| {
            VisionError::Spawn {
                name: name.to_string(),
                source,
            }
        })?;
        lock(&self.handles).push((name.to_string(), handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取消并等待全部线程退出
    pub fn shutdown(&self) {
        self.token.cancel();
        let handles = std::mem::take(&mut *lock(&self.handles));
        for (name, handle) in handles {
            match handle.join() {
                Ok(()) => debug!("线程 {} 已回收", name),
                Err(_) => error!("❌ 线程 {} panic 退出", name),
            }
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_trigger_skips_when_pending() {
        let trigger = Trigger::new();
        let mut fired = 0;
        assert!(trigger.fire_with(1u64, || fired += 1));
        assert!(!trigger.fire_with(2u64, || fired += 1));
        assert_eq!(fired, 1);
        assert!(trigger.is_pending());

        let token = CancelToken::new();
        assert_eq!(trigger.wait(&token), Some(1));
        assert!(!trigger.is_pending());
        assert!(trigger.fire_with(3u64, || fired += 1));
        assert_eq!(fired, 2);
    }

    #[test]
    fn test_cancel_wakes_trigger_waiter() {
        let trigger = Arc::new(Trigger::<u64>::new());
        let token = CancelToken::new();
        token.register(&trigger);

        let waiter = {
            let trigger = trigger.clone();
            let token = token.clone();
            thread::spawn(move || trigger.wait(&token))
        };
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        token.cancel();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_register_after_cancel_wakes_immediately() {
        let trigger = Arc::new(Trigger::<u64>::new());
        let token = CancelToken::new();
        token.cancel();
        token.register(&trigger);
        assert_eq!(trigger.wait(&token), None);
    }

    #[test]
    fn test_child_token() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_task_group_shutdown_joins() {
        let group = TaskGroup::new(CancelToken::new());
        let trigger = Arc::new(Trigger::<u64>::new());
        group.token().register(&trigger);
        for i in 0..3 {
            let trigger = trigger.clone();
            group
                .spawn(&format!("waiter-{}", i), move |token| {
                    while trigger.wait(&token).is_some() {}
                })
                .unwrap();
        }
        assert_eq!(group.len(), 3);
        group.shutdown();
        assert!(group.is_empty());
    }
}
