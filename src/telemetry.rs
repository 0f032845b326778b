//! 日志初始化与线程创建
//! Tracing setup and dispatcher-aware thread spawning

use std::io;
use std::thread;

use tracing_subscriber::{fmt, EnvFilter};

/// 安装全局 fmt 订阅器, `RUST_LOG` 优先, 否则使用 `default_filter`
///
/// 重复调用无副作用 (测试中多次初始化)
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime())
        .try_init();
}

/// 创建命名线程, 并继承当前线程的 tracing dispatcher
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
