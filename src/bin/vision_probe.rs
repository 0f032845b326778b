use clap::Parser;
/// 共享内存取帧探针
/// Attach to the frame channel, report ingest rate and optionally dump frames
///
/// 主程序入口 - 直接运行: cargo run --bin vision-probe --release
use std::path::PathBuf;

/// 共享内存取帧探针
#[derive(Parser, Debug)]
#[command(author, version, about = "视觉管理器共享内存取帧探针", long_about = None)]
struct Args {
    /// JSON 配置文件 (缺省使用默认配置)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖图像宽度
    #[arg(long)]
    width: Option<u32>,

    /// 覆盖图像高度
    #[arg(long)]
    height: Option<u32>,

    /// 采集帧数, 0 表示一直运行
    #[arg(short, long, default_value_t = 0)]
    frames: u64,

    /// 每隔 N 帧保存一张 PNG 到该目录
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// 保存间隔
    #[arg(long, default_value_t = 100)]
    dump_every: u64,

    /// 日志级别
    #[arg(long, default_value = "info")]
    log: String,
}

/// 第 1 帧起每 `every` 帧保存一次, `count` 从 1 计数
fn should_dump(count: u64, every: u64) -> bool {
    every > 0 && count > 0 && (count - 1) % every == 0
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    use std::time::{Duration, Instant};

    use anyhow::Context;
    use tracing::{info, warn};
    use vision_manager_rs::input::sysv::open_shared_frame_source;
    use vision_manager_rs::input::FrameSource;
    use vision_manager_rs::{gen_time_string, telemetry, VisionConfig};

    let args = Args::parse();
    telemetry::init(&args.log);

    let mut config = match &args.config {
        Some(path) => VisionConfig::load(path)?,
        None => VisionConfig::default(),
    };
    if let Some(width) = args.width {
        config.image_width = width;
    }
    if let Some(height) = args.height {
        config.image_height = height;
    }
    if let Some(dir) = &args.dump_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("创建目录 {}", dir.display()))?;
    }

    let mut source =
        open_shared_frame_source(&config, false).context("附加到共享内存通道失败")?;
    info!(
        "📷 已附加: {}x{}, 等待帧...",
        config.image_width, config.image_height
    );

    let mut count = 0u64;
    let mut window = 0u64;
    let mut last = Instant::now();
    let mut last_stamp = None;
    while args.frames == 0 || count < args.frames {
        let Some(frame) = source.next_frame(config.ingest_poll())? else {
            continue;
        };
        count += 1;
        window += 1;

        if let Some(prev) = last_stamp {
            if frame.stamp <= prev {
                warn!("⚠️  时间戳未递增: {:?} → {:?}", prev, frame.stamp);
            }
        }
        last_stamp = Some(frame.stamp);

        if let Some(dir) = &args.dump_dir {
            if should_dump(count, args.dump_every) {
                let path = dir.join(format!("{}.png", gen_time_string("-")));
                match frame.image.save(&path) {
                    Ok(()) => info!("💾 已保存 {}", path.display()),
                    Err(e) => warn!("⚠️  保存失败 {}: {}", path.display(), e),
                }
            }
        }

        if last.elapsed() >= Duration::from_secs(1) {
            info!(
                "📥 FPS: {:.1} | 共 {} 帧 | 时间戳 {:.3}s",
                window as f64 / last.elapsed().as_secs_f64(),
                count,
                frame.stamp.as_secs_f64()
            );
            window = 0;
            last = Instant::now();
        }
    }
    info!("✅ 完成, 共 {} 帧", count);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() -> anyhow::Result<()> {
    let _ = Args::parse();
    anyhow::bail!("System V 共享内存仅支持 Linux")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_dump() {
        assert!((1..=5).all(|n| should_dump(n, 1)));
        let picked: Vec<u64> = (1..=10).filter(|&n| should_dump(n, 3)).collect();
        assert_eq!(picked, vec![1, 4, 7, 10]);
        assert!(!should_dump(1, 0));
    }
}
