/// YOLO Krypton - 实时目标检测
///
/// 系统架构:
/// 1. 采集线程: 读帧 + 跳帧决策 (独立工作线程)
/// 2. 推理线程: YOLOv8 目标检测 (独立工作线程)
/// 3. 消费线程: 统计 + 标注 + 输出
/// 4. 主线程:   读取标准输入的控制命令
///
/// 命令: start/switch <source>, pause, resume, stop, snapshot,
/// conf/iou <0..1>, skip <0..5>, device <cpu|gpu>, model <n|s|m|l|x>,
/// export <json|csv|txt|yolo> [path], status, quit
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use yolo_krypton::{
    Annotator, Args, DetectorFactory, LineCommands, LogSink, PipelineConfig, PipelineCoordinator,
    SourceDescriptor,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_thread_names(true)
        .init();

    if args.list_cameras {
        list_cameras();
        return Ok(());
    }

    let mut config = PipelineConfig::load(&args.config);
    config.apply_args(&args);
    config.print_summary();

    let settings = config.coordinator_settings().context("配置无效")?;
    let detector = DetectorFactory::build(&config.detector_spec()?);
    let annotator = Annotator::new().with_font_file(config.font.as_deref());
    if !annotator.has_font() {
        tracing::warn!("⚠️ 未找到标注字体,只绘制检测框");
    }

    tracing::info!("🚀 YOLO Krypton 启动");
    let mut coordinator =
        PipelineCoordinator::new(detector, Box::new(LogSink::default()), settings).with_annotator(annotator);

    if let Some(source) = &args.source {
        let descriptor: SourceDescriptor = source.parse().context("输入源格式错误")?;
        coordinator
            .start(descriptor)
            .with_context(|| format!("无法打开输入源 {source}"))?;
    } else {
        tracing::info!("📭 未指定输入源,等待 start 命令");
    }

    coordinator.serve(Box::new(LineCommands::stdin()), args.exit_on_end)?;

    let status = coordinator.status();
    tracing::info!("📊 {}", status);
    tracing::info!("👋 退出");
    Ok(())
}

#[cfg(feature = "ffmpeg")]
fn list_cameras() {
    let cameras = yolo_krypton::input::list_cameras();
    if cameras.is_empty() {
        tracing::warn!("⚠️ 未找到摄像头");
    }
    for (index, name) in cameras {
        tracing::info!("📷 camera:{} - {}", index, name);
    }
}

#[cfg(not(feature = "ffmpeg"))]
fn list_cameras() {
    tracing::warn!("⚠️ 未启用 ffmpeg 功能,无法枚举摄像头");
}
