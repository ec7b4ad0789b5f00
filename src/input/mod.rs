// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频输入系统 (Video Input System)
///
/// 三种可互换的输入源,统一实现 [`FrameSource`]:
/// - ImageSource: 静态图片,单帧 (still)
/// - VideoSource: 视频文件 (GIF 内置解码,其它容器走 FFmpeg)
/// - CameraSource: 本地摄像头 (DirectShow/AVFoundation/V4L2, 需要 ffmpeg 功能)
pub mod still;
pub mod video;

#[cfg(feature = "ffmpeg")]
pub mod camera;
#[cfg(feature = "ffmpeg")]
pub mod decode_filter;
#[cfg(feature = "ffmpeg")]
pub mod decoder;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crossbeam_channel::Sender;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detection::Frame;
use crate::error::{PipelineError, Result};

pub use still::ImageSource;
pub use video::VideoSource;
#[cfg(feature = "ffmpeg")]
pub use camera::{list_cameras, CameraSource};

/// 输入源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    Image,
    Video,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Camera => "camera",
            SourceKind::Image => "image",
            SourceKind::Video => "video",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const IMAGE_EXTS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];
const VIDEO_EXTS: [&str; 7] = ["mp4", "avi", "mov", "mkv", "wmv", "flv", "gif"];

static CAMERA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i:camera|cam|webcam)(?::(\d+))?$|^(\d+)$|^/dev/video(\d+)$")
        .expect("camera descriptor regex")
});
static PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)(image|video):(.+)$").expect("prefix descriptor regex"));

/// 输入源描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    Camera { index: usize },
    Image(PathBuf),
    Video(PathBuf),
}

impl SourceDescriptor {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDescriptor::Camera { .. } => SourceKind::Camera,
            SourceDescriptor::Image(_) => SourceKind::Image,
            SourceDescriptor::Video(_) => SourceKind::Video,
        }
    }

    /// 按扩展名判断文件类型,未知扩展名按图片尝试解码
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ext = extension_of(&path);
        if VIDEO_EXTS.contains(&ext.as_str()) {
            return SourceDescriptor::Video(path);
        }
        if !IMAGE_EXTS.contains(&ext.as_str()) {
            tracing::debug!("未知扩展名 {:?}, 按图片处理: {}", ext, path.display());
        }
        SourceDescriptor::Image(path)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Camera { index } => write!(f, "camera:{index}"),
            SourceDescriptor::Image(p) => write!(f, "image:{}", p.display()),
            SourceDescriptor::Video(p) => write!(f, "video:{}", p.display()),
        }
    }
}

impl FromStr for SourceDescriptor {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PipelineError::InvalidArgument("empty source".to_string()));
        }

        if let Some(caps) = CAMERA_RE.captures(s) {
            let index = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().parse::<usize>())
                .transpose()
                .map_err(|e| PipelineError::InvalidArgument(format!("camera index: {e}")))?
                .unwrap_or(0);
            return Ok(SourceDescriptor::Camera { index });
        }

        if let Some(caps) = PREFIX_RE.captures(s) {
            let path = PathBuf::from(&caps[2]);
            return Ok(match caps[1].to_lowercase().as_str() {
                "video" => SourceDescriptor::Video(path),
                _ => SourceDescriptor::Image(path),
            });
        }

        Ok(SourceDescriptor::from_path(s))
    }
}

/// 输入源选项
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceOptions {
    /// 视频按原始帧率节拍输出 (关闭后尽快解码)
    pub realtime: bool,
    /// 连续读帧失败上限,超过后视为流结束
    pub max_consecutive_capture_errors: u32,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            realtime: true,
            max_consecutive_capture_errors: 30,
        }
    }
}

/// 唤醒阻塞中的 `next_frame()` (stop / switch 时使用)
#[derive(Clone, Default)]
pub struct Interrupter {
    wake: Option<Sender<()>>,
}

impl Interrupter {
    pub fn new(wake: Sender<()>) -> Self {
        Self { wake: Some(wake) }
    }

    /// 不会阻塞的输入源 (例如单张图片) 使用空句柄
    pub fn none() -> Self {
        Self { wake: None }
    }

    pub fn interrupt(&self) {
        if let Some(tx) = &self.wake {
            // 容量为1,已有未处理的唤醒时忽略
            let _ = tx.try_send(());
        }
    }
}

/// 帧输入源
///
/// ```text
/// open → next_frame … next_frame → None (流结束) → close
/// ```
/// `close()` 可以重复调用; Drop 时自动关闭。
pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;

    /// 人类可读的输入源描述 (日志/状态显示)
    fn describe(&self) -> String;

    /// 读取下一帧; `Ok(None)` 表示流结束,之后一直返回 `Ok(None)`
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// 释放设备/文件句柄
    fn close(&mut self);

    /// 跨线程唤醒句柄
    fn interrupter(&self) -> Interrupter {
        Interrupter::none()
    }
}

/// 按描述打开输入源
pub fn open_source(
    descriptor: &SourceDescriptor,
    options: &SourceOptions,
) -> Result<Box<dyn FrameSource>> {
    tracing::info!("📂 打开输入源: {}", descriptor);
    let source: Box<dyn FrameSource> = match descriptor {
        SourceDescriptor::Image(path) => Box::new(ImageSource::open(path)?),
        SourceDescriptor::Video(path) => Box::new(VideoSource::open(path, options)?),
        SourceDescriptor::Camera { index } => open_camera(*index, options)?,
    };
    Ok(source)
}

#[cfg(feature = "ffmpeg")]
fn open_camera(index: usize, options: &SourceOptions) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(CameraSource::open(index, options)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_camera(index: usize, _options: &SourceOptions) -> Result<Box<dyn FrameSource>> {
    Err(PipelineError::SourceUnavailable(format!(
        "camera {index}: built without the ffmpeg feature"
    )))
}
