// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 视频文件输入
//!
//! - GIF: `image` 内置解码,打开时解码全部帧,回放确定、可重放
//! - 其它容器 (mp4/avi/mov/mkv/...): FFmpeg 解码线程 (feature = "ffmpeg")
//!
//! 开启 realtime 时按原始帧间隔节拍输出; 流结束只报告一次,之后一直是流结束。

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, RgbImage};

use super::{FrameSource, Interrupter, SourceKind, SourceOptions};
use crate::detection::Frame;
use crate::error::{PipelineError, Result};

/// GIF 帧间隔为0时使用的默认间隔 (与浏览器行为一致)
const DEFAULT_GIF_DELAY: Duration = Duration::from_millis(100);

/// 预解码的 GIF 动画
struct GifClip {
    frames: Vec<(Arc<RgbImage>, Duration)>,
    cursor: usize,
}

impl GifClip {
    fn decode(path: &Path) -> Result<Self> {
        let unavailable = |e: &dyn std::fmt::Display| {
            PipelineError::SourceUnavailable(format!("{}: {e}", path.display()))
        };

        let file = File::open(path).map_err(|e| unavailable(&e))?;
        let decoder = GifDecoder::new(BufReader::new(file)).map_err(|e| unavailable(&e))?;
        let frames = decoder
            .into_frames()
            .collect_frames()
            .map_err(|e| unavailable(&e))?;

        if frames.is_empty() {
            return Err(unavailable(&"animation has no frames"));
        }

        let frames = frames
            .into_iter()
            .map(|f| {
                let (numer, denom) = f.delay().numer_denom_ms();
                let delay = Duration::from_micros(numer as u64 * 1000 / denom.max(1) as u64);
                let delay = if delay.is_zero() {
                    DEFAULT_GIF_DELAY
                } else {
                    delay
                };
                let rgb = DynamicImage::ImageRgba8(f.into_buffer()).to_rgb8();
                (Arc::new(rgb), delay)
            })
            .collect();

        Ok(Self { frames, cursor: 0 })
    }
}

enum Backend {
    Gif(GifClip),
    #[cfg(feature = "ffmpeg")]
    Ffmpeg(super::decoder::FfmpegStream),
}

pub struct VideoSource {
    path: PathBuf,
    backend: Backend,
    realtime: bool,
    next_seq: u64,
    next_due: Option<Instant>,
    ended: bool,
    closed: bool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl VideoSource {
    pub fn open(path: &Path, options: &SourceOptions) -> Result<Self> {
        let backend = Self::open_backend(path, options)?;
        let (wake_tx, wake_rx) = bounded(1);

        if let Backend::Gif(clip) = &backend {
            tracing::info!("🎞️ GIF 已解码: {} ({} 帧)", path.display(), clip.frames.len());
        }

        Ok(Self {
            path: path.to_path_buf(),
            backend,
            realtime: options.realtime,
            next_seq: 0,
            next_due: None,
            ended: false,
            closed: false,
            wake_tx,
            wake_rx,
        })
    }

    fn open_backend(path: &Path, options: &SourceOptions) -> Result<Backend> {
        let is_gif = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("gif"));
        if is_gif {
            return Ok(Backend::Gif(GifClip::decode(path)?));
        }
        Self::open_ffmpeg(path, options)
    }

    #[cfg(feature = "ffmpeg")]
    fn open_ffmpeg(path: &Path, options: &SourceOptions) -> Result<Backend> {
        if !path.is_file() {
            return Err(PipelineError::SourceUnavailable(format!(
                "{}: no such file",
                path.display()
            )));
        }
        let stream = super::decoder::FfmpegStream::spawn(super::decoder::StreamInput::File {
            path: path.to_path_buf(),
            realtime: options.realtime,
        })?;
        Ok(Backend::Ffmpeg(stream))
    }

    #[cfg(not(feature = "ffmpeg"))]
    fn open_ffmpeg(path: &Path, _options: &SourceOptions) -> Result<Backend> {
        Err(PipelineError::SourceUnavailable(format!(
            "{}: only GIF video is supported without the ffmpeg feature",
            path.display()
        )))
    }

    /// 回到第一帧,重放与首次播放相同的帧序列 (序号继续递增)
    pub fn rewind(&mut self) -> Result<()> {
        if self.closed {
            return Err(PipelineError::InvalidState("video source is closed".to_string()));
        }
        match &mut self.backend {
            Backend::Gif(clip) => clip.cursor = 0,
            #[cfg(feature = "ffmpeg")]
            Backend::Ffmpeg(stream) => stream.restart()?,
        }
        while self.wake_rx.try_recv().is_ok() {}
        self.next_due = None;
        self.ended = false;
        Ok(())
    }

    /// 节拍等待; 被唤醒时返回 false
    fn wait_until_due(&mut self) -> bool {
        let Some(due) = self.next_due else {
            return true;
        };
        let now = Instant::now();
        if due <= now {
            return true;
        }
        !matches!(
            self.wake_rx.recv_timeout(due - now),
            Ok(()) | Err(RecvTimeoutError::Disconnected)
        )
    }

    fn end_of_stream(&mut self) -> Result<Option<Frame>> {
        if !self.ended {
            tracing::info!("🏁 视频结束: {} (共 {} 帧)", self.path.display(), self.next_seq);
            self.ended = true;
        }
        Ok(None)
    }
}

impl FrameSource for VideoSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Video
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.ended || self.closed {
            return Ok(None);
        }

        let image = match &mut self.backend {
            Backend::Gif(clip) => {
                let Some((image, delay)) = clip.frames.get(clip.cursor).cloned() else {
                    return self.end_of_stream();
                };
                if self.realtime && !self.wait_until_due() {
                    return self.end_of_stream();
                }
                if let Backend::Gif(clip) = &mut self.backend {
                    clip.cursor += 1;
                }
                self.next_due = Some(Instant::now() + delay);
                image
            }
            #[cfg(feature = "ffmpeg")]
            Backend::Ffmpeg(stream) => match stream.next(&self.wake_rx)? {
                Some(image) => Arc::new(image),
                None => return self.end_of_stream(),
            },
        };

        let frame = Frame {
            image,
            sequence_number: self.next_seq,
            captured_at: Instant::now(),
        };
        self.next_seq += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        #[cfg(feature = "ffmpeg")]
        if let Backend::Ffmpeg(stream) = &mut self.backend {
            stream.close();
        }
        tracing::debug!("📕 视频源已关闭: {}", self.path.display());
    }

    fn interrupter(&self) -> Interrupter {
        Interrupter::new(self.wake_tx.clone())
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.close();
    }
}
