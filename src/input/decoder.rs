// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// FFmpeg 解码线程 (视频文件 / 摄像头共用)
///
/// 解码线程把 rgb24 帧推入有界通道; 消费端用 `select!` 同时等待帧与唤醒信号。
/// 解码中途出错时通道里送一条 `Err`,之后通道关闭。
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, RecvError, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use image::RgbImage;

use super::decode_filter::DecodeFilter;
use crate::error::{PipelineError, Result};

/// 等待 FFmpeg 打开输入的时间上限
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// close() 等待解码线程退出的时间上限
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
/// 解码线程检查停止标志的间隔
const STOP_POLL: Duration = Duration::from_millis(20);

/// 解码线程送出的一帧; Err 为 FFmpeg 中途失败的原因
pub type Decoded = std::result::Result<RgbImage, String>;

/// 解码输入
#[derive(Debug, Clone)]
pub enum StreamInput {
    /// 视频文件; realtime 时按原始速率读取
    File { path: PathBuf, realtime: bool },
    /// 摄像头设备 (url 按平台格式化, format 为 dshow/avfoundation/v4l2)
    Camera { url: String, format: &'static str },
}

impl StreamInput {
    fn label(&self) -> String {
        match self {
            StreamInput::File { path, .. } => path.display().to_string(),
            StreamInput::Camera { url, format } => format!("{format}:{url}"),
        }
    }

    // 文件: 阻塞推送,不丢帧; 摄像头: 只保留最新的少量帧
    fn capacity(&self) -> usize {
        match self {
            StreamInput::File { .. } => 4,
            StreamInput::Camera { .. } => 2,
        }
    }

    fn build_input(&self) -> Input {
        match self {
            StreamInput::File { path, realtime } => {
                let input = Input::new(path.to_string_lossy().to_string());
                if *realtime {
                    input.set_readrate(1.0)
                } else {
                    input
                }
            }
            StreamInput::Camera { url, format } => Input::new(url.as_str())
                .set_format(*format)
                .set_input_opts([("framerate", "30"), ("video_size", "1280x720")].into()),
        }
    }
}

/// 运行中的解码线程
pub struct FfmpegStream {
    input: StreamInput,
    frames: Receiver<Decoded>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FfmpegStream {
    /// 启动解码线程,等待 FFmpeg 成功打开输入后返回
    pub fn spawn(input: StreamInput) -> Result<Self> {
        let (tx, rx) = bounded(input.capacity());
        let stop = Arc::new(AtomicBool::new(false));
        let drain = matches!(input, StreamInput::Camera { .. }).then(|| rx.clone());
        let filter = DecodeFilter::new(tx.clone(), drain, Arc::clone(&stop));

        let (ready_tx, ready_rx) = bounded(1);
        let thread_input = input.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("ffmpeg-decode".to_string())
            .spawn(move || run_decoder(thread_input, filter, tx, thread_stop, ready_tx))
            .map_err(|e| PipelineError::SourceUnavailable(format!("spawn decoder: {e}")))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                tracing::info!("✅ FFmpeg 解码启动: {}", input.label());
                Ok(Self {
                    input,
                    frames: rx,
                    stop,
                    handle: Some(handle),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(PipelineError::SourceUnavailable(format!("{}: {e}", input.label())))
            }
            Err(_) => {
                stop.store(true, Ordering::Release);
                Err(PipelineError::SourceUnavailable(format!(
                    "{}: timed out opening input",
                    input.label()
                )))
            }
        }
    }

    /// 阻塞等待下一帧; 解码结束或被唤醒时返回 None,解码失败返回 CaptureError
    pub fn next(&mut self, wake: &Receiver<()>) -> Result<Option<RgbImage>> {
        select! {
            recv(self.frames) -> msg => unpack(msg),
            recv(wake) -> _ => Ok(None),
        }
    }

    /// 从头重新解码
    pub fn restart(&mut self) -> Result<()> {
        self.close();
        *self = Self::spawn(self.input.clone())?;
        Ok(())
    }

    /// 停止解码并等待解码线程释放输入 (最多 CLOSE_TIMEOUT)
    ///
    /// 返回 false 表示解码线程没有按时退出。
    pub fn close(&mut self) -> bool {
        self.stop.store(true, Ordering::Release);
        // 释放接收端: 阻塞在 send 上的解码线程会立即退出
        let (_, closed) = bounded(0);
        self.frames = closed;
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + CLOSE_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("⚠️ 解码线程未按时退出: {}", self.input.label());
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            tracing::error!("❌ 解码线程异常退出: {}", self.input.label());
        }
        true
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn unpack(msg: std::result::Result<Decoded, RecvError>) -> Result<Option<RgbImage>> {
    match msg {
        Ok(Ok(image)) => Ok(Some(image)),
        Ok(Err(e)) => Err(PipelineError::CaptureError(e)),
        Err(_) => Ok(None),
    }
}

fn run_decoder(
    input: StreamInput,
    filter: DecodeFilter,
    frames: Sender<Decoded>,
    stop: Arc<AtomicBool>,
    ready: Sender<std::result::Result<(), String>>,
) {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let ctx = match FfmpegContext::builder()
        .input(input.build_input())
        .filter_desc("format=rgb24")
        .output(out)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            let _ = ready.send(Err(format!("构建失败: {e}")));
            return;
        }
    };

    let sch = match ctx.start() {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(format!("启动失败: {e}")));
            return;
        }
    };

    let _ = ready.send(Ok(()));

    // 摄像头可能长时间不出帧,停止时主动中止调度器
    while !sch.is_ended() {
        if stop.load(Ordering::Acquire) {
            sch.abort();
            break;
        }
        thread::sleep(STOP_POLL);
    }

    match sch.wait() {
        Err(e) if !stop.load(Ordering::Acquire) => {
            tracing::warn!("⚠️ 解码失败: {}: {}", input.label(), e);
            let _ = frames.send(Err(e.to_string()));
        }
        _ => tracing::debug!("📹 解码循环结束: {}", input.label()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Rgba, RgbaImage};

    #[test]
    fn mid_stream_failure_becomes_capture_error() {
        assert!(matches!(unpack(Ok(Ok(RgbImage::new(2, 2)))), Ok(Some(_))));
        assert!(matches!(
            unpack(Ok(Err("invalid data found".to_string()))),
            Err(PipelineError::CaptureError(_))
        ));
        assert!(matches!(unpack(Err(RecvError)), Ok(None)));
    }

    #[test]
    fn close_joins_the_decoder_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.gif");
        let mut encoder = GifEncoder::new(std::fs::File::create(&path).unwrap());
        for i in 0..50u8 {
            let buf = RgbaImage::from_pixel(16, 16, Rgba([i.wrapping_mul(5), 0, 0, 255]));
            encoder
                .encode_frame(image::Frame::from_parts(buf, 0, 0, Delay::from_numer_denom_ms(40, 1)))
                .unwrap();
        }
        drop(encoder);

        let mut stream = FfmpegStream::spawn(StreamInput::File { path, realtime: true }).unwrap();
        let (_wake_tx, wake_rx) = bounded(1);
        assert!(stream.next(&wake_rx).unwrap().is_some());

        assert!(stream.close());
        assert!(stream.handle.is_none());
        assert!(stream.next(&wake_rx).unwrap().is_none());
        assert!(stream.close());
    }
}
