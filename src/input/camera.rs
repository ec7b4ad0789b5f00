// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 摄像头输入模块
//!
//! 处理本地摄像头输入,支持 DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux)
//! 设备在会话期间独占; 消费者落后时丢弃最旧的帧。

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use super::decoder::{FfmpegStream, StreamInput};
use super::{FrameSource, Interrupter, SourceKind, SourceOptions};
use crate::detection::Frame;
use crate::error::Result;

const MAX_OPEN_RETRIES: u32 = 3;

pub struct CameraSource {
    index: usize,
    name: String,
    stream: Option<FfmpegStream>,
    next_seq: u64,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl CameraSource {
    pub fn open(index: usize, _options: &SourceOptions) -> Result<Self> {
        let devices = list_cameras();
        let name = devices
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, n)| n.clone())
            .unwrap_or_else(|| format!("camera {index}"));

        let input = StreamInput::Camera {
            url: format_camera_url(index, &name),
            format: camera_format(),
        };
        tracing::info!("📷 打开摄像头 [{}] {} ({:?})", index, name, input);

        let mut retry_count = 0;
        let stream = loop {
            match FfmpegStream::spawn(input.clone()) {
                Ok(s) => break s,
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= MAX_OPEN_RETRIES {
                        tracing::error!("❌ 摄像头打开失败 (重试{}次): {}", MAX_OPEN_RETRIES, e);
                        return Err(e);
                    }
                    tracing::warn!(
                        "⚠️ 摄像头忙或无法打开, 1秒后重试... ({}/{})",
                        retry_count,
                        MAX_OPEN_RETRIES
                    );
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        };

        let (wake_tx, wake_rx) = bounded(1);
        Ok(Self {
            index,
            name,
            stream: Some(stream),
            next_seq: 0,
            wake_tx,
            wake_rx,
        })
    }
}

impl FrameSource for CameraSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Camera
    }

    fn describe(&self) -> String {
        format!("[{}] {}", self.index, self.name)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match stream.next(&self.wake_rx)? {
            Some(image) => {
                let frame = Frame::new(image, self.next_seq);
                self.next_seq += 1;
                Ok(Some(frame))
            }
            None => {
                // 解码线程退出 (设备拔出等) 视为流结束
                self.close();
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        // 部分初始化时 stream 为 None,直接跳过
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            tracing::info!("📷 摄像头已释放: {}", self.name);
        }
    }

    fn interrupter(&self) -> Interrupter {
        Interrupter::new(self.wake_tx.clone())
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// 格式化摄像头URL - 根据平台选择
fn format_camera_url(index: usize, name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("video={}", name)
    } else if cfg!(target_os = "linux") {
        format!("/dev/video{}", index)
    } else {
        index.to_string()
    }
}

fn camera_format() -> &'static str {
    if cfg!(target_os = "windows") {
        "dshow" // DirectShow
    } else if cfg!(target_os = "macos") {
        "avfoundation" // AVFoundation
    } else {
        "v4l2" // Video4Linux2
    }
}

/// 获取可用的摄像头设备列表
pub fn list_cameras() -> Vec<(usize, String)> {
    let started = Instant::now();
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => {
            tracing::debug!(
                "🔍 找到 {} 个视频设备 ({:?})",
                devices.len(),
                started.elapsed()
            );
            devices.into_iter().enumerate().collect()
        }
        Err(e) => {
            tracing::warn!("⚠️ 获取摄像头列表失败: {}", e);
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_url_is_platform_specific() {
        let url = format_camera_url(1, "USB Cam");
        if cfg!(target_os = "windows") {
            assert_eq!(url, "video=USB Cam");
        } else if cfg!(target_os = "linux") {
            assert_eq!(url, "/dev/video1");
        } else {
            assert_eq!(url, "1");
        }
    }
}
