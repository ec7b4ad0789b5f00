// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
///
/// 解码线程中运行: AVFrame (rgb24) → RgbImage → 有界通道
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame as AvFrame};
use image::RgbImage;

use super::decoder::Decoded;

/// 单边最大分辨率
const MAX_DIM: u32 = 8192;

/// FFmpeg解码过滤器: 解码帧 → RGB帧通道
pub struct DecodeFilter {
    tx: Sender<Decoded>,
    // 设置后通道满时丢弃最旧帧 (摄像头),否则阻塞等待消费者 (视频文件)
    drain: Option<Receiver<Decoded>>,
    stop: Arc<AtomicBool>,
    pub count: usize,
    pub last: Instant,
    pub current_fps: f64,
    pub dropped_frames: usize,
    pub total_frames: usize,
}

impl DecodeFilter {
    pub fn new(tx: Sender<Decoded>, drain: Option<Receiver<Decoded>>, stop: Arc<AtomicBool>) -> Self {
        Self {
            tx,
            drain,
            stop,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
            dropped_frames: 0,
            total_frames: 0,
        }
    }

    fn skip(&mut self, reason: std::fmt::Arguments<'_>) -> Result<Option<AvFrame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            tracing::warn!("⚠️ 丢弃帧 #{}: {}", self.total_frames, reason);
        }
        Ok(None)
    }

    /// 推送到通道; 接收端关闭时返回 false
    fn push(&mut self, image: RgbImage) -> bool {
        match &self.drain {
            Some(drain) => {
                let mut pending = Ok(image);
                loop {
                    match self.tx.try_send(pending) {
                        Ok(()) => return true,
                        Err(TrySendError::Full(back)) => {
                            // 消费者落后: 丢弃最旧的一帧
                            if drain.try_recv().is_ok() {
                                self.dropped_frames += 1;
                            }
                            pending = back;
                        }
                        Err(TrySendError::Disconnected(_)) => return false,
                    }
                }
            }
            None => self.tx.send(Ok(image)).is_ok(),
        }
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        tracing::debug!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: AvFrame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<AvFrame>, String> {
        // 输入源已关闭则停止解码
        if self.stop.load(Ordering::Acquire) {
            return Err("source closed".to_string());
        }

        self.total_frames += 1;

        // SAFETY: 指针非空已检查; 只读取 FFmpeg 填好的 AVFrame 字段和 rgb24 平面
        let image = unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                return self.skip(format_args!("空帧/损坏帧"));
            }

            let av = &*frame.as_ptr();
            let (w, h) = (av.width as u32, av.height as u32);
            if w == 0 || h == 0 || w > MAX_DIM || h > MAX_DIM {
                return self.skip(format_args!("非法分辨率 {}x{}", w, h));
            }

            // 只丢弃严重错误的帧 (缺少参考帧、无效比特流)
            if av.decode_error_flags & 0x03 != 0 {
                return self.skip(format_args!("解码错误标志=0x{:02x}", av.decode_error_flags));
            }

            let plane = av.data[0];
            let stride = av.linesize[0] as usize;
            let row_bytes = w as usize * 3;
            if plane.is_null() || stride < row_bytes {
                return self.skip(format_args!("RGB平面异常 stride={}", stride));
            }

            let mut buf = Vec::with_capacity(row_bytes * h as usize);
            for y in 0..h as usize {
                let row = std::slice::from_raw_parts(plane.add(y * stride), row_bytes);
                buf.extend_from_slice(row);
            }
            match RgbImage::from_raw(w, h, buf) {
                Some(img) => img,
                None => return self.skip(format_args!("缓冲区尺寸不匹配")),
            }
        };

        self.count += 1;
        if self.last.elapsed().as_secs_f64() >= 1.0 {
            let elapsed = self.last.elapsed().as_secs_f64();
            self.current_fps = self.count as f64 / elapsed;
            let drop_rate = self.dropped_frames as f64 / self.total_frames as f64 * 100.0;
            tracing::debug!(
                "📺 解码统计: 解码{}帧 | 实际{:.1}fps | 总帧{} | 丢弃{} ({:.1}%)",
                self.count,
                self.current_fps,
                self.total_frames,
                self.dropped_frames,
                drop_rate
            );
            self.last = Instant::now();
            self.count = 0;
        }

        if !self.push(image) {
            return Err("frame receiver dropped".to_string());
        }
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        tracing::debug!(
            "✅ 解码线程退出 (总帧 {}, 丢弃 {})",
            self.total_frames,
            self.dropped_frames
        );
    }
}
