// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 渲染输出 (FrameSink)
//!
//! 每一帧原始画面都以 `None` 送达一次; 推理过的帧额外以标注后的画面 + 结果送达。
//! 致命错误通过 `on_failure` 只报告一次。

use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};

use crate::detection::{DetectionResult, Frame};
use crate::error::PipelineError;

pub trait FrameSink: Send {
    fn render(&mut self, frame: &Frame, result: Option<&DetectionResult>);

    fn on_failure(&mut self, error: &PipelineError) {
        tracing::error!("❌ 流水线终止: {}", error);
    }
}

/// 日志输出: 每秒打印一次帧率和最近的检测
pub struct LogSink {
    frames: u64,
    results: u64,
    last: Instant,
}

impl Default for LogSink {
    fn default() -> Self {
        Self {
            frames: 0,
            results: 0,
            last: Instant::now(),
        }
    }
}

impl FrameSink for LogSink {
    fn render(&mut self, frame: &Frame, result: Option<&DetectionResult>) {
        let Some(result) = result else {
            self.frames += 1;
            return;
        };
        self.results += 1;

        if !result.detections.is_empty() {
            let labels: Vec<String> = result
                .detections
                .iter()
                .map(|d| format!("{} {:.2}", d.class_label, d.confidence))
                .collect();
            tracing::debug!("🎯 #{} {}", frame.sequence_number, labels.join(", "));
        }

        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            tracing::info!(
                "📊 预览 {:.1}fps | 推理 {:.1}fps | {} 个目标 | {:.1}ms ({})",
                self.frames as f64 / elapsed,
                self.results as f64 / elapsed,
                result.object_count(),
                result.inference_duration.as_secs_f64() * 1000.0,
                result.device_used
            );
            self.frames = 0;
            self.results = 0;
            self.last = Instant::now();
        }
    }
}

/// 渲染事件 (ChannelSink 输出)
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Raw(Frame),
    Annotated(Frame, DetectionResult),
    Failure(PipelineError),
}

/// 把渲染事件转发到通道 (供界面线程或测试消费); 通道满时丢弃
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(tx: Sender<SinkEvent>) -> Self {
        Self { tx, dropped: 0 }
    }

    fn forward(&mut self, event: SinkEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped.is_power_of_two() {
                    tracing::warn!("⚠️ 渲染通道已满,已丢弃 {} 个事件", self.dropped);
                }
            }
        }
    }
}

impl FrameSink for ChannelSink {
    fn render(&mut self, frame: &Frame, result: Option<&DetectionResult>) {
        let event = match result {
            Some(r) => SinkEvent::Annotated(frame.clone(), r.clone()),
            None => SinkEvent::Raw(frame.clone()),
        };
        self.forward(event);
    }

    fn on_failure(&mut self, error: &PipelineError) {
        self.forward(SinkEvent::Failure(error.clone()));
    }
}
