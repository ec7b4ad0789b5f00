// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod annotate; // 检测框标注
pub mod command; // 控制命令
pub mod config; // 命令行与配置文件
pub mod detection; // 智能检测系统
pub mod error; // 流水线错误
pub mod export; // 结果导出
pub mod input; // 视频输入系统
pub mod pipeline; // 帧处理流水线
pub mod sink; // 渲染输出

use std::cmp::Ordering;

pub use crate::annotate::Annotator;
pub use crate::command::{parse_command, Command, CommandSource, LineCommands};
pub use crate::config::{Args, PipelineConfig};
pub use crate::detection::{
    BBox, Detection, DetectionResult, Detector, DetectorFactory, Device, Frame, InferenceParams, ModelTier,
};
pub use crate::error::{PipelineError, Result};
pub use crate::export::ExportFormat;
pub use crate::input::{open_source, FrameSource, SourceDescriptor, SourceKind, SourceOptions};
pub use crate::pipeline::{
    Completion, CoordinatorSettings, PipelineCoordinator, PipelineState, PipelineStatus, Session, Statistics,
};
pub use crate::sink::{ChannelSink, FrameSink, LogSink, SinkEvent};

/// 单帧最多保留的检测数
pub const MAX_DETECTIONS: usize = 300;

/// 按类别做非极大值抑制,结果按置信度降序
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id != xs[index].class_id {
                continue;
            }
            let iou = xs[prev_index].bbox.iou(&xs[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
            if current_index == MAX_DETECTIONS {
                break;
            }
        }
    }
    xs.truncate(current_index);
}

/// 本地时间字符串,例如 `gen_time_string("_")` → 20250101_120000_123
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!("%Y%m%d{delimiter}%H%M%S{delimiter}%3f");
    chrono::Local::now().format(&fmt).to_string()
}
