// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测系统数据结构定义
/// Data structures for the detection pipeline
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::zoo::ModelTier;
use crate::error::PipelineError;

// ========== 数据结构 ==========

/// 视频帧 (输入源 → 跳帧控制 → 推理线程 → 渲染)
///
/// 像素数据用Arc共享,帧一旦产生就不可变;
/// 标注会生成一个新的帧 (序号不变)。
#[derive(Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    pub sequence_number: u64, // 会话内严格递增
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence_number: u64) -> Self {
        Self {
            image: Arc::new(image),
            sequence_number,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// 用新像素生成同序号的帧 (标注/缩放)
    pub fn derive(&self, image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
            sequence_number: self.sequence_number,
            captured_at: self.captured_at,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.sequence_number)
            .field("size", &format_args!("{}x{}", self.width(), self.height()))
            .finish()
    }
}

/// 检测框 (x, y, w, h),源帧像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            w: (x2 - x1).max(0.0),
            h: (y2 - y1).max(0.0),
        }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.w
    }

    pub fn y2(&self) -> f32 {
        self.y + self.h
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let l = self.x.max(other.x);
        let r = self.x2().min(other.x2());
        let t = self.y.max(other.y);
        let b = self.y2().min(other.y2());
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// 裁剪到图像范围内
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self::from_xyxy(
            self.x.clamp(0.0, w),
            self.y.clamp(0.0, h),
            self.x2().clamp(0.0, w),
            self.y2().clamp(0.0, h),
        )
    }
}

/// 单个检测目标
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub class_label: String,
    pub confidence: f32, // [0, 1]
    pub bbox: BBox,
}

/// 推理结果 (推理线程 → 统计 + 渲染)
///
/// detections 保持后端输出顺序,不重新排序。
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub source_frame_sequence_number: u64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub detections: Vec<Detection>,
    pub inference_duration: Duration,
    pub model_identifier: String,
    pub device_used: Device,
}

impl DetectionResult {
    pub fn object_count(&self) -> usize {
        self.detections.len()
    }
}

// ========== 枚举类型 ==========

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    /// "Auto": 编译了 CUDA 支持时优先 GPU
    pub fn auto() -> Self {
        if cfg!(feature = "cuda") {
            Device::Gpu
        } else {
            Device::Cpu
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Device {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu),
            "auto" => Ok(Device::auto()),
            other => Err(PipelineError::InvalidArgument(format!(
                "unknown device {other:?} (cpu/gpu/auto)"
            ))),
        }
    }
}

/// 推理参数 (提交时读取,下一帧生效)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub confidence: f32,
    pub iou: f32,
    pub device: Device,
    pub model: ModelTier,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            iou: 0.45,
            device: Device::auto(),
            model: ModelTier::Nano,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BBox::new(10.0, 10.0, 20.0, 20.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(50.0, 50.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn clamp_keeps_box_inside_frame() {
        let b = BBox::from_xyxy(-5.0, 10.0, 120.0, 50.0).clamp_to(100, 40);
        assert_eq!(b, BBox::new(0.0, 10.0, 100.0, 30.0));
    }

    #[test]
    fn device_parses_aliases() {
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Gpu);
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn derived_frame_keeps_sequence_number() {
        let frame = Frame::new(RgbImage::new(4, 2), 7);
        let derived = frame.derive(RgbImage::new(2, 1));
        assert_eq!(derived.sequence_number, 7);
        assert_eq!((derived.width(), derived.height()), (2, 1));
    }
}
