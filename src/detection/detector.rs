// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测器接口 (Detector)
//! 职责: 帧 + 阈值 + 设备 → 检测结果列表
//!
//! 推理后端对流水线是不透明的: 流水线只依赖 [`Detector`] trait。
//! 模型档位/设备作为参数随每一帧传入,后端自行决定何时重新加载。

use std::path::PathBuf;

use super::types::{Detection, Device, Frame, InferenceParams};
use super::zoo::{self, ModelTier};
use crate::error::Result;

/// 统一的检测后端接口
///
/// ## 核心流程
/// ```text
/// Frame + InferenceParams → detect → Vec<Detection>
/// ```
///
/// 同一时刻只会有一个推理在执行 (由 InferenceWorker 保证),
/// 因此实现无需考虑并发调用。
pub trait Detector: Send {
    /// 对一帧执行检测,输出保持后端顺序
    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>>;

    /// 当前加载的模型标识 (例如 "yolov8n")
    fn model_identifier(&self) -> String;

    /// 上一次推理实际使用的设备 (GPU不可用时可能回退到CPU)
    fn active_device(&self) -> Device;
}

/// 空检测器: 没有可用模型时使用,始终返回空结果
///
/// 让流水线在无模型时仍可预览/导出,不会因模型缺失崩溃。
pub struct PassthroughDetector {
    tier: ModelTier,
    device: Device,
    warned: bool,
}

impl PassthroughDetector {
    pub fn new(tier: ModelTier) -> Self {
        Self {
            tier,
            device: Device::Cpu,
            warned: false,
        }
    }
}

impl Detector for PassthroughDetector {
    fn detect(&mut self, _frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>> {
        if !self.warned {
            tracing::warn!("⚠️ 未加载检测模型,所有帧将返回空结果");
            self.warned = true;
        }
        self.tier = params.model;
        Ok(Vec::new())
    }

    fn model_identifier(&self) -> String {
        format!("{}-passthrough", self.tier.identifier())
    }

    fn active_device(&self) -> Device {
        self.device
    }
}

/// 检测器构建参数
#[derive(Debug, Clone)]
pub struct DetectorSpec {
    pub models_dir: PathBuf,
    pub model_base_url: Option<String>,
    pub params: InferenceParams,
}

/// 检测器工厂: 优先加载 ONNX 模型,失败时回退到空检测器
pub struct DetectorFactory;

impl DetectorFactory {
    pub fn build(spec: &DetectorSpec) -> Box<dyn Detector> {
        tracing::info!(
            "🔍 加载检测模型: {} (设备: {})",
            spec.params.model.display_name(),
            spec.params.device
        );

        let path = match zoo::resolve_model(
            spec.params.model,
            &spec.models_dir,
            spec.model_base_url.as_deref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("⚠️ 模型不可用: {:#}, 使用空检测器", e);
                return Box::new(PassthroughDetector::new(spec.params.model));
            }
        };

        Self::load_onnx(path, spec)
    }

    #[cfg(feature = "onnx")]
    fn load_onnx(path: PathBuf, spec: &DetectorSpec) -> Box<dyn Detector> {
        match super::onnx::OnnxDetector::load(path, spec.models_dir.clone(), &spec.params) {
            Ok(d) => {
                tracing::info!("✅ YOLOv8 检测模型加载成功");
                Box::new(d)
            }
            Err(e) => {
                tracing::error!("❌ YOLOv8 模型加载失败: {}", e);
                Box::new(PassthroughDetector::new(spec.params.model))
            }
        }
    }

    #[cfg(not(feature = "onnx"))]
    fn load_onnx(path: PathBuf, spec: &DetectorSpec) -> Box<dyn Detector> {
        tracing::warn!(
            "⚠️ 未启用 onnx 功能,无法加载 {}, 使用空检测器",
            path.display()
        );
        Box::new(PassthroughDetector::new(spec.params.model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn factory_falls_back_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let spec = DetectorSpec {
            models_dir: dir.path().to_path_buf(),
            model_base_url: None,
            params: InferenceParams::default(),
        };
        let mut detector = DetectorFactory::build(&spec);
        let frame = Frame::new(RgbImage::new(8, 8), 0);
        let out = detector.detect(&frame, &spec.params).unwrap();
        assert!(out.is_empty());
        assert!(detector.model_identifier().starts_with("yolov8n"));
    }
}
