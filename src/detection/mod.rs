// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 智能检测系统 (Detection System)
///
/// - types: 帧/检测框/推理结果等数据结构
/// - detector: 检测后端接口 + 工厂
/// - zoo: YOLOv8 n/s/m/l/x 模型档位与模型文件解析
/// - onnx: ONNX Runtime 后端 (feature = "onnx")
pub mod detector;
pub mod labels;
pub mod types;
pub mod zoo;

#[cfg(feature = "onnx")]
pub mod onnx;

pub use detector::{Detector, DetectorFactory, DetectorSpec, PassthroughDetector};
pub use labels::{class_label, COCO_CLASSES};
pub use types::{BBox, Detection, DetectionResult, Device, Frame, InferenceParams};
pub use zoo::{default_models_dir, resolve_model, ModelTier};
