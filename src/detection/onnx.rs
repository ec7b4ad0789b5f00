// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! ONNX Runtime YOLOv8 检测后端
//!
//! 输入: [1, 3, 640, 640] RGB 归一化张量
//! 输出: [1, 4 + nc, 8400] (cx, cy, w, h, 各类别分数)

use std::path::{Path, PathBuf};

use fast_image_resize as fr;
use ndarray::ArrayView2;
use ort::session::Session;
use ort::value::Tensor;

use super::detector::Detector;
use super::labels::class_label;
use super::types::{BBox, Detection, Device, Frame, InferenceParams};
use super::zoo::{self, ModelTier};
use crate::error::{PipelineError, Result};
use crate::non_max_suppression;

/// YOLOv8推理输入尺寸
pub const INF_SIZE: u32 = 640;

fn ort_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::InferenceError(e.to_string())
}

pub struct OnnxDetector {
    session: Session,
    tier: ModelTier,
    // 请求的设备; GPU 不可用时 device 为回退后的 Cpu
    requested_device: Device,
    device: Device,
    models_dir: PathBuf,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
    // 上一次失败的切换目标,避免每帧重复尝试
    failed_switch: Option<(ModelTier, Device)>,
}

impl OnnxDetector {
    pub fn load(path: PathBuf, models_dir: PathBuf, params: &InferenceParams) -> Result<Self> {
        let (session, device) = build_session(&path, params.device)?;
        Ok(Self {
            session,
            tier: params.model,
            requested_device: params.device,
            device,
            models_dir,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (INF_SIZE * INF_SIZE * 3) as usize],
            failed_switch: None,
        })
    }

    /// 模型档位或设备变化时重新加载 (在帧边界上执行,不打断正在进行的推理)
    fn ensure_loaded(&mut self, params: &InferenceParams) {
        let Some(wanted) = reload_target((self.tier, self.requested_device), self.failed_switch, params) else {
            return;
        };

        let reload = zoo::resolve_model(params.model, &self.models_dir, None)
            .map_err(|e| PipelineError::ModelUnavailable(format!("{e:#}")))
            .and_then(|path| build_session(&path, params.device));

        match reload {
            Ok((session, device)) => {
                tracing::info!("🔄 模型切换: {} → {} ({})", self.tier, params.model, device);
                self.session = session;
                self.tier = params.model;
                self.requested_device = params.device;
                self.device = device;
                self.failed_switch = None;
            }
            Err(e) => {
                tracing::warn!("⚠️ 模型切换失败,继续使用 {}: {}", self.tier, e);
                self.failed_switch = Some(wanted);
            }
        }
    }

    fn preprocess(&mut self, frame: &Frame) -> Result<Tensor<f32>> {
        let src = fr::images::ImageRef::new(
            frame.width(),
            frame.height(),
            frame.image.as_raw(),
            fr::PixelType::U8x3,
        )
        .map_err(ort_err)?;

        let mut dst = fr::images::Image::from_vec_u8(
            INF_SIZE,
            INF_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .map_err(ort_err)?;

        let options =
            fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .map_err(ort_err)?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // HWC u8 → NCHW f32
        let size = (INF_SIZE * INF_SIZE) as usize;
        let mut data = vec![0f32; 3 * size];
        for (idx, px) in raw.chunks_exact(3).enumerate() {
            data[idx] = px[0] as f32 / 255.0;
            data[size + idx] = px[1] as f32 / 255.0;
            data[2 * size + idx] = px[2] as f32 / 255.0;
        }

        let shape = [1usize, 3, INF_SIZE as usize, INF_SIZE as usize];
        Tensor::from_array((shape, data.into_boxed_slice())).map_err(ort_err)
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>> {
        self.ensure_loaded(params);

        let input = self.preprocess(frame)?;
        let outputs = self
            .session
            .run(ort::inputs!["images" => input])
            .map_err(ort_err)?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(ort_err)?;
        if shape.len() != 3 {
            return Err(PipelineError::InferenceError(format!(
                "unexpected output rank {}",
                shape.len()
            )));
        }
        let rows = shape[1] as usize; // 4 + nc
        let anchors = shape[2] as usize;
        let preds = ArrayView2::from_shape((rows, anchors), data).map_err(ort_err)?;

        let scale_x = frame.width() as f32 / INF_SIZE as f32;
        let scale_y = frame.height() as f32 / INF_SIZE as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (mut best_class, mut best_score) = (0usize, 0f32);
            for c in 4..rows {
                let s = preds[[c, i]];
                if s > best_score {
                    best_score = s;
                    best_class = c - 4;
                }
            }
            if best_score < params.confidence {
                continue;
            }

            let (cx, cy) = (preds[[0, i]], preds[[1, i]]);
            let (w, h) = (preds[[2, i]], preds[[3, i]]);
            let bbox = BBox::from_xyxy(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            )
            .clamp_to(frame.width(), frame.height());

            candidates.push(Detection {
                class_id: best_class as u32,
                class_label: class_label(best_class as u32),
                confidence: best_score,
                bbox,
            });
        }

        non_max_suppression(&mut candidates, params.iou);
        Ok(candidates)
    }

    fn model_identifier(&self) -> String {
        self.tier.identifier()
    }

    fn active_device(&self) -> Device {
        self.device
    }
}

/// 需要重新加载时返回目标 (档位, 请求设备)
///
/// 与已加载的请求相同或上次切换到该目标失败时返回 None。
fn reload_target(
    loaded: (ModelTier, Device),
    failed_switch: Option<(ModelTier, Device)>,
    params: &InferenceParams,
) -> Option<(ModelTier, Device)> {
    let wanted = (params.model, params.device);
    (wanted != loaded && failed_switch != Some(wanted)).then_some(wanted)
}

/// 构建 ORT 会话; 请求GPU但CUDA不可用时回退到CPU
fn build_session(path: &Path, device: Device) -> Result<(Session, Device)> {
    if device == Device::Gpu {
        match build_gpu_session(path) {
            Ok(s) => return Ok((s, Device::Gpu)),
            Err(e) => tracing::warn!("⚠️ GPU会话创建失败,回退到CPU: {}", e),
        }
    }

    let session = Session::builder()
        .map_err(ort_err)?
        .with_intra_threads(4)
        .map_err(ort_err)?
        .commit_from_file(path)
        .map_err(|e| PipelineError::ModelUnavailable(format!("{}: {e}", path.display())))?;
    Ok((session, Device::Cpu))
}

#[cfg(feature = "cuda")]
fn build_gpu_session(path: &Path) -> Result<Session> {
    use ort::execution_providers::CUDAExecutionProvider;

    Session::builder()
        .map_err(ort_err)?
        .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])
        .map_err(ort_err)?
        .commit_from_file(path)
        .map_err(ort_err)
}

#[cfg(not(feature = "cuda"))]
fn build_gpu_session(_path: &Path) -> Result<Session> {
    Err(PipelineError::ModelUnavailable(
        "built without the cuda feature".to_string(),
    ))
}
