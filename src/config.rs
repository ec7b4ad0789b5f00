// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 运行配置 - 命令行参数 + JSON 配置文件
//!
//! 优先级: 命令行 > 配置文件 > 默认值。
//! 配置文件不存在时写出默认配置,解析失败时使用默认值。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::detection::{default_models_dir, Device, DetectorSpec, InferenceParams, ModelTier};
use crate::input::SourceOptions;
use crate::pipeline::{CoordinatorSettings, DEFAULT_HISTORY_CAP, MAX_SKIP_LEVEL};

/// YOLO Krypton 参数
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "YOLO Krypton - 实时目标检测流水线", long_about = None)]
pub struct Args {
    /// 输入源: camera[:N] / 图片路径 / 视频路径 (不指定时等待 start 命令)
    #[arg(short, long)]
    pub source: Option<String>,

    /// 配置文件 (JSON)
    #[arg(short, long, default_value = "krypton.json")]
    pub config: PathBuf,

    /// 置信度阈值 [0, 1]
    #[arg(long)]
    pub conf: Option<f32>,

    /// NMS IoU 阈值 [0, 1]
    #[arg(long)]
    pub iou: Option<f32>,

    /// 跳帧级别 0-5
    #[arg(long)]
    pub skip: Option<u8>,

    /// 推理设备: cpu / gpu / auto
    #[arg(short, long)]
    pub device: Option<String>,

    /// 检测模型 (n/s/m/l/x)
    #[arg(short, long)]
    pub model: Option<String>,

    /// 模型目录
    #[arg(long)]
    pub models_dir: Option<PathBuf>,

    /// 模型下载地址 (缺少模型文件时从 <url>/yolov8?.onnx 下载)
    #[arg(long)]
    pub model_url: Option<String>,

    /// 快照/导出目录
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// 标注字体 (TTF)
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// 视频尽快解码,不按原始帧率输出
    #[arg(long)]
    pub no_realtime: bool,

    /// 输入流结束后退出
    #[arg(long)]
    pub exit_on_end: bool,

    /// 列出摄像头后退出
    #[arg(long)]
    pub list_cameras: bool,

    /// 输出调试日志
    #[arg(short, long)]
    pub verbose: bool,
}

/// 流水线配置 (JSON)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 检测参数 ===
    pub confidence: f32,    // 置信度阈值
    pub iou: f32,           // NMS IoU 阈值
    pub skip_level: u8,     // 跳帧级别 0-5
    pub model: String,      // 模型档位 n/s/m/l/x
    pub device: String,     // cpu / gpu / auto
    pub models_dir: PathBuf,
    pub model_base_url: Option<String>,

    // === 输入 ===
    pub realtime: bool,                      // 视频按原始帧率输出
    pub max_consecutive_capture_errors: u32, // 连续读帧失败上限

    // === 输出 ===
    pub output_dir: PathBuf,
    pub history_cap: usize, // 导出保留的结果条数
    pub preview_capacity: usize,
    pub font: Option<PathBuf>,

    // === 显示 (图形界面消费者使用) ===
    pub display_width: u32,
    pub display_height: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            iou: 0.45,
            skip_level: 0,
            model: "n".to_string(),
            device: "auto".to_string(),
            models_dir: default_models_dir(),
            model_base_url: None,

            realtime: true,
            max_consecutive_capture_errors: 30,

            output_dir: PathBuf::from("output"),
            history_cap: DEFAULT_HISTORY_CAP,
            preview_capacity: 16,
            font: None,

            display_width: 1280,
            display_height: 720,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    tracing::info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("⚠️ 配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    tracing::warn!("⚠️ {:#}", e);
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("创建目录 {} 失败", parent.display()))?;
        }
        fs::write(path, json).with_context(|| format!("保存配置到 {} 失败", path.display()))?;
        tracing::info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    /// 命令行参数覆盖配置文件
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(v) = args.conf {
            self.confidence = v;
        }
        if let Some(v) = args.iou {
            self.iou = v;
        }
        if let Some(v) = args.skip {
            self.skip_level = v;
        }
        if let Some(v) = &args.device {
            self.device = v.clone();
        }
        if let Some(v) = &args.model {
            self.model = v.clone();
        }
        if let Some(v) = &args.models_dir {
            self.models_dir = v.clone();
        }
        if let Some(v) = &args.model_url {
            self.model_base_url = Some(v.clone());
        }
        if let Some(v) = &args.output_dir {
            self.output_dir = v.clone();
        }
        if let Some(v) = &args.font {
            self.font = Some(v.clone());
        }
        if args.no_realtime {
            self.realtime = false;
        }
    }

    /// 校验并转换为推理参数
    pub fn inference_params(&self) -> anyhow::Result<InferenceParams> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.confidence),
            "confidence must be within [0, 1], got {}",
            self.confidence
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.iou),
            "iou must be within [0, 1], got {}",
            self.iou
        );
        let device: Device = self.device.parse().context("invalid device")?;
        let model: ModelTier = self.model.parse().context("invalid model")?;
        Ok(InferenceParams {
            confidence: self.confidence,
            iou: self.iou,
            device,
            model,
        })
    }

    pub fn coordinator_settings(&self) -> anyhow::Result<CoordinatorSettings> {
        if self.skip_level > MAX_SKIP_LEVEL {
            tracing::warn!("⚠️ 跳帧级别 {} 超出范围,截断为 {}", self.skip_level, MAX_SKIP_LEVEL);
        }
        Ok(CoordinatorSettings {
            params: self.inference_params()?,
            skip_level: self.skip_level.min(MAX_SKIP_LEVEL),
            source_options: SourceOptions {
                realtime: self.realtime,
                max_consecutive_capture_errors: self.max_consecutive_capture_errors.max(1),
            },
            history_cap: self.history_cap.max(1),
            output_dir: self.output_dir.clone(),
            preview_capacity: self.preview_capacity.max(1),
        })
    }

    pub fn detector_spec(&self) -> anyhow::Result<DetectorSpec> {
        Ok(DetectorSpec {
            models_dir: self.models_dir.clone(),
            model_base_url: self.model_base_url.clone(),
            params: self.inference_params()?,
        })
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        tracing::info!("🎛️ 当前配置:");
        tracing::info!("  模型: yolov8{} ({})", self.model, self.device);
        tracing::info!("  置信度: {:.2} | IoU: {:.2} | 跳帧: {}", self.confidence, self.iou, self.skip_level);
        tracing::info!("  模型目录: {}", self.models_dir.display());
        tracing::info!("  输出目录: {}", self.output_dir.display());
        tracing::info!("  显示尺寸: {}x{}", self.display_width, self.display_height);
    }
}
