// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 模型库 - YOLOv8 n/s/m/l/x 五个档位
//!
//! 档位只是推理参数的一部分,切换档位在下一帧提交时生效,无需重启流水线。

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use phf::phf_map;

use crate::error::PipelineError;

/// 模型档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    Nano,
    Small,
    Medium,
    Large,
    XLarge,
}

static TIER_ALIASES: phf::Map<&'static str, ModelTier> = phf_map! {
    "n" => ModelTier::Nano,
    "nano" => ModelTier::Nano,
    "yolov8n" => ModelTier::Nano,
    "s" => ModelTier::Small,
    "small" => ModelTier::Small,
    "yolov8s" => ModelTier::Small,
    "m" => ModelTier::Medium,
    "medium" => ModelTier::Medium,
    "yolov8m" => ModelTier::Medium,
    "l" => ModelTier::Large,
    "large" => ModelTier::Large,
    "yolov8l" => ModelTier::Large,
    "x" => ModelTier::XLarge,
    "xlarge" => ModelTier::XLarge,
    "yolov8x" => ModelTier::XLarge,
};

impl ModelTier {
    pub const ALL: [ModelTier; 5] = [
        ModelTier::Nano,
        ModelTier::Small,
        ModelTier::Medium,
        ModelTier::Large,
        ModelTier::XLarge,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            ModelTier::Nano => "n",
            ModelTier::Small => "s",
            ModelTier::Medium => "m",
            ModelTier::Large => "l",
            ModelTier::XLarge => "x",
        }
    }

    /// 模型标识,例如 "yolov8n"
    pub fn identifier(&self) -> String {
        format!("yolov8{}", self.suffix())
    }

    pub fn file_name(&self) -> String {
        format!("{}.onnx", self.identifier())
    }

    /// 界面显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelTier::Nano => "YOLOv8n (Nano - Fastest)",
            ModelTier::Small => "YOLOv8s (Small)",
            ModelTier::Medium => "YOLOv8m (Medium)",
            ModelTier::Large => "YOLOv8l (Large)",
            ModelTier::XLarge => "YOLOv8x (Extra Large - Most Accurate)",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

impl FromStr for ModelTier {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        let key = key.trim_end_matches(".onnx").trim_end_matches(".pt");
        TIER_ALIASES
            .get(key)
            .copied()
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown model tier {s:?}")))
    }
}

/// 默认模型目录: <cache>/yolo-krypton/models,取不到缓存目录时用 ./models
pub fn default_models_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("yolo-krypton").join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}

/// 查找模型文件,不存在且配置了下载地址时自动下载
pub fn resolve_model(tier: ModelTier, models_dir: &Path, base_url: Option<&str>) -> Result<PathBuf> {
    let path = models_dir.join(tier.file_name());
    if path.is_file() {
        return Ok(path);
    }

    let Some(base_url) = base_url else {
        bail!(
            "model {} not found in {} and no download url configured",
            tier.file_name(),
            models_dir.display()
        );
    };

    fs::create_dir_all(models_dir)
        .with_context(|| format!("failed to create models dir {}", models_dir.display()))?;
    let url = format!("{}/{}", base_url.trim_end_matches('/'), tier.file_name());
    tracing::info!("⬇️ 下载模型 {} ...", url);
    download(&url, &path)?;
    tracing::info!("✅ 模型已保存到 {}", path.display());
    Ok(path)
}

fn download(url: &str, dest: &Path) -> Result<()> {
    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("failed to download {url}"))?;

    // 先写临时文件,完成后再改名,避免留下半个模型
    let tmp = dest.with_extension("onnx.part");
    let mut file =
        fs::File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    io::copy(&mut resp.into_reader(), &mut file)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    drop(file);
    fs::rename(&tmp, dest).with_context(|| format!("failed to move model to {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tier_aliases() {
        assert_eq!("n".parse::<ModelTier>().unwrap(), ModelTier::Nano);
        assert_eq!("YOLOv8x.pt".parse::<ModelTier>().unwrap(), ModelTier::XLarge);
        assert_eq!("medium".parse::<ModelTier>().unwrap(), ModelTier::Medium);
        assert!("yolov9c".parse::<ModelTier>().is_err());
    }

    #[test]
    fn identifier_matches_file_name() {
        for tier in ModelTier::ALL {
            assert_eq!(tier.file_name(), format!("{}.onnx", tier.identifier()));
        }
    }

    #[test]
    fn resolve_without_url_fails_for_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_model(ModelTier::Small, dir.path(), None).is_err());

        let path = dir.path().join("yolov8s.onnx");
        fs::write(&path, b"onnx").unwrap();
        assert_eq!(resolve_model(ModelTier::Small, dir.path(), None).unwrap(), path);
    }
}
