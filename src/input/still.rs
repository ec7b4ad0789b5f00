// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 静态图片输入 - 单帧
//!
//! 第一次 `next_frame()` 返回图片,之后始终返回流结束。

use std::path::{Path, PathBuf};

use image::RgbImage;

use super::{FrameSource, SourceKind};
use crate::detection::Frame;
use crate::error::{PipelineError, Result};

pub struct ImageSource {
    path: PathBuf,
    image: Option<RgbImage>,
}

impl ImageSource {
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .map_err(|e| PipelineError::SourceUnavailable(format!("{}: {e}", path.display())))?
            .to_rgb8();
        tracing::info!(
            "🖼️ 图片已加载: {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(Self {
            path: path.to_path_buf(),
            image: Some(image),
        })
    }

    /// 直接用内存中的图像构建 (测试/嵌入使用)
    pub fn from_image(name: impl Into<PathBuf>, image: RgbImage) -> Self {
        Self {
            path: name.into(),
            image: Some(image),
        }
    }
}

impl FrameSource for ImageSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Image
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.image.take().map(|img| Frame::new(img, 0)))
    }

    fn close(&mut self) {
        self.image = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shot_then_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.png");
        RgbImage::from_pixel(6, 4, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let mut src = ImageSource::open(&path).unwrap();
        let frame = src.next_frame().unwrap().unwrap();
        assert_eq!(frame.sequence_number, 0);
        assert_eq!((frame.width(), frame.height()), (6, 4));
        for _ in 0..3 {
            assert!(src.next_frame().unwrap().is_none());
        }
    }

    #[test]
    fn corrupt_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        assert!(matches!(
            ImageSource::open(&path),
            Err(PipelineError::SourceUnavailable(_))
        ));
    }
}
