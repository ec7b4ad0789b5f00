// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测结果标注: 在帧的副本上绘制检测框与标签
//!
//! 每个类别一个固定颜色 (种子 42 的随机调色板),
//! 有字体时绘制 "label 0.87" 文本,没有字体时只画标签底色条。

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::detection::{Detection, DetectionResult, Frame, COCO_CLASSES};
use crate::error::{PipelineError, Result};

const PALETTE_SEED: u64 = 42;
const LABEL_HEIGHT: u32 = 18;

/// 常见系统字体位置
const SYSTEM_FONTS: [&str; 5] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
    "C:\\Windows\\Fonts\\msyh.ttc",
];

#[derive(Clone)]
pub struct Annotator {
    font: Option<FontArc>,
    palette: Vec<Rgb<u8>>,
    thickness: u32,
    scale: PxScale,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}

impl Annotator {
    pub fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(PALETTE_SEED);
        let palette = (0..COCO_CLASSES.len())
            .map(|_| Rgb([rng.gen_range(0..255), rng.gen_range(0..255), rng.gen_range(0..255)]))
            .collect();
        Self {
            font: None,
            palette,
            thickness: 2,
            scale: PxScale::from(16.0),
        }
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    /// 加载字体文件; 未指定时依次尝试常见系统字体
    pub fn with_font_file(self, path: Option<&Path>) -> Self {
        let candidates: Vec<PathBuf> = match path {
            Some(p) => vec![p.to_path_buf()],
            None => SYSTEM_FONTS.iter().map(PathBuf::from).collect(),
        };
        for candidate in candidates {
            match load_font(&candidate) {
                Ok(font) => {
                    tracing::debug!("🔤 标注字体: {}", candidate.display());
                    return self.with_font(font);
                }
                Err(e) if path.is_some() => tracing::warn!("⚠️ 字体加载失败: {}", e),
                Err(_) => {}
            }
        }
        self
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn color_for(&self, class_id: u32) -> Rgb<u8> {
        self.palette[class_id as usize % self.palette.len()]
    }

    /// 生成标注后的新帧 (序号不变)
    pub fn annotate(&self, frame: &Frame, result: &DetectionResult) -> Frame {
        let mut canvas = (*frame.image).clone();
        self.draw(&mut canvas, &result.detections);
        frame.derive(canvas)
    }

    pub fn draw(&self, img: &mut RgbImage, detections: &[Detection]) {
        let (img_w, img_h) = img.dimensions();
        for det in detections {
            let b = det.bbox.clamp_to(img_w, img_h);
            let (x, y) = (b.x.round() as i32, b.y.round() as i32);
            let (w, h) = (b.w.round() as u32, b.h.round() as u32);
            if w == 0 || h == 0 {
                continue;
            }
            let color = self.color_for(det.class_id);

            for offset in 0..self.thickness as i32 {
                let (ow, oh) = (w.saturating_sub(2 * offset as u32), h.saturating_sub(2 * offset as u32));
                if ow == 0 || oh == 0 {
                    break;
                }
                draw_hollow_rect_mut(img, Rect::at(x + offset, y + offset).of_size(ow, oh), color);
            }

            let label = format!("{} {:.2}", det.class_label, det.confidence);
            let text_w = match &self.font {
                Some(font) => text_size(self.scale, font, &label).0 + 4,
                None => (label.len() as u32 * 7).min(w),
            };
            let label_y = if y >= LABEL_HEIGHT as i32 {
                y - LABEL_HEIGHT as i32
            } else {
                y
            };
            draw_filled_rect_mut(
                img,
                Rect::at(x, label_y).of_size(text_w.max(1), LABEL_HEIGHT),
                color,
            );
            if let Some(font) = &self.font {
                draw_text_mut(img, Rgb([255, 255, 255]), x + 2, label_y + 1, self.scale, font, &label);
            }
        }
    }
}

pub fn load_font(path: &Path) -> Result<FontArc> {
    let bytes = std::fs::read(path)?;
    FontArc::try_from_vec(bytes)
        .map_err(|e| PipelineError::InvalidArgument(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Device};
    use std::time::Duration;

    fn result_with(det: Detection) -> DetectionResult {
        DetectionResult {
            source_frame_sequence_number: 3,
            frame_width: 40,
            frame_height: 40,
            detections: vec![det],
            inference_duration: Duration::from_millis(1),
            model_identifier: "yolov8n".to_string(),
            device_used: Device::Cpu,
        }
    }

    #[test]
    fn palette_is_deterministic() {
        let a = Annotator::new();
        let b = Annotator::new();
        for id in [0, 1, 79, 80, 1000] {
            assert_eq!(a.color_for(id), b.color_for(id));
        }
    }

    #[test]
    fn annotation_draws_on_a_copy() {
        let frame = Frame::new(RgbImage::new(40, 40), 3);
        let det = Detection {
            class_id: 2,
            class_label: "car".to_string(),
            confidence: 0.8,
            bbox: BBox::new(10.0, 20.0, 15.0, 10.0),
        };
        let annotator = Annotator::new();
        let out = annotator.annotate(&frame, &result_with(det));

        assert_eq!(out.sequence_number, 3);
        assert_eq!(*out.image.get_pixel(10, 25), annotator.color_for(2));
        // 原帧不变
        assert_eq!(*frame.image.get_pixel(10, 25), Rgb([0, 0, 0]));
    }

    #[test]
    fn degenerate_boxes_are_skipped() {
        let mut img = RgbImage::new(10, 10);
        let det = Detection {
            class_id: 0,
            class_label: "person".to_string(),
            confidence: 0.5,
            bbox: BBox::new(20.0, 20.0, 5.0, 5.0),
        };
        Annotator::new().draw(&mut img, &[det]);
        assert!(img.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }
}
