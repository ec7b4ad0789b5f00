// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 结果导出 (ExportFormatter)
//!
//! `format` 是纯函数: 统计 + 推理结果 → 字节; 文件写入由 `write_export` 负责,
//! 先写临时文件再改名,失败时不会留下半个文件。

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::ImageFormat;
use serde_json::json;

use crate::detection::{DetectionResult, Frame};
use crate::error::{PipelineError, Result};
use crate::gen_time_string;
use crate::pipeline::Statistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Txt,
    Yolo,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 4] = [
        ExportFormat::Json,
        ExportFormat::Csv,
        ExportFormat::Txt,
        ExportFormat::Yolo,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Txt | ExportFormat::Yolo => "txt",
        }
    }

    /// 默认文件名,例如 detections_20250101_120000.json / labels_....txt
    pub fn default_file_name(&self) -> String {
        let stem = match self {
            ExportFormat::Yolo => "labels",
            _ => "detections",
        };
        format!("{}_{}.{}", stem, gen_time_string("_"), self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "txt" | "text" => Ok(ExportFormat::Txt),
            "yolo" => Ok(ExportFormat::Yolo),
            _ => Err(PipelineError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// 序列化统计与推理结果
pub fn format(stats: &Statistics, results: &[DetectionResult], kind: ExportFormat) -> Result<Vec<u8>> {
    let text = match kind {
        ExportFormat::Json => format_json(stats, results)?,
        ExportFormat::Csv => format_csv(results),
        ExportFormat::Txt => format_txt(stats, results),
        ExportFormat::Yolo => format_yolo(results)?,
    };
    Ok(text.into_bytes())
}

fn format_json(stats: &Statistics, results: &[DetectionResult]) -> Result<String> {
    let frames: Vec<_> = results
        .iter()
        .map(|r| {
            let objects: Vec<_> = r
                .detections
                .iter()
                .map(|d| {
                    let (cx, cy) = d.bbox.center();
                    json!({
                        "class_id": d.class_id,
                        "class_name": d.class_label,
                        "confidence": d.confidence,
                        "bbox": [d.bbox.x, d.bbox.y, d.bbox.x2(), d.bbox.y2()],
                        "center": [cx, cy],
                    })
                })
                .collect();
            json!({
                "frame": r.source_frame_sequence_number,
                "width": r.frame_width,
                "height": r.frame_height,
                "model": r.model_identifier,
                "device": r.device_used,
                "inference_ms": r.inference_duration.as_secs_f64() * 1000.0,
                "objects": objects,
            })
        })
        .collect();

    let doc = json!({
        "statistics": {
            "frames_processed": stats.frame_count,
            "total_objects": stats.total_objects,
            "unique_classes": stats.unique_classes(),
            "class_counts": stats.per_class_counts,
            "average_confidence": stats.average_confidence(),
            "min_confidence": stats.min_confidence,
            "max_confidence": stats.max_confidence,
            "processing_time_ms": stats.elapsed_processing_time.as_secs_f64() * 1000.0,
        },
        "detections": frames,
    });
    serde_json::to_string_pretty(&doc).map_err(|e| PipelineError::Io(e.to_string()))
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn format_csv(results: &[DetectionResult]) -> String {
    let mut out = String::from("frame,class_id,class_name,confidence,x1,y1,x2,y2,center_x,center_y\n");
    for r in results {
        for d in &r.detections {
            let (cx, cy) = d.bbox.center();
            let _ = writeln!(
                out,
                "{},{},{},{:.4},{:.1},{:.1},{:.1},{:.1},{:.1},{:.1}",
                r.source_frame_sequence_number,
                d.class_id,
                csv_field(&d.class_label),
                d.confidence,
                d.bbox.x,
                d.bbox.y,
                d.bbox.x2(),
                d.bbox.y2(),
                cx,
                cy
            );
        }
    }
    out
}

fn format_txt(stats: &Statistics, results: &[DetectionResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "YOLO Krypton Detection Report");
    let _ = writeln!(out, "=============================");
    let _ = writeln!(out, "Frames processed: {}", stats.frame_count);
    let _ = writeln!(out, "Total objects: {}", stats.total_objects);
    let _ = writeln!(out, "Unique classes: {}", stats.unique_classes());
    let _ = writeln!(out, "Average confidence: {:.3}", stats.average_confidence());
    if let (Some(min), Some(max)) = (stats.min_confidence, stats.max_confidence) {
        let _ = writeln!(out, "Confidence range: {:.3} - {:.3}", min, max);
    }
    let _ = writeln!(
        out,
        "Average inference: {:.1} ms",
        stats.average_inference_time().as_secs_f64() * 1000.0
    );

    let _ = writeln!(out, "\nClass distribution:");
    for (label, count) in &stats.per_class_counts {
        let _ = writeln!(out, "  {}: {}", label, count);
    }

    let _ = writeln!(out, "\nDetections:");
    for r in results {
        let _ = writeln!(out, "[frame {}]", r.source_frame_sequence_number);
        for d in &r.detections {
            let _ = writeln!(
                out,
                "  {}: {:.2} at [{:.1}, {:.1}, {:.1}, {:.1}]",
                d.class_label,
                d.confidence,
                d.bbox.x,
                d.bbox.y,
                d.bbox.x2(),
                d.bbox.y2()
            );
        }
    }
    out
}

fn format_yolo(results: &[DetectionResult]) -> Result<String> {
    let mut out = String::new();
    for r in results {
        if r.frame_width == 0 || r.frame_height == 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "frame {} has no dimensions",
                r.source_frame_sequence_number
            )));
        }
        let (fw, fh) = (r.frame_width as f64, r.frame_height as f64);
        for d in &r.detections {
            let (cx, cy) = d.bbox.center();
            let _ = writeln!(
                out,
                "{} {:.6} {:.6} {:.6} {:.6}",
                d.class_id,
                cx as f64 / fw,
                cy as f64 / fh,
                d.bbox.w as f64 / fw,
                d.bbox.h as f64 / fh
            );
        }
    }
    Ok(out)
}

/// 原子写入: 同目录临时文件 → 改名
pub fn write_export(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::InvalidArgument(format!("bad export path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    if let Err(e) = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    tracing::info!("💾 已导出 {} ({} 字节)", path.display(), bytes.len());
    Ok(())
}

/// 保存快照: <dir>/snapshot_<时间>.jpg
pub fn save_snapshot(frame: &Frame, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("snapshot_{}.jpg", gen_time_string("_")));
    frame.image.save_with_format(&path, ImageFormat::Jpeg)?;
    tracing::info!("📸 快照已保存: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Detection, Device};
    use crate::pipeline::StatisticsAggregator;
    use std::time::Duration;

    fn sample() -> (Statistics, Vec<DetectionResult>) {
        let results = vec![
            DetectionResult {
                source_frame_sequence_number: 0,
                frame_width: 640,
                frame_height: 480,
                detections: vec![
                    Detection {
                        class_id: 0,
                        class_label: "person".to_string(),
                        confidence: 0.91,
                        bbox: BBox::new(12.5, 40.0, 100.25, 200.0),
                    },
                    Detection {
                        class_id: 2,
                        class_label: "car".to_string(),
                        confidence: 0.55,
                        bbox: BBox::new(300.0, 310.0, 211.0, 97.5),
                    },
                ],
                inference_duration: Duration::from_millis(12),
                model_identifier: "yolov8n".to_string(),
                device_used: Device::Cpu,
            },
            DetectionResult {
                source_frame_sequence_number: 2,
                frame_width: 1280,
                frame_height: 720,
                detections: vec![Detection {
                    class_id: 16,
                    class_label: "dog".to_string(),
                    confidence: 0.73,
                    bbox: BBox::new(1.0, 2.0, 3.0, 4.0),
                }],
                inference_duration: Duration::from_millis(9),
                model_identifier: "yolov8n".to_string(),
                device_used: Device::Cpu,
            },
        ];
        let mut agg = StatisticsAggregator::default();
        for r in &results {
            agg.record(r);
        }
        (agg.statistics().clone(), results)
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("yolo".parse::<ExportFormat>().unwrap(), ExportFormat::Yolo);
        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(PipelineError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn yolo_round_trip_reconstructs_boxes() {
        let (stats, results) = sample();
        let text = String::from_utf8(format(&stats, &results, ExportFormat::Yolo).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        let originals: Vec<(&DetectionResult, &Detection)> = results
            .iter()
            .flat_map(|r| r.detections.iter().map(move |d| (r, d)))
            .collect();
        assert_eq!(lines.len(), originals.len());

        for (line, (r, d)) in lines.iter().zip(originals) {
            let v: Vec<f64> = line.split_whitespace().map(|t| t.parse().unwrap()).collect();
            assert_eq!(v[0] as u32, d.class_id);
            let (fw, fh) = (r.frame_width as f64, r.frame_height as f64);
            let (w, h) = (v[3] * fw, v[4] * fh);
            let (x, y) = (v[1] * fw - w / 2.0, v[2] * fh - h / 2.0);
            let tol = 1e-2;
            assert!((x - d.bbox.x as f64).abs() < tol, "{line}");
            assert!((y - d.bbox.y as f64).abs() < tol, "{line}");
            assert!((w - d.bbox.w as f64).abs() < tol, "{line}");
            assert!((h - d.bbox.h as f64).abs() < tol, "{line}");
        }
    }

    #[test]
    fn json_contains_statistics_and_frames() {
        let (stats, results) = sample();
        let bytes = format(&stats, &results, ExportFormat::Json).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["statistics"]["total_objects"], 3);
        assert_eq!(doc["statistics"]["class_counts"]["person"], 1);
        assert_eq!(doc["detections"].as_array().unwrap().len(), 2);
        assert_eq!(doc["detections"][0]["objects"][1]["class_name"], "car");
        assert_eq!(doc["detections"][1]["device"], "cpu");
    }

    #[test]
    fn csv_has_header_and_one_row_per_detection() {
        let (stats, results) = sample();
        let text = String::from_utf8(format(&stats, &results, ExportFormat::Csv).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("frame,class_id"));
        assert!(lines[1].starts_with("0,0,person,0.9100,12.5,40.0"));
    }

    #[test]
    fn txt_lists_detections() {
        let (stats, results) = sample();
        let text = String::from_utf8(format(&stats, &results, ExportFormat::Txt).unwrap()).unwrap();
        assert!(text.contains("Total objects: 3"));
        assert!(text.contains("  person: 0.91 at [12.5, 40.0, 112.8, 240.0]"));
        assert!(text.contains("  dog: 1"));
    }

    #[test]
    fn write_export_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        write_export(&path, b"first").unwrap();
        write_export(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn snapshot_is_written_as_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let frame = Frame::new(image::RgbImage::new(16, 8), 0);
        let path = save_snapshot(&frame, dir.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("snapshot_"));
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (16, 8));
    }
}
