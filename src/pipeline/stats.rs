// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测统计 (StatisticsAggregator)
//!
//! 只由消费线程写入; 新会话 (start / switch_source) 时清零。

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::detection::DetectionResult;

/// 默认保留的推理结果条数 (导出使用)
pub const DEFAULT_HISTORY_CAP: usize = 10_000;

/// 会话统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub total_objects: u64,
    pub per_class_counts: BTreeMap<String, u64>,
    pub confidence_sum: f64,
    pub confidence_count: u64,
    pub min_confidence: Option<f32>,
    pub max_confidence: Option<f32>,
    pub frame_count: u64,
    pub elapsed_processing_time: Duration,
}

impl Statistics {
    /// 平均置信度,没有检测时为0
    pub fn average_confidence(&self) -> f64 {
        if self.confidence_count == 0 {
            return 0.0;
        }
        self.confidence_sum / self.confidence_count as f64
    }

    pub fn unique_classes(&self) -> usize {
        self.per_class_counts.len()
    }

    /// 平均单帧推理耗时
    pub fn average_inference_time(&self) -> Duration {
        if self.frame_count == 0 {
            return Duration::ZERO;
        }
        self.elapsed_processing_time.div_f64(self.frame_count as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }
}

pub struct StatisticsAggregator {
    stats: Statistics,
    history: VecDeque<DetectionResult>,
    history_cap: usize,
}

impl Default for StatisticsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl StatisticsAggregator {
    pub fn new(history_cap: usize) -> Self {
        Self {
            stats: Statistics::default(),
            history: VecDeque::new(),
            history_cap: history_cap.max(1),
        }
    }

    pub fn record(&mut self, result: &DetectionResult) {
        let s = &mut self.stats;
        s.frame_count += 1;
        s.total_objects += result.detections.len() as u64;
        s.elapsed_processing_time += result.inference_duration;

        for det in &result.detections {
            *s.per_class_counts.entry(det.class_label.clone()).or_insert(0) += 1;
            s.confidence_sum += det.confidence as f64;
            s.confidence_count += 1;
            s.min_confidence = Some(s.min_confidence.map_or(det.confidence, |m| m.min(det.confidence)));
            s.max_confidence = Some(s.max_confidence.map_or(det.confidence, |m| m.max(det.confidence)));
        }

        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(result.clone());
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn average_confidence(&self) -> f64 {
        self.stats.average_confidence()
    }

    /// 保留的推理结果 (按序号递增)
    pub fn results(&self) -> Vec<DetectionResult> {
        self.history.iter().cloned().collect()
    }

    pub fn reset(&mut self) {
        self.stats = Statistics::default();
        self.history.clear();
    }
}
