// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 跳帧控制 (FrameSkipController)
//!
//! skip_level = k: 送 1 帧推理,丢弃后面 k 帧,循环往复。
//! 推理线程忙时额外丢帧 (背压优先),送帧槽位保持就绪,
//! 线程一空闲就送下一帧,因此相邻两次送帧至少间隔 k 帧。

/// 最大跳帧级别
pub const MAX_SKIP_LEVEL: u8 = 5;

/// 单帧决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    /// 送入推理
    Forward,
    /// 按跳帧节拍丢弃
    DropCadence,
    /// 推理线程忙,背压丢弃
    DropBackpressure,
}

#[derive(Debug, Clone, Default)]
pub struct FrameSkipController {
    skip_level: u8,
    // 当前丢帧周期内还要丢弃的帧数
    counter: u8,
}

impl FrameSkipController {
    pub fn new(skip_level: u8) -> Self {
        Self {
            skip_level: skip_level.min(MAX_SKIP_LEVEL),
            counter: 0,
        }
    }

    pub fn skip_level(&self) -> u8 {
        self.skip_level
    }

    /// 调整跳帧级别,超出范围时截断到 [0, 5]; 进行中的丢帧周期随之缩短
    pub fn set_skip_level(&mut self, level: u8) {
        self.skip_level = level.min(MAX_SKIP_LEVEL);
        self.counter = self.counter.min(self.skip_level);
    }

    pub fn decide(&mut self, worker_busy: bool) -> SkipDecision {
        if self.counter > 0 {
            self.counter -= 1;
            return SkipDecision::DropCadence;
        }
        if worker_busy {
            return SkipDecision::DropBackpressure;
        }
        self.counter = self.skip_level;
        SkipDecision::Forward
    }

    /// 提交被拒绝: 放弃本次丢帧周期,下一帧重新作为送帧槽位
    pub fn rearm(&mut self) {
        self.counter = 0;
    }

    /// 新会话从送帧槽位开始
    pub fn reset(&mut self) {
        self.counter = 0;
    }
}
