// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 会话状态与共享视图
//!
//! Session 是不可变快照,每次变化整体替换 `Arc<Session>`。
//! 协调器负责所有状态切换; 唯一例外是消费线程遇到致命错误时立即标记 Stopped。
//! 其它线程通过 [`SessionObserver`] 读取,不持有协调器。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::stats::{Statistics, StatisticsAggregator};
use crate::detection::{Frame, InferenceParams};
use crate::error::PipelineError;
use crate::input::{SourceDescriptor, SourceKind};

/// 流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Paused => "paused",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// 会话快照
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: u64,
    pub source_kind: SourceKind,
    pub source_description: String,
    pub descriptor: SourceDescriptor,
    pub start_time: DateTime<Local>,
    pub state: PipelineState,
    pub frame_skip_level: u8,
}

impl Session {
    pub fn is_paused(&self) -> bool {
        self.state == PipelineState::Paused
    }

    /// 复制一份并修改状态
    pub fn with_state(&self, state: PipelineState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

/// 会话计数器 (采集/消费线程原子递增)
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub frames_emitted: AtomicU64,
    pub frames_submitted: AtomicU64,
    pub frames_dropped_cadence: AtomicU64,
    pub frames_dropped_backpressure: AtomicU64,
    pub frames_dropped_preview: AtomicU64,
    pub capture_errors: AtomicU64,
    pub inference_failures: AtomicU64,
    pub results_delivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub frames_emitted: u64,
    pub frames_submitted: u64,
    pub frames_dropped_cadence: u64,
    pub frames_dropped_backpressure: u64,
    pub frames_dropped_preview: u64,
    pub capture_errors: u64,
    pub inference_failures: u64,
    pub results_delivered: u64,
}

impl SessionCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            frames_emitted: get(&self.frames_emitted),
            frames_submitted: get(&self.frames_submitted),
            frames_dropped_cadence: get(&self.frames_dropped_cadence),
            frames_dropped_backpressure: get(&self.frames_dropped_backpressure),
            frames_dropped_preview: get(&self.frames_dropped_preview),
            capture_errors: get(&self.capture_errors),
            inference_failures: get(&self.inference_failures),
            results_delivered: get(&self.results_delivered),
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.frames_emitted,
            &self.frames_submitted,
            &self.frames_dropped_cadence,
            &self.frames_dropped_backpressure,
            &self.frames_dropped_preview,
            &self.capture_errors,
            &self.inference_failures,
            &self.results_delivered,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// 流水线状态汇总 (status 命令)
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub session: Option<Arc<Session>>,
    pub statistics: Statistics,
    pub counters: CounterSnapshot,
    pub last_error: Option<PipelineError>,
    /// 输入流已结束且所有结果已送达
    pub source_finished: bool,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state={}", self.state)?;
        if let Some(s) = &self.session {
            write!(
                f,
                " session=#{} {} ({}) skip={} since {}",
                s.id,
                s.source_kind,
                s.source_description,
                s.frame_skip_level,
                s.start_time.format("%H:%M:%S")
            )?;
        }
        write!(
            f,
            " | frames={} inferred={} objects={} classes={} avg_conf={:.3} | dropped cadence={} busy={} preview={}",
            self.counters.frames_emitted,
            self.statistics.frame_count,
            self.statistics.total_objects,
            self.statistics.unique_classes(),
            self.statistics.average_confidence(),
            self.counters.frames_dropped_cadence,
            self.counters.frames_dropped_backpressure,
            self.counters.frames_dropped_preview
        )?;
        if self.source_finished {
            f.write_str(" | finished")?;
        }
        if let Some(e) = &self.last_error {
            write!(f, " | error: {e}")?;
        }
        Ok(())
    }
}

/// 协调器与各线程共享的状态
pub(crate) struct Shared {
    pub session: RwLock<Option<Arc<Session>>>,
    pub stats: Mutex<StatisticsAggregator>,
    pub counters: SessionCounters,
    pub last_error: Mutex<Option<PipelineError>>,
    pub latest_raw: Mutex<Option<Frame>>,
    pub latest_annotated: Mutex<Option<Frame>>,
    pub params: RwLock<InferenceParams>,
    pub skip_level: AtomicU8,
    pub finished: AtomicBool,
}

/// 锁中毒时取回内部数据 (持锁线程 panic 不影响其它线程读取)
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    pub fn new(params: InferenceParams, skip_level: u8, history_cap: usize) -> Self {
        Self {
            session: RwLock::new(None),
            stats: Mutex::new(StatisticsAggregator::new(history_cap)),
            counters: SessionCounters::default(),
            last_error: Mutex::new(None),
            latest_raw: Mutex::new(None),
            latest_annotated: Mutex::new(None),
            params: RwLock::new(params),
            skip_level: AtomicU8::new(skip_level),
            finished: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn publish(&self, session: Option<Session>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = session.map(Arc::new);
    }

    /// 在写锁内基于当前快照生成新快照; `f` 返回 None 时不替换
    pub fn update_session(&self, f: impl FnOnce(&Session) -> Option<Session>) -> bool {
        let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
        match slot.as_deref().and_then(f) {
            Some(next) => {
                *slot = Some(Arc::new(next));
                true
            }
            None => false,
        }
    }

    /// 切换当前会话状态; 已 Stopped 的会话只能被新会话替换
    ///
    /// `id` 指定时只作用于该会话。返回是否生效。
    pub fn transition(&self, id: Option<u64>, state: PipelineState) -> bool {
        self.update_session(|current| {
            let same = id.map_or(true, |id| id == current.id);
            let revives = current.state == PipelineState::Stopped && state != PipelineState::Stopped;
            (same && !revives).then(|| current.with_state(state))
        })
    }

    pub fn params(&self) -> InferenceParams {
        *self.params.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update_params(&self, f: impl FnOnce(&mut InferenceParams)) {
        f(&mut self.params.write().unwrap_or_else(|e| e.into_inner()));
    }

    pub fn state(&self) -> PipelineState {
        self.session().map_or(PipelineState::Idle, |s| s.state)
    }

    /// 新会话: 清空统计/计数/缓存帧
    pub fn reset_session_data(&self) {
        lock(&self.stats).reset();
        self.counters.reset();
        *lock(&self.last_error) = None;
        *lock(&self.latest_raw) = None;
        *lock(&self.latest_annotated) = None;
        self.finished.store(false, Ordering::Release);
    }

    pub fn status(&self) -> PipelineStatus {
        let session = self.session();
        PipelineStatus {
            state: session.as_ref().map_or(PipelineState::Idle, |s| s.state),
            session,
            statistics: lock(&self.stats).statistics().clone(),
            counters: self.counters.snapshot(),
            last_error: lock(&self.last_error).clone(),
            source_finished: self.finished.load(Ordering::Acquire),
        }
    }
}

/// 只读观察句柄,可跨线程克隆
#[derive(Clone)]
pub struct SessionObserver {
    pub(crate) shared: Arc<Shared>,
}

impl SessionObserver {
    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.session()
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn statistics(&self) -> Statistics {
        lock(&self.shared.stats).statistics().clone()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status()
    }

    /// 最近一帧标注画面
    pub fn latest_annotated(&self) -> Option<Frame> {
        lock(&self.shared.latest_annotated).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot_and_reset() {
        let counters = SessionCounters::default();
        SessionCounters::bump(&counters.frames_emitted);
        SessionCounters::bump(&counters.frames_emitted);
        SessionCounters::bump(&counters.capture_errors);
        let snap = counters.snapshot();
        assert_eq!(snap.frames_emitted, 2);
        assert_eq!(snap.capture_errors, 1);

        counters.reset();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn session_snapshots_are_replaced_not_mutated() {
        let shared = Shared::new(InferenceParams::default(), 0, 16);
        assert_eq!(shared.state(), PipelineState::Idle);

        let session = Session {
            id: 1,
            source_kind: SourceKind::Image,
            source_description: "a.png".to_string(),
            descriptor: SourceDescriptor::Image("a.png".into()),
            start_time: Local::now(),
            state: PipelineState::Running,
            frame_skip_level: 0,
        };
        shared.publish(Some(session.clone()));
        let before = shared.session().unwrap();

        shared.publish(Some(session.with_state(PipelineState::Paused)));
        assert_eq!(before.state, PipelineState::Running);
        assert!(shared.session().unwrap().is_paused());
    }

    #[test]
    fn stopped_session_is_not_revived_by_a_late_transition() {
        let shared = Shared::new(InferenceParams::default(), 0, 16);
        assert!(!shared.transition(None, PipelineState::Paused));

        shared.publish(Some(Session {
            id: 7,
            source_kind: SourceKind::Image,
            source_description: "a.png".to_string(),
            descriptor: SourceDescriptor::Image("a.png".into()),
            start_time: Local::now(),
            state: PipelineState::Running,
            frame_skip_level: 0,
        }));
        assert!(!shared.transition(Some(6), PipelineState::Stopped));
        assert_eq!(shared.state(), PipelineState::Running);

        assert!(shared.transition(Some(7), PipelineState::Stopped));
        assert!(!shared.transition(None, PipelineState::Paused));
        assert!(!shared.transition(None, PipelineState::Running));
        assert_eq!(shared.state(), PipelineState::Stopped);
        assert!(shared.transition(None, PipelineState::Stopped));
    }
}
