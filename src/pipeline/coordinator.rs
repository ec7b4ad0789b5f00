// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线协调器 (PipelineCoordinator)
//!
//! 每个会话三个线程:
//! ```text
//! acquisition: FrameSource → FrameSkipController → InferenceWorker::submit
//!                  │ (预览, try_send)                    │ (WorkerEvent)
//!                  ▼                                     ▼
//! consumer:    FrameSink::render(raw, None)      统计 + 标注 + render(annotated, Some)
//! ```
//! 命令全部经由 `&mut self` 串行执行; 其它线程只读 [`SessionObserver`]。
//!
//! ## 状态机
//! ```text
//! Idle ──start──▶ Running ⇄ Paused ──stop / 致命错误──▶ Stopped ──start──▶ Running
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender, TrySendError};

use super::session::{lock, PipelineState, PipelineStatus, Session, SessionCounters, SessionObserver, Shared};
use super::skip::{FrameSkipController, SkipDecision, MAX_SKIP_LEVEL};
use super::stats::DEFAULT_HISTORY_CAP;
use super::worker::{InferenceWorker, SubmitError, WorkerEvent, WorkerHandle};
use crate::annotate::Annotator;
use crate::command::{Command, CommandSource};
use crate::detection::{Detector, Device, Frame, InferenceParams, ModelTier, PassthroughDetector};
use crate::error::{PipelineError, Result};
use crate::export::{self, ExportFormat};
use crate::input::{open_source, FrameSource, Interrupter, SourceDescriptor, SourceOptions};
use crate::sink::{FrameSink, LogSink};

/// 暂停时的轮询间隔
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub params: InferenceParams,
    pub skip_level: u8,
    pub source_options: SourceOptions,
    /// 导出保留的推理结果条数
    pub history_cap: usize,
    /// 快照/导出默认目录
    pub output_dir: PathBuf,
    /// 预览通道容量,满时丢弃预览帧
    pub preview_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            params: InferenceParams::default(),
            skip_level: 0,
            source_options: SourceOptions::default(),
            history_cap: DEFAULT_HISTORY_CAP,
            output_dir: PathBuf::from("output"),
            preview_capacity: 16,
        }
    }
}

/// `dispatch` 的执行结果
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Done,
    Session(Arc<Session>),
    Snapshot(PathBuf),
    Exported(PathBuf),
    Status(PipelineStatus),
    Quit,
}

/// `await_completion` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// 输入流结束,所有结果已送达
    Drained,
    /// 致命错误,会话已停止
    Faulted(PipelineError),
    /// 没有运行中的会话
    Inactive,
    TimedOut,
}

/// 消费线程 → 协调器
#[derive(Debug)]
enum Notice {
    Drained(u64),
    Fault(u64),
}

/// 采集线程的停止/暂停控制
struct AcquisitionControl {
    stop: AtomicBool,
    paused: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl AcquisitionControl {
    fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn halt(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        self.wake();
    }

    /// 暂停期间阻塞; 返回 false 表示已停止
    fn wait_while_paused(&self) -> bool {
        while self.paused.load(Ordering::Acquire) && !self.is_stopped() {
            let _ = self.wake_rx.recv_timeout(PAUSE_POLL);
        }
        !self.is_stopped()
    }
}

/// 运行中的会话资源
struct ActiveSession {
    id: u64,
    control: Arc<AcquisitionControl>,
    interrupter: Interrupter,
    acquisition: Option<JoinHandle<Box<dyn FrameSource>>>,
    worker: Option<InferenceWorker>,
    consumer: Option<JoinHandle<Box<dyn FrameSink>>>,
}

pub struct PipelineCoordinator {
    shared: Arc<Shared>,
    settings: CoordinatorSettings,
    detector: Option<Box<dyn Detector>>,
    sink: Option<Box<dyn FrameSink>>,
    annotator: Arc<Annotator>,
    active: Option<ActiveSession>,
    notices_tx: Sender<Notice>,
    notices_rx: Receiver<Notice>,
    next_session_id: u64,
}

impl PipelineCoordinator {
    pub fn new(detector: Box<dyn Detector>, sink: Box<dyn FrameSink>, settings: CoordinatorSettings) -> Self {
        let skip_level = settings.skip_level.min(MAX_SKIP_LEVEL);
        let shared = Arc::new(Shared::new(settings.params, skip_level, settings.history_cap));
        let (notices_tx, notices_rx) = unbounded();
        Self {
            shared,
            settings,
            detector: Some(detector),
            sink: Some(sink),
            annotator: Arc::new(Annotator::new()),
            active: None,
            notices_tx,
            notices_rx,
            next_session_id: 1,
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = Arc::new(annotator);
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.session()
    }

    pub fn params(&self) -> InferenceParams {
        self.shared.params()
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status()
    }

    pub fn observer(&self) -> SessionObserver {
        SessionObserver {
            shared: Arc::clone(&self.shared),
        }
    }

    // ========== 会话命令 ==========

    /// Idle / Stopped → Running
    pub fn start(&mut self, descriptor: SourceDescriptor) -> Result<Arc<Session>> {
        self.poll_notices();
        match self.state() {
            PipelineState::Idle | PipelineState::Stopped => self.launch(descriptor),
            state => Err(PipelineError::InvalidState(format!("cannot start while {state}"))),
        }
    }

    pub fn pause(&mut self) -> Result<()> {
        self.poll_notices();
        match self.state() {
            PipelineState::Running => {
                if let Some(active) = &self.active {
                    active.control.set_paused(true);
                }
                if !self.transition(PipelineState::Paused) {
                    self.poll_notices();
                    return Err(PipelineError::InvalidState("session stopped".to_string()));
                }
                tracing::info!("⏸️ 已暂停");
                Ok(())
            }
            PipelineState::Paused => Ok(()),
            state => Err(PipelineError::InvalidState(format!("cannot pause while {state}"))),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        self.poll_notices();
        match self.state() {
            PipelineState::Paused => {
                if let Some(active) = &self.active {
                    active.control.set_paused(false);
                }
                if !self.transition(PipelineState::Running) {
                    self.poll_notices();
                    return Err(PipelineError::InvalidState("session stopped".to_string()));
                }
                tracing::info!("▶️ 已恢复");
                Ok(())
            }
            PipelineState::Running => Ok(()),
            state => Err(PipelineError::InvalidState(format!("cannot resume while {state}"))),
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        self.poll_notices();
        match self.state() {
            PipelineState::Running | PipelineState::Paused => {
                self.teardown();
                self.transition(PipelineState::Stopped);
                tracing::info!("⏹️ 已停止");
                Ok(())
            }
            state => Err(PipelineError::InvalidState(format!("cannot stop while {state}"))),
        }
    }

    /// 切换输入源: 停止当前会话并以新输入源开始新会话 (统计清零)
    ///
    /// 新输入源打不开时会话保持 Stopped,统计同样已清零。
    pub fn switch_source(&mut self, descriptor: SourceDescriptor) -> Result<Arc<Session>> {
        self.poll_notices();
        match self.state() {
            PipelineState::Idle => self.launch(descriptor),
            PipelineState::Running | PipelineState::Paused => {
                tracing::info!("🔄 切换输入源: {}", descriptor);
                self.teardown();
                self.transition(PipelineState::Stopped);
                self.shared.reset_session_data();
                self.launch(descriptor)
            }
            PipelineState::Stopped => Err(PipelineError::InvalidState(
                "cannot switch source while stopped, use start".to_string(),
            )),
        }
    }

    /// 最近一帧标注画面; 还没有推理结果时返回最近的原始帧
    pub fn snapshot(&mut self) -> Result<Option<Frame>> {
        self.poll_notices();
        match self.state() {
            PipelineState::Running | PipelineState::Paused => {
                let annotated = lock(&self.shared.latest_annotated).clone();
                Ok(annotated.or_else(|| lock(&self.shared.latest_raw).clone()))
            }
            state => Err(PipelineError::InvalidState(format!("cannot snapshot while {state}"))),
        }
    }

    /// 保存快照到目录 (默认 output_dir)
    pub fn snapshot_to(&mut self, dir: Option<&Path>) -> Result<PathBuf> {
        let frame = self
            .snapshot()?
            .ok_or_else(|| PipelineError::InvalidState("no frame rendered yet".to_string()))?;
        let dir = dir.unwrap_or(&self.settings.output_dir);
        export::save_snapshot(&frame, dir)
    }

    // ========== 参数设置 (任何状态下有效, 下一次提交生效) ==========

    pub fn set_confidence(&mut self, value: f32) -> Result<()> {
        let value = unit_interval("confidence", value)?;
        self.shared.update_params(|p| p.confidence = value);
        tracing::info!("🎚️ 置信度阈值: {:.2}", value);
        Ok(())
    }

    pub fn set_iou(&mut self, value: f32) -> Result<()> {
        let value = unit_interval("iou", value)?;
        self.shared.update_params(|p| p.iou = value);
        tracing::info!("🎚️ IoU 阈值: {:.2}", value);
        Ok(())
    }

    /// 超出 [0, 5] 时截断,返回实际生效的级别
    pub fn set_skip_level(&mut self, level: u8) -> u8 {
        let level = level.min(MAX_SKIP_LEVEL);
        self.shared.skip_level.store(level, Ordering::Release);
        self.shared.update_session(|session| {
            Some(Session {
                frame_skip_level: level,
                ..session.clone()
            })
        });
        tracing::info!("⏭️ 跳帧级别: {}", level);
        level
    }

    pub fn set_device(&mut self, device: Device) {
        self.shared.update_params(|p| p.device = device);
        tracing::info!("🖥️ 推理设备: {}", device);
    }

    pub fn set_model(&mut self, model: ModelTier) {
        self.shared.update_params(|p| p.model = model);
        tracing::info!("🧠 检测模型: {}", model.display_name());
    }

    /// 导出统计与保留的推理结果; 格式不支持时不写任何文件
    pub fn export(&mut self, format: &str, path: Option<&Path>) -> Result<PathBuf> {
        let kind: ExportFormat = format.parse()?;
        let (stats, results) = {
            let agg = lock(&self.shared.stats);
            (agg.statistics().clone(), agg.results())
        };
        let bytes = export::format(&stats, &results, kind)?;
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => self.settings.output_dir.join(kind.default_file_name()),
        };
        export::write_export(&path, &bytes)?;
        Ok(path)
    }

    // ========== 命令分发 ==========

    pub fn dispatch(&mut self, command: Command) -> Result<CommandOutcome> {
        tracing::debug!("📨 命令: {:?}", command);
        let outcome = match command {
            Command::Start(desc) => CommandOutcome::Session(self.start(desc)?),
            Command::SwitchSource(desc) => CommandOutcome::Session(self.switch_source(desc)?),
            Command::Pause => self.pause().map(|_| CommandOutcome::Done)?,
            Command::Resume => self.resume().map(|_| CommandOutcome::Done)?,
            Command::Stop => self.stop().map(|_| CommandOutcome::Done)?,
            Command::Snapshot => CommandOutcome::Snapshot(self.snapshot_to(None)?),
            Command::SetConfidence(v) => self.set_confidence(v).map(|_| CommandOutcome::Done)?,
            Command::SetIou(v) => self.set_iou(v).map(|_| CommandOutcome::Done)?,
            Command::SetSkipLevel(level) => {
                self.set_skip_level(level);
                CommandOutcome::Done
            }
            Command::SetDevice(device) => {
                self.set_device(device);
                CommandOutcome::Done
            }
            Command::SetModel(model) => {
                self.set_model(model);
                CommandOutcome::Done
            }
            Command::Export { format, path } => {
                CommandOutcome::Exported(self.export(&format, path.as_deref())?)
            }
            Command::Status => {
                self.poll_notices();
                CommandOutcome::Status(self.status())
            }
            Command::Quit => CommandOutcome::Quit,
        };
        Ok(outcome)
    }

    /// 命令循环: 串行执行命令,同时响应会话结束/致命错误
    ///
    /// `exit_when_finished` 为 true 时,输入流结束或会话出错后返回。
    pub fn serve(&mut self, mut commands: Box<dyn CommandSource>, exit_when_finished: bool) -> Result<()> {
        let (cmd_tx, cmd_rx) = bounded::<Command>(16);
        thread::Builder::new()
            .name("commands".to_string())
            .spawn(move || {
                while let Some(cmd) = commands.next_command() {
                    if cmd_tx.send(cmd).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| PipelineError::PipelineFailure(format!("spawn command thread: {e}")))?;

        let notices = self.notices_rx.clone();
        let mut cmd_rx = Some(cmd_rx);
        let closed = never();
        let mut commands_closed = false;

        loop {
            if exit_when_finished && self.finished() {
                break;
            }
            select! {
                recv(cmd_rx.as_ref().unwrap_or(&closed)) -> msg => match msg {
                    Ok(cmd) => match self.dispatch(cmd) {
                        Ok(CommandOutcome::Quit) => break,
                        Ok(outcome) => log_outcome(&outcome),
                        Err(e) => tracing::warn!("⚠️ {}", e),
                    },
                    Err(_) => {
                        tracing::debug!("📭 命令流结束");
                        if !exit_when_finished || self.active.is_none() {
                            break;
                        }
                        commands_closed = true;
                    }
                },
                recv(notices) -> msg => {
                    if let Ok(notice) = msg {
                        self.handle_notice(notice);
                    }
                }
            }
            if commands_closed {
                cmd_rx = None;
            }
        }

        if matches!(self.state(), PipelineState::Running | PipelineState::Paused) {
            self.stop()?;
        }
        Ok(())
    }

    /// 等待当前会话的输入流结束 (所有结果送达) 或出错
    pub fn await_completion(&mut self, timeout: Duration) -> Completion {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll_notices();
            if let Some(done) = self.completion() {
                return done;
            }
            match self.notices_rx.recv_deadline(deadline) {
                Ok(notice) => self.handle_notice(notice),
                Err(_) => return Completion::TimedOut,
            }
        }
    }

    fn completion(&self) -> Option<Completion> {
        if let Some(e) = lock(&self.shared.last_error).clone() {
            return Some(Completion::Faulted(e));
        }
        if self.shared.finished.load(Ordering::Acquire) {
            return Some(Completion::Drained);
        }
        if self.active.is_none() {
            return Some(Completion::Inactive);
        }
        None
    }

    fn finished(&self) -> bool {
        matches!(
            self.completion(),
            Some(Completion::Drained | Completion::Faulted(_))
        )
    }

    // ========== 内部 ==========

    /// 处理消费线程的通知; 致命错误的会话在这里回收线程
    fn poll_notices(&mut self) {
        while let Ok(notice) = self.notices_rx.try_recv() {
            self.handle_notice(notice);
        }
        let faulted = lock(&self.shared.last_error).is_some();
        if faulted && self.active.is_some() {
            self.fail_session();
        }
    }

    fn handle_notice(&mut self, notice: Notice) {
        let current = self.active.as_ref().map(|a| a.id);
        match notice {
            Notice::Fault(id) if current == Some(id) => self.fail_session(),
            Notice::Drained(id) if current == Some(id) => {
                tracing::info!("🏁 会话 #{} 输入流处理完毕", id);
            }
            stale => tracing::debug!("忽略过期通知 {:?}", stale),
        }
    }

    fn fail_session(&mut self) {
        self.teardown();
        self.transition(PipelineState::Stopped);
        if let Some(e) = lock(&self.shared.last_error).as_ref() {
            tracing::error!("❌ 会话已停止: {}", e);
        }
    }

    fn transition(&self, state: PipelineState) -> bool {
        self.shared.transition(None, state)
    }

    fn launch(&mut self, descriptor: SourceDescriptor) -> Result<Arc<Session>> {
        let source = open_source(&descriptor, &self.settings.source_options)?;
        self.shared.reset_session_data();

        let id = self.next_session_id;
        self.next_session_id += 1;

        let detector = self
            .detector
            .take()
            .unwrap_or_else(|| Box::new(PassthroughDetector::new(self.shared.params().model)));
        let (events_tx, events_rx) = bounded::<WorkerEvent>(1);
        let worker = InferenceWorker::spawn(detector, events_tx)?;

        let (preview_tx, preview_rx) = bounded::<Frame>(self.settings.preview_capacity.max(1));
        let control = Arc::new(AcquisitionControl::new());
        let interrupter = source.interrupter();

        let session = Session {
            id,
            source_kind: source.kind(),
            source_description: source.describe(),
            descriptor,
            start_time: Local::now(),
            state: PipelineState::Running,
            frame_skip_level: self.shared.skip_level.load(Ordering::Acquire),
        };

        let consumer = ConsumerLoop {
            session_id: id,
            sink: self
                .sink
                .take()
                .unwrap_or_else(|| Box::new(LogSink::default())),
            annotator: Arc::clone(&self.annotator),
            shared: Arc::clone(&self.shared),
            control: Arc::clone(&control),
            interrupter: interrupter.clone(),
            notices: self.notices_tx.clone(),
        };
        let worker_handle = worker.handle();

        let mut active = ActiveSession {
            id,
            control: Arc::clone(&control),
            interrupter,
            acquisition: None,
            worker: Some(worker),
            consumer: None,
        };

        match thread::Builder::new()
            .name("consumer".to_string())
            .spawn(move || consumer.run(preview_rx, events_rx))
        {
            Ok(handle) => active.consumer = Some(handle),
            Err(e) => {
                self.active = Some(active);
                self.teardown();
                return Err(PipelineError::PipelineFailure(format!("spawn consumer thread: {e}")));
            }
        }

        let acquisition = AcquisitionLoop {
            source,
            worker: worker_handle,
            preview: preview_tx,
            control,
            shared: Arc::clone(&self.shared),
            max_capture_errors: self.settings.source_options.max_consecutive_capture_errors.max(1),
        };
        match thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || acquisition.run())
        {
            Ok(handle) => active.acquisition = Some(handle),
            Err(e) => {
                self.active = Some(active);
                self.teardown();
                return Err(PipelineError::PipelineFailure(format!("spawn acquisition thread: {e}")));
            }
        }

        self.active = Some(active);
        self.shared.publish(Some(session));
        let session = self
            .shared
            .session()
            .ok_or_else(|| PipelineError::PipelineFailure("session not published".to_string()))?;
        tracing::info!(
            "🚀 会话 #{} 开始: {} ({})",
            session.id,
            session.source_description,
            session.source_kind
        );
        Ok(session)
    }

    /// 停止所有线程并回收 Detector / FrameSink
    ///
    /// 顺序: 停止采集 (唤醒阻塞的 next_frame) → 关闭输入源 →
    /// 等待进行中的推理并丢弃结果 → 消费线程处理完剩余事件后退出。
    fn teardown(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.control.halt();
        active.interrupter.interrupt();

        if let Some(handle) = active.acquisition.take() {
            match handle.join() {
                Ok(mut source) => source.close(),
                Err(_) => tracing::error!("❌ 采集线程异常退出"),
            }
        }
        if let Some(worker) = active.worker.take() {
            self.detector = worker.shutdown(true);
        }
        if let Some(handle) = active.consumer.take() {
            match handle.join() {
                Ok(sink) => self.sink = Some(sink),
                Err(_) => tracing::error!("❌ 消费线程异常退出"),
            }
        }
        tracing::debug!("🧹 会话 #{} 资源已释放", active.id);
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn unit_interval(name: &str, value: f32) -> Result<f32> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(PipelineError::InvalidArgument(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

fn log_outcome(outcome: &CommandOutcome) {
    match outcome {
        CommandOutcome::Session(s) => tracing::info!("✅ 会话 #{}: {}", s.id, s.source_description),
        CommandOutcome::Snapshot(p) => tracing::info!("✅ 快照: {}", p.display()),
        CommandOutcome::Exported(p) => tracing::info!("✅ 导出: {}", p.display()),
        CommandOutcome::Status(status) => tracing::info!("📊 {}", status),
        CommandOutcome::Done | CommandOutcome::Quit => {}
    }
}

// ========== 采集线程 ==========

struct AcquisitionLoop {
    source: Box<dyn FrameSource>,
    worker: WorkerHandle,
    preview: Sender<Frame>,
    control: Arc<AcquisitionControl>,
    shared: Arc<Shared>,
    max_capture_errors: u32,
}

impl AcquisitionLoop {
    fn run(mut self) -> Box<dyn FrameSource> {
        tracing::debug!("📷 采集线程启动: {}", self.source.describe());
        let counters = &self.shared.counters;
        let mut skip = FrameSkipController::new(self.shared.skip_level.load(Ordering::Acquire));
        let mut consecutive_errors = 0u32;
        let mut natural_end = false;

        loop {
            if !self.control.wait_while_paused() {
                break;
            }
            let level = self.shared.skip_level.load(Ordering::Acquire);
            if level != skip.skip_level() {
                skip.set_skip_level(level);
            }

            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => {
                    consecutive_errors = 0;
                    frame
                }
                Ok(None) => {
                    natural_end = !self.control.is_stopped();
                    break;
                }
                Err(e) => {
                    SessionCounters::bump(&counters.capture_errors);
                    consecutive_errors += 1;
                    tracing::warn!(
                        "⚠️ 读帧失败 ({}/{}): {}",
                        consecutive_errors,
                        self.max_capture_errors,
                        e
                    );
                    if consecutive_errors >= self.max_capture_errors {
                        tracing::error!("❌ 连续读帧失败,视为输入流结束");
                        natural_end = true;
                        break;
                    }
                    continue;
                }
            };
            if self.control.is_stopped() {
                break;
            }
            SessionCounters::bump(&counters.frames_emitted);

            match self.preview.try_send(frame.clone()) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => SessionCounters::bump(&counters.frames_dropped_preview),
            }

            match skip.decide(self.worker.is_busy()) {
                SkipDecision::Forward => match self.worker.submit(frame, self.shared.params()) {
                    Ok(()) => SessionCounters::bump(&counters.frames_submitted),
                    Err(SubmitError::Busy(_)) => {
                        skip.rearm();
                        SessionCounters::bump(&counters.frames_dropped_backpressure);
                    }
                    Err(SubmitError::Stopped(_)) => {
                        tracing::debug!("推理线程已停止,采集结束");
                        break;
                    }
                },
                SkipDecision::DropCadence => SessionCounters::bump(&counters.frames_dropped_cadence),
                SkipDecision::DropBackpressure => {
                    SessionCounters::bump(&counters.frames_dropped_backpressure)
                }
            }
        }

        if natural_end && !self.worker.drain() {
            tracing::debug!("推理线程已退出,跳过排空");
        }
        if self.control.is_stopped() {
            // 致命错误时协调器可能稍后才回收线程,设备在这里先释放
            self.source.close();
        }
        tracing::debug!("📷 采集线程退出");
        self.source
    }
}

// ========== 消费线程 ==========

struct ConsumerLoop {
    session_id: u64,
    sink: Box<dyn FrameSink>,
    annotator: Arc<Annotator>,
    shared: Arc<Shared>,
    control: Arc<AcquisitionControl>,
    interrupter: Interrupter,
    notices: Sender<Notice>,
}

impl ConsumerLoop {
    fn run(mut self, preview: Receiver<Frame>, events: Receiver<WorkerEvent>) -> Box<dyn FrameSink> {
        let mut preview = Some(preview);
        let mut events = Some(events);
        let no_frames = never();
        let no_events = never();
        let mut faulted = false;

        while preview.is_some() || events.is_some() {
            let (mut preview_closed, mut events_closed) = (false, false);
            select! {
                recv(preview.as_ref().unwrap_or(&no_frames)) -> msg => match msg {
                    Ok(frame) => self.on_raw(frame),
                    Err(_) => preview_closed = true,
                },
                recv(events.as_ref().unwrap_or(&no_events)) -> msg => match msg {
                    Ok(WorkerEvent::Drained) => {
                        if let Some(rx) = &preview {
                            while let Ok(frame) = rx.try_recv() {
                                self.on_raw(frame);
                            }
                        }
                        self.shared.finished.store(true, Ordering::Release);
                        let _ = self.notices.send(Notice::Drained(self.session_id));
                    }
                    Ok(WorkerEvent::Fatal(error)) if !faulted => {
                        faulted = true;
                        self.on_fatal(error);
                    }
                    Ok(event) => self.on_event(event),
                    Err(_) => events_closed = true,
                },
            }
            if preview_closed {
                preview = None;
            }
            if events_closed {
                events = None;
            }
        }
        self.sink
    }

    fn on_raw(&mut self, frame: Frame) {
        self.sink.render(&frame, None);
        *lock(&self.shared.latest_raw) = Some(frame);
    }

    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Completed { frame, result } => {
                lock(&self.shared.stats).record(&result);
                SessionCounters::bump(&self.shared.counters.results_delivered);
                let annotated = self.annotator.annotate(&frame, &result);
                self.sink.render(&annotated, Some(&result));
                *lock(&self.shared.latest_annotated) = Some(annotated);
            }
            WorkerEvent::Failed { .. } => {
                SessionCounters::bump(&self.shared.counters.inference_failures);
            }
            WorkerEvent::Fatal(_) | WorkerEvent::Drained => {}
        }
    }

    fn on_fatal(&mut self, error: PipelineError) {
        SessionCounters::bump(&self.shared.counters.inference_failures);
        self.sink.on_failure(&error);
        *lock(&self.shared.last_error) = Some(error);
        self.shared.transition(Some(self.session_id), PipelineState::Stopped);
        self.control.halt();
        self.interrupter.interrupt();
        let _ = self.notices.send(Notice::Fault(self.session_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ImageSource;
    use image::RgbImage;

    #[test]
    fn thresholds_must_be_unit_interval() {
        assert_eq!(unit_interval("conf", 0.0).unwrap(), 0.0);
        assert_eq!(unit_interval("conf", 1.0).unwrap(), 1.0);
        assert!(unit_interval("conf", 1.01).is_err());
        assert!(unit_interval("conf", -0.1).is_err());
        assert!(unit_interval("conf", f32::NAN).is_err());
    }

    #[test]
    fn paused_control_unblocks_on_halt() {
        let control = Arc::new(AcquisitionControl::new());
        control.set_paused(true);
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(20));
        control.halt();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn idle_coordinator_rejects_session_commands() {
        let mut coord = PipelineCoordinator::new(
            Box::new(PassthroughDetector::new(ModelTier::Nano)),
            Box::new(LogSink::default()),
            CoordinatorSettings::default(),
        );
        assert_eq!(coord.state(), PipelineState::Idle);
        assert!(matches!(coord.pause(), Err(PipelineError::InvalidState(_))));
        assert!(matches!(coord.stop(), Err(PipelineError::InvalidState(_))));
        assert!(matches!(coord.snapshot(), Err(PipelineError::InvalidState(_))));
        assert_eq!(coord.set_skip_level(9), MAX_SKIP_LEVEL);
        assert_eq!(coord.await_completion(Duration::from_millis(10)), Completion::Inactive);
    }

    #[test]
    fn acquisition_loop_returns_source_after_end_of_stream() {
        let shared = Arc::new(Shared::new(InferenceParams::default(), 0, 8));
        let (events_tx, events_rx) = bounded(4);
        let worker = InferenceWorker::spawn(Box::new(PassthroughDetector::new(ModelTier::Nano)), events_tx).unwrap();
        let (preview_tx, preview_rx) = bounded(4);

        let acquisition = AcquisitionLoop {
            source: Box::new(ImageSource::from_image("still.png", RgbImage::new(4, 4))),
            worker: worker.handle(),
            preview: preview_tx,
            control: Arc::new(AcquisitionControl::new()),
            shared: Arc::clone(&shared),
            max_capture_errors: 3,
        };
        let source = acquisition.run();

        assert_eq!(source.describe(), "still.png");
        assert_eq!(preview_rx.try_recv().unwrap().sequence_number, 0);
        assert!(matches!(
            events_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            WorkerEvent::Completed { .. }
        ));
        assert!(matches!(
            events_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            WorkerEvent::Drained
        ));
        let counters = shared.counters.snapshot();
        assert_eq!((counters.frames_emitted, counters.frames_submitted), (1, 1));
        worker.shutdown(false);
    }
}
