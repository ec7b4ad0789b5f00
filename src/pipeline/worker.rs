// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理线程 (InferenceWorker)
//! 职责: 接收帧 → Detector 推理 → 发送 WorkerEvent
//!
//! ## 核心约束
//! - 同一时刻最多一个推理 (忙标志在提交时抢占,推理结束后、发送结果前释放)
//! - 忙时提交直接拒绝,不排队; 帧原样交还给调用方
//! - 阈值/设备/模型在提交时随任务一起捕获
//! - 单帧失败可恢复; 连续 3 次失败升级为 PipelineFailure 并停止
//! - `drain` 排在已提交任务之后,对应的 Drained 事件保证在所有先前结果之后发出

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};

use crate::detection::{Detection, DetectionResult, Detector, Frame, InferenceParams};
use crate::error::{PipelineError, Result};

/// 连续推理失败上限
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// 提交失败时交还帧
#[derive(Debug)]
pub enum SubmitError {
    /// 正在推理上一帧
    Busy(Frame),
    /// 推理线程已停止
    Stopped(Frame),
}

impl SubmitError {
    pub fn into_frame(self) -> Frame {
        match self {
            SubmitError::Busy(f) | SubmitError::Stopped(f) => f,
        }
    }
}

/// 推理线程 → 消费线程
#[derive(Debug)]
pub enum WorkerEvent {
    Completed {
        frame: Frame,
        result: DetectionResult,
    },
    Failed {
        sequence_number: u64,
        error: PipelineError,
        consecutive: u32,
    },
    Fatal(PipelineError),
    /// 之前提交的任务都已处理完
    Drained,
}

enum Job {
    Infer { frame: Frame, params: InferenceParams },
    Drain,
}

#[derive(Default)]
struct Shared {
    busy: AtomicBool,
    stopped: AtomicBool,
    abandon: AtomicBool,
}

/// 提交端句柄 (采集线程持有)
#[derive(Clone)]
pub struct WorkerHandle {
    jobs: Sender<Job>,
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// 非阻塞提交
    pub fn submit(&self, frame: Frame, params: InferenceParams) -> Result<(), SubmitError> {
        if self.is_stopped() {
            return Err(SubmitError::Stopped(frame));
        }
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SubmitError::Busy(frame));
        }

        let job = Job::Infer {
            frame: frame.clone(),
            params,
        };
        match self.jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shared.busy.store(false, Ordering::Release);
                Err(SubmitError::Busy(frame))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.busy.store(false, Ordering::Release);
                Err(SubmitError::Stopped(frame))
            }
        }
    }

    /// 等已提交的推理结束后发出 `WorkerEvent::Drained` (阻塞直到排入队列)
    ///
    /// 推理线程已退出时返回 false。
    pub fn drain(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.jobs.send(Job::Drain).is_ok()
    }
}

pub struct InferenceWorker {
    handle: WorkerHandle,
    quit: Option<Sender<()>>,
    thread: Option<JoinHandle<Box<dyn Detector>>>,
}

impl InferenceWorker {
    pub fn spawn(detector: Box<dyn Detector>, events: Sender<WorkerEvent>) -> Result<Self> {
        let (jobs_tx, jobs_rx) = bounded::<Job>(1);
        let (quit_tx, quit_rx) = bounded::<()>(0);
        let shared = Arc::new(Shared::default());

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || run(detector, jobs_rx, quit_rx, events, thread_shared))
            .map_err(|e| PipelineError::PipelineFailure(format!("spawn inference thread: {e}")))?;

        Ok(Self {
            handle: WorkerHandle {
                jobs: jobs_tx,
                shared,
            },
            quit: Some(quit_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.handle.is_busy()
    }

    pub fn submit(&self, frame: Frame, params: InferenceParams) -> Result<(), SubmitError> {
        self.handle.submit(frame, params)
    }

    /// 停止推理线程并取回 Detector
    ///
    /// 正在进行的推理会执行完 (不打断计算); `abandon` 为 true 时其结果被丢弃。
    /// 线程 panic 时返回 None。
    pub fn shutdown(mut self, abandon: bool) -> Option<Box<dyn Detector>> {
        self.stop_thread(abandon)
    }

    fn stop_thread(&mut self, abandon: bool) -> Option<Box<dyn Detector>> {
        let shared = &self.handle.shared;
        if abandon {
            shared.abandon.store(true, Ordering::Release);
        }
        shared.stopped.store(true, Ordering::Release);
        // 断开退出通道,空闲的推理线程立即返回
        self.quit.take();

        let thread = self.thread.take()?;
        match thread.join() {
            Ok(detector) => Some(detector),
            Err(_) => {
                tracing::error!("❌ 推理线程异常退出");
                None
            }
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop_thread(true);
        }
    }
}

fn run(
    mut detector: Box<dyn Detector>,
    jobs: Receiver<Job>,
    quit: Receiver<()>,
    events: Sender<WorkerEvent>,
    shared: Arc<Shared>,
) -> Box<dyn Detector> {
    tracing::debug!("🔍 推理线程启动 ({})", detector.model_identifier());
    let mut consecutive = 0u32;

    loop {
        let job = select! {
            recv(jobs) -> msg => match msg {
                Ok(job) => job,
                Err(_) => break,
            },
            recv(quit) -> _ => break,
        };

        let (frame, params) = match job {
            Job::Infer { frame, params } => (frame, params),
            Job::Drain => {
                if shared.abandon.load(Ordering::Acquire) || events.send(WorkerEvent::Drained).is_err() {
                    break;
                }
                continue;
            }
        };

        let started = Instant::now();
        let outcome: Result<Vec<Detection>> = detector.detect(&frame, &params);
        let inference_duration = started.elapsed();

        // 先释放忙标志再发送结果
        shared.busy.store(false, Ordering::Release);

        if shared.abandon.load(Ordering::Acquire) {
            tracing::debug!("🗑️ 丢弃进行中的推理结果 #{}", frame.sequence_number);
            break;
        }

        let event = match outcome {
            Ok(detections) => {
                consecutive = 0;
                let result = DetectionResult {
                    source_frame_sequence_number: frame.sequence_number,
                    frame_width: frame.width(),
                    frame_height: frame.height(),
                    detections,
                    inference_duration,
                    model_identifier: detector.model_identifier(),
                    device_used: detector.active_device(),
                };
                WorkerEvent::Completed { frame, result }
            }
            Err(error) => {
                consecutive += 1;
                tracing::warn!(
                    "⚠️ 推理失败 #{} ({}/{}): {}",
                    frame.sequence_number,
                    consecutive,
                    MAX_CONSECUTIVE_FAILURES,
                    error
                );
                if consecutive >= MAX_CONSECUTIVE_FAILURES {
                    shared.stopped.store(true, Ordering::Release);
                    let fatal = PipelineError::PipelineFailure(format!(
                        "{consecutive} consecutive inference failures, last: {error}"
                    ));
                    tracing::error!("❌ {}", fatal);
                    let _ = events.send(WorkerEvent::Fatal(fatal));
                    break;
                }
                WorkerEvent::Failed {
                    sequence_number: frame.sequence_number,
                    error,
                    consecutive,
                }
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }

    tracing::debug!("🔍 推理线程退出");
    detector
}
