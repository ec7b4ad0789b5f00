// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 帧处理流水线 (Frame Pipeline)
///
/// 三线程架构,通过 crossbeam 通道通信:
/// - acquisition: 读帧 + 跳帧决策 + 提交推理 (从不等待推理)
/// - inference:   目标检测 (同一时刻最多一个推理)
/// - consumer:    统计 + 标注 + 渲染
///
/// 命令由 [`PipelineCoordinator`] 串行执行。
pub mod coordinator;
pub mod session;
pub mod skip;
pub mod stats;
pub mod worker;

pub use coordinator::{CommandOutcome, Completion, CoordinatorSettings, PipelineCoordinator};
pub use session::{CounterSnapshot, PipelineState, PipelineStatus, Session, SessionObserver};
pub use skip::{FrameSkipController, SkipDecision, MAX_SKIP_LEVEL};
pub use stats::{Statistics, StatisticsAggregator, DEFAULT_HISTORY_CAP};
pub use worker::{InferenceWorker, SubmitError, WorkerEvent, WorkerHandle, MAX_CONSECUTIVE_FAILURES};
