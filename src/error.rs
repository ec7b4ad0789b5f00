// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线错误类型 (Pipeline errors)
//!
//! 单帧错误 (CaptureError / InferenceError) 只记录并计数,不会中断流水线;
//! PipelineFailure 是唯一的致命错误,会把当前会话切换到 Stopped。

use thiserror::Error;

/// 流水线统一错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// 摄像头/文件无法打开 (start 失败,可重试或切换输入源)
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// 单帧读取失败 (记录后继续)
    #[error("capture error: {0}")]
    CaptureError(String),

    /// 单帧推理失败 (该帧不计入统计)
    #[error("inference error: {0}")]
    InferenceError(String),

    /// 连续推理失败升级而来的致命错误
    #[error("pipeline failure: {0}")]
    PipelineFailure(String),

    /// 命令与当前会话状态不符
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// 参数/命令格式错误
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 未知的导出格式
    #[error("unsupported export format: {0:?}")]
    UnsupportedFormat(String),

    /// 模型文件不可用
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("image error: {0}")]
    Image(String),
}

impl PipelineError {
    /// 是否为致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::PipelineFailure(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(e: image::ImageError) -> Self {
        PipelineError::Image(e.to_string())
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
