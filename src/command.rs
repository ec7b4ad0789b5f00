// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 控制命令 (CommandSource)
//!
//! 文本命令格式 (一行一条):
//! ```text
//! start <source>        switch <source>       pause | resume | stop
//! snapshot              conf <0..1>           iou <0..1>
//! skip <0..5>           device <cpu|gpu|auto> model <n|s|m|l|x>
//! export <json|csv|txt|yolo> [path]           status | quit
//! ```

use std::io::{self, BufRead};
use std::path::PathBuf;

use crossbeam_channel::Receiver;

use crate::detection::{Device, ModelTier};
use crate::error::{PipelineError, Result};
use crate::input::SourceDescriptor;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(SourceDescriptor),
    Pause,
    Resume,
    Stop,
    SwitchSource(SourceDescriptor),
    Snapshot,
    SetConfidence(f32),
    SetIou(f32),
    SetSkipLevel(u8),
    SetDevice(Device),
    SetModel(ModelTier),
    /// 格式在执行时解析,未知格式报 UnsupportedFormat
    Export {
        format: String,
        path: Option<PathBuf>,
    },
    Status,
    Quit,
}

/// 命令来源; 返回 None 表示命令流结束
pub trait CommandSource: Send {
    fn next_command(&mut self) -> Option<Command>;
}

impl CommandSource for Receiver<Command> {
    fn next_command(&mut self) -> Option<Command> {
        self.recv().ok()
    }
}

/// 解析一行命令; 空行和 `#` 注释返回 None
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };
    let verb = verb.to_lowercase();

    let cmd = match verb.as_str() {
        "start" | "open" => Command::Start(arg(&verb, rest, "source")?.parse()?),
        "switch" | "switch_source" | "source" => Command::SwitchSource(arg(&verb, rest, "source")?.parse()?),
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "stop" => Command::Stop,
        "snapshot" | "snap" => Command::Snapshot,
        "conf" | "confidence" | "set_confidence" => Command::SetConfidence(ratio(&verb, rest)?),
        "iou" | "set_iou" => Command::SetIou(ratio(&verb, rest)?),
        "skip" | "set_skip_level" => Command::SetSkipLevel(
            arg(&verb, rest, "level")?
                .parse::<u8>()
                .map_err(|e| PipelineError::InvalidArgument(format!("{verb}: {e}")))?,
        ),
        "device" | "set_device" => Command::SetDevice(arg(&verb, rest, "device")?.parse()?),
        "model" | "set_model" => Command::SetModel(arg(&verb, rest, "model")?.parse()?),
        "export" => {
            let mut parts = arg(&verb, rest, "format")?.splitn(2, char::is_whitespace);
            let format = parts.next().unwrap_or_default().to_string();
            let path = parts.next().map(str::trim).filter(|p| !p.is_empty()).map(PathBuf::from);
            Command::Export { format, path }
        }
        "status" => Command::Status,
        "quit" | "exit" | "q" => Command::Quit,
        other => {
            return Err(PipelineError::InvalidArgument(format!("unknown command {other:?}")))
        }
    };
    Ok(Some(cmd))
}

fn arg<'a>(verb: &str, rest: &'a str, what: &str) -> Result<&'a str> {
    if rest.is_empty() {
        Err(PipelineError::InvalidArgument(format!("{verb}: missing {what}")))
    } else {
        Ok(rest)
    }
}

fn ratio(verb: &str, rest: &str) -> Result<f32> {
    arg(verb, rest, "threshold")?
        .parse::<f32>()
        .map_err(|e| PipelineError::InvalidArgument(format!("{verb}: {e}")))
}

/// 按行读取命令 (标准输入或任意 BufRead); 无法解析的行打印警告后跳过
pub struct LineCommands<R> {
    reader: R,
}

impl LineCommands<io::BufReader<io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(io::BufReader::new(io::stdin()))
    }
}

impl<R: BufRead + Send> LineCommands<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead + Send> CommandSource for LineCommands<R> {
    fn next_command(&mut self) -> Option<Command> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => match parse_command(&line) {
                    Ok(Some(cmd)) => return Some(cmd),
                    Ok(None) => continue,
                    Err(e) => tracing::warn!("⚠️ {}", e),
                },
                Err(e) => {
                    tracing::error!("❌ 读取命令失败: {}", e);
                    return None;
                }
            }
        }
    }
}
