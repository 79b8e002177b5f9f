//! 编排循环状态机
//!
//! INIT -> THINKING -> (TOOL_EXEC -> THINKING)* -> DONE | CANCELLED | FAILED

use serde::Serialize;

/// 循环阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Init,
    Thinking,
    ToolExec,
    Done,
    Cancelled,
    Failed,
}

impl LoopPhase {
    /// 状态迁移是否合法
    pub fn can_transition(self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        match (self, next) {
            (Init, Thinking) => true,
            (Init, Cancelled) | (Init, Failed) => true,
            (Thinking, ToolExec) | (Thinking, Thinking) => true,
            (ToolExec, Thinking) => true,
            (Thinking, Done) | (Thinking, Cancelled) | (Thinking, Failed) => true,
            (ToolExec, Cancelled) | (ToolExec, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Thinking => "thinking",
            Self::ToolExec => "tool",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}
