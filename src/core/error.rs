//! 编排错误类型与恢复动作
//!
//! 分两层：ToolError 是「可观察」的错误（回灌给 LLM 自我纠正），AgentError 是终止性 / 调用方错误。
//! 与 RecoveryEngine 配合：根据 ToolError 与本轮失败历史决定 Observe 还是 Abort。

use thiserror::Error;

use crate::memory::HandleError;

/// 工具层错误：全部可恢复，作为结构化 Observation 交给 LLM
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    /// 参数缺失 / 类型不符 / 不在枚举内
    #[error("Schema error in {tool}.{field}: {reason}")]
    Schema {
        tool: String,
        field: String,
        reason: String,
    },

    /// 模型臆造的工具名，或不在当前可用目录内
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),

    #[error("Tool execution failed: {tool}: {message}")]
    Execution { tool: String, message: String },

    #[error("Tool timeout: {0}")]
    Timeout(String),

    /// 模型输出了无法解析的 JSON
    #[error("Malformed model output: {0}")]
    MalformedOutput(String),
}

impl ToolError {
    pub fn schema(tool: &str, field: &str, reason: impl Into<String>) -> Self {
        Self::Schema {
            tool: tool.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// 缺少必填字段（Direct 模式据此返回表单而非报错）
    pub fn is_missing_required(&self) -> bool {
        matches!(self, Self::Schema { reason, .. } if reason == MISSING_REQUIRED)
    }

    /// 错误类别名，用于日志与事件
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "schema_error",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Handle(_) => "handle_error",
            Self::Execution { .. } => "tool_execution_error",
            Self::Timeout(_) => "timeout",
            Self::MalformedOutput(_) => "malformed_output",
        }
    }
}

/// SchemaError 中「缺少必填字段」的固定 reason
pub const MISSING_REQUIRED: &str = "missing required field";

/// 工具注册错误（启动期）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    DuplicateName(String),

    #[error("Tool {tool}: unknown type '{ty}' for field '{field}'")]
    UnknownType {
        tool: String,
        field: String,
        ty: String,
    },

    #[error("Tool {tool}: required field '{field}' is not declared in properties")]
    UndeclaredRequired { tool: String, field: String },
}

/// 编排运行中的终止性错误与调用方错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("LLM request timed out after {0}s")]
    LlmTimeout(u64),

    #[error("Step budget exceeded ({0} steps)")]
    StepBudgetExceeded(usize),

    #[error("Stopped after unrecoverable tool failure: {0}")]
    RepeatedFailure(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// 恢复引擎根据错误类型与历史给出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 作为 Observation 注入下一轮 THINKING，让 LLM 自行纠正
    Observe(String),
    /// 结束循环（FAILED），附人类可读原因
    Abort(String),
}
