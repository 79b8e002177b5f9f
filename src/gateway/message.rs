//! 会话消息协议
//!
//! 入站 `{type: message | cancel | rerun_tool | set_model | get_history}`，
//! 出站 `{type: init | progress | message | cancelled | widget_data | model_changed | history | error}`。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::HistoryEntry;
use crate::react::{LoopOutcome, LoopStatus, ProgressEvent, Widget};

/// 客户端 -> 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// 新的顶层用户消息
    Message { content: String },
    /// 请求取消当前循环（建议性，总会得到 cancelled 确认）
    Cancel,
    /// 以记录的参数经 Direct 模式重跑某一步，刷新 stale 组件
    RerunTool {
        tool: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        message_index: Option<usize>,
    },
    SetModel { model_id: String },
    GetHistory {
        #[serde(default)]
        limit: Option<usize>,
    },
}

/// 会话 -> 客户端
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Init {
        session_id: String,
        /// 全部工具元数据（含 hidden，供前端渲染）
        tools: Vec<Value>,
        models: Vec<String>,
        current_model: String,
        help: String,
    },
    Progress(ProgressEvent),
    /// 循环结束（DONE / FAILED / CANCELLED），带完整链供重跑
    Message {
        #[serde(flatten)]
        outcome: LoopOutcome,
        model: String,
        /// 该回复在历史中的下标（rerun 时回传）
        message_index: usize,
    },
    Cancelled,
    WidgetData {
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_index: Option<usize>,
        status: LoopStatus,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        widget: Option<Widget>,
    },
    ModelChanged { model_id: String },
    History { entries: Vec<HistoryEntry> },
    Error { code: String, message: String },
}

impl Outbound {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// 事件类型名（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Progress(_) => "progress",
            Self::Message { .. } => "message",
            Self::Cancelled => "cancelled",
            Self::WidgetData { .. } => "widget_data",
            Self::ModelChanged { .. } => "model_changed",
            Self::History { .. } => "history",
            Self::Error { .. } => "error",
        }
    }
}
