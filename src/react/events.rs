//! 编排循环进度事件：每次 THINKING -> TOOL_EXEC 与 TOOL_EXEC -> THINKING 迁移时推送

use serde::Serialize;

/// 进度快照（可序列化为 JSON 供前端展示，避免慢工具看起来像卡死）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// LoopPhase::as_str()："thinking" / "tool"
    pub phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub steps_used: usize,
    pub step_budget: usize,
    /// 本轮已调用的工具（按顺序）
    pub tools_used: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}
