//! Planner：system prompt 组装与模型输出解析
//!
//! 模型每轮只能输出一个 JSON：`{"tool": ..., "args": {...}}` 或 `{"answer": ..., "render": ...}`；
//! 不含 JSON 的纯文本视为最终回答，看起来像 JSON 却解析失败的视为 Malformed（可恢复）。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::{PipeHandle, HANDLE_PREFIX};
use crate::tools::{action_formats_schema_json, ToolDescriptor, ToolRegistry};

/// LLM 返回的 Tool Call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 解析后的模型动作
#[derive(Debug, Clone, PartialEq)]
pub enum ModelAction {
    ToolCall(ToolCall),
    /// 最终回答；render 为要以组件展示其最近结果的工具名
    FinalAnswer { text: String, render: Option<String> },
    Malformed(String),
}

#[derive(Deserialize)]
struct RawAction {
    tool: Option<String>,
    #[serde(default)]
    args: Value,
    answer: Option<String>,
    render: Option<String>,
}

/// 解析模型输出
pub fn parse_model_output(output: &str) -> ModelAction {
    let trimmed = output.trim();

    // 提取 JSON 块（```json ... ``` 或 {...}）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        match trimmed.rfind('}') {
            Some(end) if end > start => &trimmed[start..=end],
            _ => &trimmed[start..],
        }
    } else {
        return ModelAction::FinalAnswer {
            text: trimmed.to_string(),
            render: None,
        };
    };

    let looks_structured = trimmed.starts_with('{') || trimmed.contains("```json");
    match serde_json::from_str::<RawAction>(json_str) {
        Ok(RawAction {
            tool: Some(tool),
            args,
            ..
        }) if !tool.trim().is_empty() => ModelAction::ToolCall(ToolCall {
            tool: tool.trim().to_string(),
            args,
        }),
        Ok(RawAction {
            answer: Some(text),
            render,
            ..
        }) => ModelAction::FinalAnswer {
            text,
            render: render.filter(|r| !r.trim().is_empty()),
        },
        Ok(_) if looks_structured => {
            ModelAction::Malformed(format!("expected \"tool\" or \"answer\" in {json_str}"))
        }
        Err(e) if looks_structured => ModelAction::Malformed(format!("{e}: {json_str}")),
        _ => ModelAction::FinalAnswer {
            text: trimmed.to_string(),
            render: None,
        },
    }
}

const BASE_PROMPT: &str = "You are the orchestration assistant of a lab sequence database. \
Answer the user's request, calling tools when they help. \
Reply with exactly ONE JSON object per turn and nothing else.";

/// 组装 THINKING 的 system prompt：可用工具目录 + 已有结果引用（只有标签）+ 可选提示
pub fn system_prompt(
    catalog: &[Arc<ToolDescriptor>],
    handles: &[PipeHandle],
    hint: Option<&str>,
) -> String {
    let mut sections = vec![BASE_PROMPT.to_string()];

    if catalog.is_empty() {
        sections.push(
            "No tools are available for this turn. Reply with a final answer: {\"answer\": \"...\"}."
                .to_string(),
        );
    } else {
        sections.push(format!(
            "## Available tools\n{}",
            ToolRegistry::to_schema_json(catalog)
        ));
    }

    sections.push(format!(
        "## Output format (JSON Schema)\n{}\n\
         To call a tool: {{\"tool\": \"name\", \"args\": {{...}}}}\n\
         To finish: {{\"answer\": \"text for the user\", \"render\": \"optional tool name whose last result to display\"}}",
        action_formats_schema_json()
    ));

    if !handles.is_empty() {
        let lines: Vec<String> = handles
            .iter()
            .map(|h| format!("- {} : {}", h.reference(), h.label))
            .collect();
        sections.push(format!(
            "## Stored results\nPass a stored result to a tool by using its reference as an argument value, \
             e.g. \"{HANDLE_PREFIX}<id>\" for the whole result or \"{HANDLE_PREFIX}<id>.<field>\" for one field. \
             Never copy result contents yourself.\n{}",
            lines.join("\n")
        ));
    }

    if let Some(tool) = hint {
        sections.push(format!(
            "## Hint\nThe user asked for the `{tool}` tool. Use it first if it fits the request."
        ));
    }

    sections.join("\n\n")
}
