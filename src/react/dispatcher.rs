//! Dispatcher：把用户输入分为三种入口模式
//!
//! 1. Direct（`//tool payload`）：纯校验 + 执行，不调用 LLM；参数不全返回表单
//! 2. Guided（`/tool text` 或首词即为工具名）：首轮只提供该工具，仍由 LLM 提参并可继续串联
//! 3. Free-text（其余，包括 `/help`）：不加提示

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::core::ToolError;
use crate::react::loop_::{LoopOutcome, LoopStatus, Orchestrator};
use crate::react::{FormArtifact, Widget};
use crate::tools::ToolRegistry;

/// 分类结果
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Direct { tool: String, payload: Option<Value> },
    Guided { tool: String, prompt: String },
    FreeText { text: String },
}

fn command_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(/{1,2})([A-Za-z_][\w-]*)\s*([\s\S]*)$").ok())
        .as_ref()
}

/// 参数文本：JSON 对象原样解析，其它非空文本视为 `{"query": text}`
pub fn parse_payload(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => Some(serde_json::json!({ "query": text })),
    }
}

/// 按优先级分类：Direct > Guided > Free-text
pub fn classify(registry: &ToolRegistry, text: &str) -> Dispatch {
    let trimmed = text.trim();

    if let Some(caps) = command_re().and_then(|re| re.captures(trimmed)) {
        let slashes = caps.get(1).map_or("", |m| m.as_str());
        let tool = caps.get(2).map_or("", |m| m.as_str()).to_string();
        let rest = caps.get(3).map_or("", |m| m.as_str()).trim();

        if slashes == "//" {
            return Dispatch::Direct {
                tool,
                payload: parse_payload(rest),
            };
        }
        match registry.descriptor(&tool) {
            Some(d) if d.is_hidden() => {
                return Dispatch::Direct {
                    tool,
                    payload: parse_payload(rest),
                }
            }
            Some(_) => {
                let prompt = if rest.is_empty() {
                    format!("Use the {tool} tool.")
                } else {
                    format!("Use the {tool} tool: {rest}")
                };
                return Dispatch::Guided { tool, prompt };
            }
            None => {}
        }
    } else if let Some(first) = trimmed.split_whitespace().next() {
        if registry.descriptor(first).is_some_and(|d| !d.is_hidden()) {
            return Dispatch::Guided {
                tool: first.to_string(),
                prompt: trimmed.to_string(),
            };
        }
    }

    Dispatch::FreeText {
        text: trimmed.to_string(),
    }
}

fn direct_outcome(status: LoopStatus, message: String, widget: Option<Widget>) -> LoopOutcome {
    LoopOutcome {
        status,
        message,
        chain: Vec::new(),
        widget,
        widget_step: None,
        steps_used: 0,
        prompt_tokens: 0,
        completion_tokens: 0,
    }
}

fn form_outcome(form: FormArtifact) -> LoopOutcome {
    let message = if form.missing.is_empty() {
        format!("Please provide parameters for **{}**.", form.tool)
    } else {
        format!(
            "Please provide parameters for **{}** (missing: {}).",
            form.tool,
            form.missing.join(", ")
        )
    };
    direct_outcome(LoopStatus::Done, message, Some(Widget::AwaitingParams { form }))
}

/// Direct 模式执行：不调用 LLM；缺必填参数返回表单；成功返回一个链步骤与 fresh 组件
pub async fn execute_direct(
    orchestrator: &Orchestrator,
    session_id: &str,
    tool: &str,
    payload: Option<Value>,
) -> LoopOutcome {
    let Some(descriptor) = orchestrator.registry().descriptor(tool) else {
        return direct_outcome(
            LoopStatus::Failed,
            format!("Unknown tool: {tool}. Type /help for the available commands."),
            None,
        );
    };

    let payload = match payload {
        Some(p) => p,
        None if descriptor.input_schema.has_required() => {
            return form_outcome(FormArtifact::new(&descriptor, Value::Object(Default::default())));
        }
        None => Value::Object(Default::default()),
    };

    let run = orchestrator
        .run_tool(session_id, &descriptor, payload.clone())
        .await;
    match run.result {
        Ok(output) => {
            let message = run.step.result_summary.clone();
            let mut outcome = direct_outcome(
                LoopStatus::Done,
                message,
                Some(Widget::fresh(&output.widget_type, output.data)),
            );
            outcome.chain.push(run.step);
            outcome.widget_step = Some(0);
            outcome.steps_used = 1;
            outcome
        }
        Err(err) if err.is_missing_required() => form_outcome(FormArtifact::new(&descriptor, payload)),
        Err(ToolError::Schema { field, reason, .. }) => direct_outcome(
            LoopStatus::Failed,
            format!("Invalid parameter '{field}' for {tool}: {reason}"),
            None,
        ),
        Err(err @ ToolError::Handle(_)) => direct_outcome(LoopStatus::Failed, err.to_string(), None),
        Err(err) => {
            let mut outcome = direct_outcome(LoopStatus::Failed, err.to_string(), None);
            outcome.chain.push(run.step);
            outcome.steps_used = 1;
            outcome
        }
    }
}
