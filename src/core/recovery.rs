//! 错误恢复引擎
//!
//! 每个编排循环持有一个 RecoveryEngine：记录本轮的失败历史，并把 ToolError 映射为 RecoveryAction。
//! 升级规则：
//! - 连续两次相同失败 -> Abort
//! - HandleError 第二次出现 -> Abort
//! - 同一工具执行失败 / 超时第二次出现 -> Abort
//! - 有副作用的工具执行失败 / 超时 -> 立即 Abort（不允许重试）

use std::collections::HashMap;

use crate::core::{RecoveryAction, ToolError};
use crate::tools::SideEffect;

/// 失败的「身份」：用于判断两次失败是否相同
#[derive(Debug, Clone, PartialEq, Eq)]
enum FailureKey {
    UnknownTool,
    Schema {
        tool: String,
        field: String,
        reason: String,
    },
    Handle,
    Execution(String),
    Malformed,
}

impl FailureKey {
    fn of(err: &ToolError) -> Self {
        match err {
            ToolError::UnknownTool(_) => Self::UnknownTool,
            ToolError::Schema {
                tool,
                field,
                reason,
            } => Self::Schema {
                tool: tool.clone(),
                field: field.clone(),
                reason: reason.clone(),
            },
            ToolError::Handle(_) => Self::Handle,
            ToolError::Execution { tool, .. } => Self::Execution(tool.clone()),
            ToolError::Timeout(tool) => Self::Execution(tool.clone()),
            ToolError::MalformedOutput(_) => Self::Malformed,
        }
    }
}

/// 语义化错误恢复：将工具层错误映射为 Observe / Abort
#[derive(Debug, Default)]
pub struct RecoveryEngine {
    last_failure: Option<FailureKey>,
    handle_failures: usize,
    execution_failures: HashMap<String, usize>,
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 工具成功执行后调用，打断「连续失败」链
    pub fn record_success(&mut self) {
        self.last_failure = None;
    }

    /// 根据错误与历史返回动作；side_effect 为出错工具的副作用类别（未知工具为 None）
    pub fn handle(&mut self, err: &ToolError, side_effect: Option<SideEffect>) -> RecoveryAction {
        let key = FailureKey::of(err);
        let repeated = self.last_failure.as_ref() == Some(&key);
        self.last_failure = Some(key.clone());

        if repeated {
            return RecoveryAction::Abort(format!(
                "The same error occurred twice in a row: {err}"
            ));
        }

        match &key {
            FailureKey::Handle => {
                self.handle_failures += 1;
                if self.handle_failures >= 2 {
                    return RecoveryAction::Abort(format!(
                        "Pipe handles could not be resolved repeatedly: {err}"
                    ));
                }
            }
            FailureKey::Execution(tool) => {
                if side_effect == Some(SideEffect::Mutating) {
                    return RecoveryAction::Abort(format!(
                        "Tool '{tool}' modifies data and failed; it will not be retried: {err}"
                    ));
                }
                let count = self.execution_failures.entry(tool.clone()).or_insert(0);
                *count += 1;
                if *count >= 2 {
                    return RecoveryAction::Abort(format!(
                        "Tool '{tool}' failed again: {err}"
                    ));
                }
            }
            _ => {}
        }

        RecoveryAction::Observe(observation_for(err))
    }
}

/// 给 LLM 的结构化错误观察
fn observation_for(err: &ToolError) -> String {
    let hint = match err {
        ToolError::Schema { .. } => "Fix the arguments and call the tool again.",
        ToolError::UnknownTool(_) => "Only call tools from the available tool list.",
        ToolError::Handle(_) => {
            "The referenced result is no longer available. Re-run the tool that produced it, or ask the user."
        }
        ToolError::Execution { .. } => {
            "The tool reported a failure. You may retry once with different arguments or explain the problem."
        }
        ToolError::Timeout(_) => "The tool did not finish in time. Try a narrower request or explain the problem.",
        ToolError::MalformedOutput(_) => {
            "Reply with exactly one JSON object: {\"tool\": ..., \"args\": {...}} or {\"answer\": ...}."
        }
    };
    serde_json::json!({
        "error": err.kind(),
        "detail": err.to_string(),
        "hint": hint,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HandleError;

    #[test]
    fn test_unknown_tool_twice_in_a_row_aborts() {
        let mut engine = RecoveryEngine::new();
        let first = engine.handle(&ToolError::UnknownTool("fooTool".into()), None);
        assert!(matches!(first, RecoveryAction::Observe(ref o) if o.contains("unknown_tool")));
        let second = engine.handle(&ToolError::UnknownTool("barTool".into()), None);
        assert!(matches!(second, RecoveryAction::Abort(_)));
    }

    #[test]
    fn test_success_resets_consecutive_chain() {
        let mut engine = RecoveryEngine::new();
        let err = ToolError::schema("search", "query", "expected string");
        assert!(matches!(engine.handle(&err, Some(SideEffect::PureQuery)), RecoveryAction::Observe(_)));
        engine.record_success();
        assert!(matches!(engine.handle(&err, Some(SideEffect::PureQuery)), RecoveryAction::Observe(_)));
    }

    #[test]
    fn test_different_schema_errors_are_not_identical() {
        let mut engine = RecoveryEngine::new();
        let a = ToolError::schema("search", "query", "expected string");
        let b = ToolError::schema("search", "limit", "expected integer");
        assert!(matches!(engine.handle(&a, None), RecoveryAction::Observe(_)));
        assert!(matches!(engine.handle(&b, None), RecoveryAction::Observe(_)));
    }

    #[test]
    fn test_execution_failure_escalates_on_repeat() {
        let mut engine = RecoveryEngine::new();
        let err = ToolError::Execution {
            tool: "blast".into(),
            message: "upstream down".into(),
        };
        assert!(matches!(engine.handle(&err, Some(SideEffect::PureQuery)), RecoveryAction::Observe(_)));
        engine.record_success();
        let timeout = ToolError::Timeout("blast".into());
        assert!(matches!(engine.handle(&timeout, Some(SideEffect::PureQuery)), RecoveryAction::Abort(_)));
    }

    #[test]
    fn test_mutating_failure_aborts_immediately() {
        let mut engine = RecoveryEngine::new();
        let err = ToolError::Execution {
            tool: "quarantine".into(),
            message: "db locked".into(),
        };
        assert!(matches!(engine.handle(&err, Some(SideEffect::Mutating)), RecoveryAction::Abort(_)));
    }

    #[test]
    fn test_handle_error_escalates_on_second_occurrence() {
        let mut engine = RecoveryEngine::new();
        let err = ToolError::Handle(HandleError::Unknown("abc".into()));
        assert!(matches!(engine.handle(&err, None), RecoveryAction::Observe(_)));
        engine.record_success();
        assert!(matches!(engine.handle(&err, None), RecoveryAction::Abort(_)));
    }
}
