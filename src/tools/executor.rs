//! 工具执行器
//!
//! 持有 ToolRegistry 与统一超时：execute(tool_name, params) 在截止时间内调用工具，
//! 超时或失败时转为 ToolError（Timeout / Execution）；纯查询工具超时可自动重试，有副作用的工具从不重试。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::ToolError;
use crate::tools::{SideEffect, ToolOutput, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 ToolError
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    query_retries: u32,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            query_retries: 1,
        }
    }

    /// 纯查询工具超时后的自动重试次数
    pub fn with_query_retries(mut self, retries: u32) -> Self {
        self.query_retries = retries;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行已校验的参数；输出的 widget_type 必须与 output_contract 一致
    pub async fn execute(&self, tool_name: &str, params: Value) -> Result<ToolOutput, ToolError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
        let descriptor = self
            .registry
            .descriptor(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        let attempts = match descriptor.side_effect {
            SideEffect::PureQuery => 1 + self.query_retries,
            SideEffect::Mutating => 1,
        };
        let args_preview = args_preview(&params);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = timeout(self.timeout, tool.execute(params.clone())).await;

            let outcome = match &result {
                Ok(Ok(_)) => "ok",
                Ok(Err(_)) => "error",
                Err(_) => "timeout",
            };
            let audit = serde_json::json!({
                "event": "tool_audit",
                "tool": tool_name,
                "ok": outcome == "ok",
                "outcome": outcome,
                "attempt": attempt,
                "duration_ms": start.elapsed().as_millis() as u64,
                "args_preview": args_preview,
            });
            tracing::info!(audit = %audit, "tool");

            match result {
                Ok(Ok(output)) => {
                    if output.widget_type != descriptor.output_contract {
                        return Err(ToolError::Execution {
                            tool: tool_name.to_string(),
                            message: format!(
                                "output contract violated: expected '{}', got '{}'",
                                descriptor.output_contract, output.widget_type
                            ),
                        });
                    }
                    return Ok(output);
                }
                Ok(Err(message)) => {
                    return Err(ToolError::Execution {
                        tool: tool_name.to_string(),
                        message,
                    })
                }
                Err(_) if attempt < attempts => {
                    tracing::warn!(tool = tool_name, attempt, "tool timed out, retrying");
                    continue;
                }
                Err(_) => return Err(ToolError::Timeout(tool_name.to_string())),
            }
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowTool {
        side_effect: SideEffect,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn side_effect(&self) -> SideEffect {
            self.side_effect
        }
        async fn execute(&self, _params: Value) -> Result<ToolOutput, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ToolOutput::text("late"))
        }
    }

    struct WrongContract;

    #[async_trait]
    impl Tool for WrongContract {
        fn name(&self) -> &str {
            "wrong"
        }
        fn description(&self) -> &str {
            "declares table, returns text"
        }
        fn output_contract(&self) -> &str {
            "table"
        }
        async fn execute(&self, _params: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text("oops"))
        }
    }

    fn executor_with(tool: impl Tool + 'static) -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register(tool).unwrap();
        ToolExecutor::with_timeout(Arc::new(reg), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_timeout_retries_pure_query_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor_with(SlowTool {
            side_effect: SideEffect::PureQuery,
            calls: Arc::clone(&calls),
        });
        let err = exec.execute("slow", Value::Null).await.unwrap_err();
        assert_eq!(err, ToolError::Timeout("slow".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mutating_tool_never_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor_with(SlowTool {
            side_effect: SideEffect::Mutating,
            calls: Arc::clone(&calls),
        });
        assert!(exec.execute("slow", Value::Null).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_output_contract_enforced() {
        let exec = executor_with(WrongContract);
        let err = exec.execute("wrong", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::Execution { ref message, .. } if message.contains("contract")));
    }
}
