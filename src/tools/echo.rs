//! Echo 工具（联调 / 测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{InputSchema, ParamSpec, Tool, ToolOutput};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing the tool pipeline)."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new().required_param("text", ParamSpec::new("string").describe("Text to echo"))
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, String> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(ToolOutput::text(text))
    }
}
