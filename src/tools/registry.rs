//! 工具注册表
//!
//! 所有工具实现 Tool trait，由 ToolRegistry 按名注册；注册时生成不可变的 ToolDescriptor 并校验 Schema。
//! 启动后只读，多个会话的编排循环可并发读取。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::{RegistryError, ToolError};
use crate::tools::summary;
use crate::tools::InputSchema;

/// 不进入 LLM 目录与用户列表的标签
pub const HIDDEN_TAG: &str = "hidden";

/// 副作用类别：有副作用的工具永不自动重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    PureQuery,
    Mutating,
}

/// 工具执行结果：数据 + 组件类型（须与 output_contract 一致）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub data: Value,
    pub widget_type: String,
}

impl ToolOutput {
    pub fn new(data: Value, widget_type: &str) -> Self {
        Self {
            data,
            widget_type: widget_type.to_string(),
        }
    }

    /// 纯文本结果（widget = "text"）
    pub fn text(message: impl Into<String>) -> Self {
        Self::new(serde_json::json!({ "content": message.into() }), "text")
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、输入 Schema、输出契约、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（注册表主键，也是 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 与帮助列表）
    fn description(&self) -> &str;

    /// 输入 Schema，默认无参数
    fn input_schema(&self) -> InputSchema {
        InputSchema::default()
    }

    /// 输出契约：结果遵循的渲染形状标签
    fn output_contract(&self) -> &str {
        "text"
    }

    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    fn side_effect(&self) -> SideEffect {
        SideEffect::PureQuery
    }

    /// 本工具之后下一轮允许的工具；Some(空) 表示终端工具，下一轮强制文本回复
    fn next_tools(&self) -> Option<Vec<String>> {
        None
    }

    /// 面向历史 / 回放的简短结果摘要
    fn format_result(&self, output: &ToolOutput) -> String {
        summary::short_summary(self.name(), &output.data)
    }

    /// 执行工具；params 已经过 Schema 校验，pipe handle 已替换为实际数据
    async fn execute(&self, params: Value) -> Result<ToolOutput, String>;
}

/// 注册时生成的不可变描述
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    pub output_contract: String,
    pub tags: BTreeSet<String>,
    pub side_effect: SideEffect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_tools: Option<BTreeSet<String>>,
}

impl ToolDescriptor {
    pub fn is_hidden(&self) -> bool {
        self.tags.contains(HIDDEN_TAG)
    }

    /// 发送给前端的元数据
    pub fn metadata(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "widget": self.output_contract,
            "tags": self.tags,
        })
    }

    /// 供 LLM 的工具条目
    pub fn llm_entry(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.input_schema.to_json_schema(),
        })
    }
}

struct Entry {
    descriptor: Arc<ToolDescriptor>,
    tool: Arc<dyn Tool>,
}

/// 工具注册表：按名称有序存储，支持 register / get / catalog / validate
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；名称冲突或 Schema 不合法时失败
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        let input_schema = tool.input_schema();
        input_schema.check_well_formed(&name)?;

        let descriptor = ToolDescriptor {
            name: name.clone(),
            description: tool.description().to_string(),
            input_schema,
            output_contract: tool.output_contract().to_string(),
            tags: tool.tags().into_iter().collect(),
            side_effect: tool.side_effect(),
            next_tools: tool.next_tools().map(|v| v.into_iter().collect()),
        };
        tracing::debug!(tool = %name, hidden = descriptor.is_hidden(), "tool registered");
        self.tools.insert(
            name,
            Entry {
                descriptor: Arc::new(descriptor),
                tool,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).map(|e| Arc::clone(&e.descriptor))
    }

    /// 工具目录；for_model 为 true 时排除 hidden（即暴露给 LLM 的全部可选动作）
    pub fn catalog(&self, for_model: bool) -> Vec<Arc<ToolDescriptor>> {
        self.tools
            .values()
            .filter(|e| !for_model || !e.descriptor.is_hidden())
            .map(|e| Arc::clone(&e.descriptor))
            .collect()
    }

    /// 执行前的参数校验，返回规范化后的参数
    pub fn validate(&self, name: &str, params: &Value) -> Result<Value, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        entry.descriptor.input_schema.validate(name, params)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 全部工具元数据（前端初始化）
    pub fn metadata(&self) -> Vec<Value> {
        self.catalog(false).iter().map(|d| d.metadata()).collect()
    }

    /// 帮助文本：列出用户可见工具
    pub fn help_text(&self) -> String {
        let mut lines = vec!["**Available commands:**".to_string(), String::new()];
        for d in self.catalog(true) {
            lines.push(format!("- **/{}** - {}", d.name, d.description));
        }
        lines.push(String::new());
        lines.push(
            "Prefix with `//` for direct execution (no LLM), e.g. `//search {\"query\": \"ampicillin\"}`."
                .to_string(),
        );
        lines.join("\n")
    }

    /// 动态生成工具目录 JSON（仅包含给定描述）
    pub fn to_schema_json(descriptors: &[Arc<ToolDescriptor>]) -> String {
        let tools: Vec<Value> = descriptors.iter().map(|d| d.llm_entry()).collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, ParamSpec};
    use serde_json::json;

    struct SecretTool;

    #[async_trait]
    impl Tool for SecretTool {
        fn name(&self) -> &str {
            "secret"
        }
        fn description(&self) -> &str {
            "internal"
        }
        fn tags(&self) -> Vec<String> {
            vec![HIDDEN_TAG.to_string()]
        }
        async fn execute(&self, _params: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text("ok"))
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "bad schema"
        }
        fn input_schema(&self) -> InputSchema {
            InputSchema::new().required_param("x", ParamSpec::new("float"))
        }
        async fn execute(&self, _params: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text("never"))
        }
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_schema() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        assert_eq!(
            reg.register(EchoTool),
            Err(RegistryError::DuplicateName("echo".into()))
        );
        assert!(matches!(
            reg.register(BrokenTool),
            Err(RegistryError::UnknownType { .. })
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_catalog_filters_hidden_for_model() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        reg.register(SecretTool).unwrap();
        let all: Vec<_> = reg.catalog(false).iter().map(|d| d.name.clone()).collect();
        let model: Vec<_> = reg.catalog(true).iter().map(|d| d.name.clone()).collect();
        assert_eq!(all, vec!["echo", "secret"]);
        assert_eq!(model, vec!["echo"]);
        assert!(!reg.help_text().contains("secret"));
    }

    #[test]
    fn test_validate_unknown_tool() {
        let reg = ToolRegistry::new();
        assert!(matches!(
            reg.validate("nope", &json!({})),
            Err(ToolError::UnknownTool(_))
        ));
    }
}
