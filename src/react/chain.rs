//! 执行链与组件状态
//!
//! ChainStep 在一次循环内只追加、不修改；每步记录工具名与已解析参数，客户端可经 Direct 模式原样重跑。
//! Widget 是显式三态：fresh（带数据）/ stale（需重跑）/ awaiting_params（等待表单）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{InputSchema, ToolDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    ToolError,
    SchemaError,
}

/// 组件描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Widget {
    /// 数据随组件下发
    Fresh { widget_type: String, data: Value },
    /// 数据未下发，客户端需用 tool + params 经 Direct 模式重跑
    Stale {
        widget_type: String,
        tool: String,
        params: Value,
    },
    /// 参数不全，等待用户填写表单
    AwaitingParams { form: FormArtifact },
}

impl Widget {
    pub fn fresh(widget_type: &str, data: Value) -> Self {
        Self::Fresh {
            widget_type: widget_type.to_string(),
            data,
        }
    }

    /// 数据序列化后不超过 threshold 字节则 fresh，否则 stale
    pub fn sized(widget_type: &str, data: Value, tool: &str, params: &Value, threshold: usize) -> Self {
        let bytes = serde_json::to_string(&data).map(|s| s.len()).unwrap_or(usize::MAX);
        if bytes <= threshold {
            Self::fresh(widget_type, data)
        } else {
            Self::Stale {
                widget_type: widget_type.to_string(),
                tool: tool.to_string(),
                params: params.clone(),
            }
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }

    pub fn widget_type(&self) -> Option<&str> {
        match self {
            Self::Fresh { widget_type, .. } | Self::Stale { widget_type, .. } => Some(widget_type),
            Self::AwaitingParams { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormState {
    AwaitingParams,
    Submitted,
}

/// Direct 模式参数不全时返回的表单：工具的输入 Schema + 已填写部分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormArtifact {
    pub tool: String,
    pub description: String,
    pub schema: InputSchema,
    /// 已给出的参数（预填）
    pub prefill: Value,
    /// 尚缺的必填字段
    pub missing: Vec<String>,
    pub state: FormState,
}

impl FormArtifact {
    pub fn new(descriptor: &ToolDescriptor, prefill: Value) -> Self {
        let missing = descriptor
            .input_schema
            .required_fields()
            .into_iter()
            .filter(|f| prefill.get(f).map_or(true, Value::is_null))
            .collect();
        Self {
            tool: descriptor.name.clone(),
            description: descriptor.description.clone(),
            schema: descriptor.input_schema.clone(),
            prefill,
            missing,
            state: FormState::AwaitingParams,
        }
    }

    /// 提交表单：返回作为新 Direct 消息重新进入 Dispatcher 的文本
    pub fn submit(&mut self, params: &Value) -> String {
        self.state = FormState::Submitted;
        format!("//{} {}", self.tool, params)
    }
}

/// 一次工具调用及其结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStep {
    pub tool_name: String,
    /// 已替换 handle 的参数
    pub resolved_params: Value,
    pub result_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget: Option<Widget>,
    pub status: StepStatus,
    /// 结果在 Pipe Cache 中的引用（仅成功步骤）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl ChainStep {
    pub fn failed(tool: &str, params: Value, status: StepStatus, reason: String) -> Self {
        Self {
            tool_name: tool.to_string(),
            resolved_params: params,
            result_summary: reason,
            widget: None,
            status,
            handle: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }
}
