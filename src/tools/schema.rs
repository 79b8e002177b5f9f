//! 工具输入 Schema 与参数校验
//!
//! InputSchema 采用 JSON Schema 的子集：`{type: object, properties: {...}, required: [...]}`，
//! 每个属性支持 type / description / default / enum / required（声明式写法）。
//! 另用 schemars 生成「模型输出格式」的 JSON Schema，拼入 system prompt，减少 LLM 输出格式错误。

use std::collections::{BTreeMap, HashMap};

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{RegistryError, ToolError, MISSING_REQUIRED};

/// 已知的参数类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }
}

/// 单个参数声明
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    /// 声明式必填标记，注册时并入 InputSchema::required
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

impl ParamSpec {
    pub fn new(ty: &str) -> Self {
        Self {
            ty: ty.to_string(),
            ..Self::default()
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn param_type(&self) -> Option<ParamType> {
        ParamType::from_tag(&self.ty)
    }
}

/// 工具输入 Schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, ParamSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// 可选参数
    pub fn param(mut self, name: &str, spec: ParamSpec) -> Self {
        self.properties.insert(name.to_string(), spec);
        self
    }

    /// 必填参数
    pub fn required_param(mut self, name: &str, spec: ParamSpec) -> Self {
        self.properties.insert(name.to_string(), spec);
        if !self.required.iter().any(|r| r == name) {
            self.required.push(name.to_string());
        }
        self
    }

    /// 从 JSON Schema 形状的 Value 解析（外部 / 声明式工具）
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    /// 合并声明式 required 标记后的完整必填列表
    pub fn required_fields(&self) -> Vec<String> {
        let mut fields = self.required.clone();
        for (name, spec) in &self.properties {
            if spec.required && !fields.contains(name) {
                fields.push(name.clone());
            }
        }
        fields
    }

    pub fn has_required(&self) -> bool {
        !self.required_fields().is_empty()
    }

    /// 注册期检查：类型标签已知、required 字段均已声明
    pub fn check_well_formed(&self, tool: &str) -> Result<(), RegistryError> {
        for (field, spec) in &self.properties {
            if spec.param_type().is_none() {
                return Err(RegistryError::UnknownType {
                    tool: tool.to_string(),
                    field: field.clone(),
                    ty: spec.ty.clone(),
                });
            }
        }
        for field in &self.required {
            if !self.properties.contains_key(field) {
                return Err(RegistryError::UndeclaredRequired {
                    tool: tool.to_string(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }

    /// 输出标准 JSON Schema（供 LLM 与表单渲染）
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, spec)| {
                let mut prop = Map::new();
                prop.insert("type".into(), Value::String(spec.ty.clone()));
                if let Some(d) = &spec.description {
                    prop.insert("description".into(), Value::String(d.clone()));
                }
                if let Some(d) = &spec.default {
                    prop.insert("default".into(), d.clone());
                }
                if let Some(e) = &spec.enum_values {
                    prop.insert("enum".into(), Value::Array(e.clone()));
                }
                (name.clone(), Value::Object(prop))
            })
            .collect();
        let mut schema = serde_json::json!({
            "type": "object",
            "properties": properties,
        });
        let required = self.required_fields();
        if !required.is_empty() {
            schema["required"] = serde_json::json!(required);
        }
        schema
    }

    /// 校验并规范化参数：去 null、补默认值、查必填、类型强制转换、枚举检查
    pub fn validate(&self, tool: &str, params: &Value) -> Result<Value, ToolError> {
        let mut obj = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(ToolError::schema(
                    tool,
                    "$",
                    format!("expected an object of parameters, got {}", type_name(other)),
                ))
            }
        };
        obj.retain(|_, v| !v.is_null());

        for (name, spec) in &self.properties {
            if !obj.contains_key(name) {
                if let Some(default) = &spec.default {
                    obj.insert(name.clone(), default.clone());
                }
            }
        }

        for field in self.required_fields() {
            if !obj.contains_key(&field) {
                return Err(ToolError::schema(tool, &field, MISSING_REQUIRED));
            }
        }

        for (name, spec) in &self.properties {
            let Some(value) = obj.get(name) else { continue };
            let ty = spec
                .param_type()
                .ok_or_else(|| ToolError::schema(tool, name, format!("unknown type '{}'", spec.ty)))?;
            let coerced = coerce(ty, value)
                .map_err(|reason| ToolError::schema(tool, name, reason))?;
            if let Some(allowed) = &spec.enum_values {
                if !allowed.contains(&coerced) {
                    return Err(ToolError::schema(
                        tool,
                        name,
                        format!("value {} is not one of {}", coerced, Value::Array(allowed.clone())),
                    ));
                }
            }
            obj.insert(name.clone(), coerced);
        }

        Ok(Value::Object(obj))
    }
}

/// 按声明类型强制转换：number / integer 接受数字字符串；array / object 仅检查形状
fn coerce(ty: ParamType, value: &Value) -> Result<Value, String> {
    match (ty, value) {
        (ParamType::String, Value::String(_)) => Ok(value.clone()),
        (ParamType::Number, Value::Number(_)) => Ok(value.clone()),
        (ParamType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("expected number, got '{s}'")),
        (ParamType::Integer, Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                Ok(value.clone())
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(Value::from(f as i64))
                    }
                    _ => Err(format!("expected integer, got {n}")),
                }
            }
        }
        (ParamType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("expected integer, got '{s}'")),
        (ParamType::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (ParamType::Array, Value::Array(_)) => Ok(value.clone()),
        (ParamType::Object, Value::Object(_)) => Ok(value.clone()),
        (ty, other) => Err(format!(
            "expected {}, got {}",
            expected_name(ty),
            type_name(other)
        )),
    }
}

fn expected_name(ty: ParamType) -> &'static str {
    match ty {
        ParamType::String => "string",
        ParamType::Number => "number",
        ParamType::Integer => "integer",
        ParamType::Boolean => "boolean",
        ParamType::Array => "array",
        ParamType::Object => "object",
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 工具调用格式：`{"tool": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须来自可用工具列表
    pub tool: String,
    /// 工具参数；可用 "@pipe:<id>" 引用先前结果
    pub args: HashMap<String, serde_json::Value>,
}

/// 最终回复格式：`{"answer": "...", "render": "tool"}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct FinalAnswerFormat {
    /// 给用户的自然语言回复
    pub answer: String,
    /// 可选：要以组件形式展示其最近结果的工具名
    pub render: Option<String>,
}

/// 返回两种合法输出格式的 JSON Schema 字符串，可拼入 system prompt
pub fn action_formats_schema_json() -> String {
    let formats = serde_json::json!({
        "tool_call": schema_for!(ToolCallFormat),
        "final_answer": schema_for!(FinalAnswerFormat),
    });
    serde_json::to_string_pretty(&formats).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_schema() -> InputSchema {
        InputSchema::new()
            .required_param("query", ParamSpec::new("string").describe("Search text"))
            .param("limit", ParamSpec::new("integer").with_default(json!(10)))
            .param("score", ParamSpec::new("number"))
            .param("tags", ParamSpec::new("array"))
            .param(
                "mode",
                ParamSpec::new("string").one_of(vec![json!("fast"), json!("full")]),
            )
    }

    #[test]
    fn test_defaults_and_numeric_coercion() {
        let schema = search_schema();
        let out = schema
            .validate("search", &json!({"query": "amp", "score": "0.5", "tags": null}))
            .unwrap();
        assert_eq!(out["limit"], json!(10));
        assert_eq!(out["score"], json!(0.5));
        assert!(out.get("tags").is_none());

        let out = schema
            .validate("search", &json!({"query": "amp", "limit": "25"}))
            .unwrap();
        assert_eq!(out["limit"], json!(25));
    }

    #[test]
    fn test_missing_required_is_schema_error() {
        let err = search_schema().validate("search", &json!({})).unwrap_err();
        assert!(err.is_missing_required());
        assert!(matches!(err, ToolError::Schema { ref field, .. } if field == "query"));
    }

    #[test]
    fn test_shape_violation_is_schema_error_not_panic() {
        let err = search_schema()
            .validate("search", &json!({"query": "x", "tags": "not-a-list"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::Schema { ref field, ref reason, .. }
            if field == "tags" && reason.contains("expected array")));

        let err = search_schema()
            .validate("search", &json!({"query": "x", "limit": "ten"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::Schema { ref field, .. } if field == "limit"));

        let err = search_schema().validate("search", &json!([1, 2])).unwrap_err();
        assert!(matches!(err, ToolError::Schema { ref field, .. } if field == "$"));
    }

    #[test]
    fn test_enum_violation() {
        let err = search_schema()
            .validate("search", &json!({"query": "x", "mode": "slow"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::Schema { ref field, .. } if field == "mode"));
    }

    #[test]
    fn test_well_formed_checks() {
        let bad_type = InputSchema::new().param("x", ParamSpec::new("text"));
        assert!(matches!(
            bad_type.check_well_formed("t"),
            Err(RegistryError::UnknownType { .. })
        ));

        let mut undeclared = InputSchema::new();
        undeclared.required.push("ghost".into());
        assert!(matches!(
            undeclared.check_well_formed("t"),
            Err(RegistryError::UndeclaredRequired { .. })
        ));
    }

    #[test]
    fn test_declarative_required_flag() {
        let schema = InputSchema::from_json(&json!({
            "properties": {
                "sequence": {"type": "string", "required": true},
                "table": {"type": "integer", "default": 1}
            }
        }))
        .unwrap();
        assert_eq!(schema.required_fields(), vec!["sequence".to_string()]);
        let js = schema.to_json_schema();
        assert_eq!(js["required"], json!(["sequence"]));
        assert_eq!(js["properties"]["table"]["default"], json!(1));
    }

    #[test]
    fn test_action_formats_schema_mentions_both_formats() {
        let s = action_formats_schema_json();
        assert!(s.contains("tool_call"));
        assert!(s.contains("final_answer"));
    }
}
