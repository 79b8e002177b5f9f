//! 结果摘要
//!
//! 工具的完整输出只进 Pipe Cache；LLM 只看到紧凑的描述性统计（列表计数 + 样本、标量、截断字符串）。

use serde_json::{Map, Value};

/// 短字符串阈值：低于此长度的字符串原样保留
const SHORT_STRING_CHARS: usize = 200;
/// 长字符串截断长度
const LONG_STRING_PREVIEW: usize = 100;

/// 生成给 LLM 的紧凑摘要；token_limit 按 1 token ≈ 4 字符估算
pub fn summarize_for_model(data: &Value, token_limit: usize) -> String {
    let max_chars = token_limit * 4;
    let max_items = (token_limit / 50).max(5);
    let text = match data {
        Value::Object(map) => Value::Object(summarize_object(map, max_items)).to_string(),
        Value::Array(items) => serde_json::json!({
            "items_count": items.len(),
            "items_sample": items.iter().take(max_items).map(shallow).collect::<Vec<_>>(),
        })
        .to_string(),
        Value::String(s) => Value::String(truncate_string(s)).to_string(),
        other => other.to_string(),
    };
    truncate_chars(&text, max_chars)
}

fn summarize_object(map: &Map<String, Value>, max_items: usize) -> Map<String, Value> {
    let mut stats = Map::new();
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                stats.insert(format!("{key}_count"), Value::from(items.len()));
                if !items.is_empty() {
                    let sample: Vec<Value> = items.iter().take(max_items).map(shallow).collect();
                    stats.insert(format!("{key}_sample"), Value::Array(sample));
                }
            }
            Value::Number(_) | Value::Bool(_) => {
                stats.insert(key.clone(), value.clone());
            }
            Value::String(s) => {
                stats.insert(key.clone(), Value::String(truncate_string(s)));
            }
            Value::Object(inner) => {
                let scalars = scalar_fields(inner);
                if !scalars.is_empty() {
                    stats.insert(key.clone(), Value::Object(scalars));
                }
            }
            Value::Null => {}
        }
    }
    stats
}

/// 列表元素：对象只保留浅层短标量字段
fn shallow(item: &Value) -> Value {
    match item {
        Value::Object(map) => Value::Object(scalar_fields(map)),
        Value::String(s) => Value::String(truncate_string(s)),
        other => other.clone(),
    }
}

fn scalar_fields(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(_, v)| match v {
            Value::String(s) => s.chars().count() < SHORT_STRING_CHARS,
            Value::Number(_) | Value::Bool(_) | Value::Null => true,
            _ => false,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn truncate_string(s: &str) -> String {
    if s.chars().count() < SHORT_STRING_CHARS {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(LONG_STRING_PREVIEW).collect::<String>())
    }
}

pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Pipe handle 的人类可读标签：对象列出字段形状，其余取前 max_chars 个字符
pub fn label(data: &Value, max_chars: usize) -> String {
    let raw = match data {
        Value::Object(map) => {
            let fields: Vec<String> = map
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{k}: str[{}]", s.chars().count()),
                    Value::Array(a) => format!("{k}: list[{}]", a.len()),
                    Value::Object(_) => format!("{k}: obj"),
                    other => format!("{k}: {other}"),
                })
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
        Value::Array(a) => format!("list[{}]", a.len()),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate_chars(&raw, max_chars)
}

/// 默认结果摘要（供 Chain Step 的 result_summary）
pub fn short_summary(tool: &str, data: &Value) -> String {
    if let Some(err) = data.get("error").and_then(Value::as_str) {
        return format!("Error: {err}");
    }
    if let Some(content) = data.get("content").and_then(Value::as_str) {
        return truncate_chars(content, 120);
    }
    match data {
        Value::Object(map) => {
            if let Some((key, len)) = map.iter().find_map(|(k, v)| v.as_array().map(|a| (k, a.len()))) {
                format!("{tool}: {len} {key}")
            } else {
                format!("{tool}: {}", label(data, 100))
            }
        }
        Value::Array(a) => format!("{tool}: {} items", a.len()),
        other => format!("{tool}: {}", truncate_chars(&other.to_string(), 100)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_never_contains_long_payload() {
        let sequence = "ATGC".repeat(500);
        let data = json!({
            "sequence": sequence,
            "length": 2000,
            "hits": [{"name": "pUC19", "note": "x".repeat(300)}, {"name": "pBR322"}],
        });
        let s = summarize_for_model(&data, 1000);
        assert!(!s.contains(&sequence));
        assert!(s.contains("\"length\":2000"));
        assert!(s.contains("\"hits_count\":2"));
        assert!(s.contains("pUC19"));
        assert!(!s.contains(&"x".repeat(300)));
    }

    #[test]
    fn test_summary_respects_char_budget() {
        let data = json!({"items": (0..500).map(|i| format!("item-{i}")).collect::<Vec<_>>()});
        let s = summarize_for_model(&data, 10);
        assert!(s.chars().count() <= 43);
    }

    #[test]
    fn test_label_describes_shape() {
        let data = json!({"protein": "M".repeat(50), "hits": [1, 2, 3]});
        let l = label(&data, 60);
        assert!(l.contains("protein: str[50]"));
        assert!(l.contains("hits: list[3]"));
    }

    #[test]
    fn test_short_summary_prefers_error_and_content() {
        assert_eq!(short_summary("x", &json!({"error": "boom"})), "Error: boom");
        assert_eq!(short_summary("x", &json!({"content": "hello"})), "hello");
        assert_eq!(short_summary("search", &json!({"results": [1, 2]})), "search: 2 results");
    }
}
