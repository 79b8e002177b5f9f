//! Pipe Cache：工具之间的数据管道
//!
//! 工具的完整输出按会话分区保存，LLM 只看到 `@pipe:<id>` 引用与简短标签；
//! 下一个工具的参数里出现引用时，在调用前透明替换为完整数据。
//!
//! - 分区互不相交：写入只锁本会话分区
//! - 载荷不可变：新输出总是新 handle
//! - 失效：新的顶层消息 / 空闲超时 / 会话销毁

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::tools::summary;
use crate::tools::{InputSchema, ParamType};

/// 引用前缀：`@pipe:<id>` 或 `@pipe:<id>.<field>`
pub const HANDLE_PREFIX: &str = "@pipe:";
const HANDLE_ID_LEN: usize = 12;

const SMALL_LIMIT: usize = 1024;
const MEDIUM_LIMIT: usize = 64 * 1024;

/// 载荷大小等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    fn of(bytes: usize) -> Self {
        if bytes < SMALL_LIMIT {
            Self::Small
        } else if bytes < MEDIUM_LIMIT {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

/// 不透明的结果引用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipeHandle {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub size_class: SizeClass,
    /// 供展示与 LLM 上下文的简短标签
    pub label: String,
}

impl PipeHandle {
    /// 给 LLM 的引用文本
    pub fn reference(&self) -> String {
        format!("{HANDLE_PREFIX}{}", self.id)
    }
}

/// Handle 解析失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandleError {
    #[error("unknown pipe handle '{0}'")]
    Unknown(String),

    #[error("pipe handle '{0}' belongs to another session")]
    Foreign(String),

    #[error("pipe handle '{0}' has expired")]
    Expired(String),

    #[error("pipe handle '{id}' has no field '{field}'")]
    MissingField { id: String, field: String },
}

/// 解析 `@pipe:<id>[.<field>]`，非引用返回 None
pub fn parse_reference(text: &str) -> Option<(&str, Option<&str>)> {
    let rest = text.trim().strip_prefix(HANDLE_PREFIX)?;
    let (id, field) = match rest.split_once('.') {
        Some((id, field)) if !field.is_empty() => (id, Some(field)),
        Some(_) => return None,
        None => (rest, None),
    };
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((id, field))
}

struct Entry {
    handle: PipeHandle,
    payload: Arc<Value>,
}

struct Partition {
    entries: HashMap<String, Entry>,
    /// 插入顺序（新的在后）
    order: Vec<String>,
    last_touched: Instant,
}

impl Partition {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            last_touched: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_touched.elapsed() > ttl
    }
}

/// 按会话分区的结果缓存
pub struct PipeCache {
    partitions: RwLock<HashMap<String, Arc<Mutex<Partition>>>>,
    idle_ttl: Duration,
    label_chars: usize,
}

impl PipeCache {
    pub fn new(idle_ttl: Duration, label_chars: usize) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            idle_ttl,
            label_chars,
        }
    }

    fn partition(&self, session_id: &str) -> Option<Arc<Mutex<Partition>>> {
        let map = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        map.get(session_id).cloned()
    }

    fn partition_or_create(&self, session_id: &str) -> Arc<Mutex<Partition>> {
        if let Some(p) = self.partition(session_id) {
            return p;
        }
        let mut map = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Partition::new()))),
        )
    }

    /// 存入载荷，返回新 handle
    pub fn put(&self, session_id: &str, payload: Value) -> PipeHandle {
        let bytes = serde_json::to_string(&payload).map(|s| s.len()).unwrap_or(0);
        let id: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(HANDLE_ID_LEN)
            .collect();
        let handle = PipeHandle {
            id: id.clone(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            size_class: SizeClass::of(bytes),
            label: summary::label(&payload, self.label_chars),
        };

        let partition = self.partition_or_create(session_id);
        let mut p = partition.lock().unwrap_or_else(|e| e.into_inner());
        if p.is_expired(self.idle_ttl) {
            p.entries.clear();
            p.order.clear();
        }
        p.last_touched = Instant::now();
        p.order.push(id.clone());
        p.entries.insert(
            id,
            Entry {
                handle: handle.clone(),
                payload: Arc::new(payload),
            },
        );
        tracing::debug!(session = session_id, handle = %handle.id, bytes, "pipe put");
        handle
    }

    /// 解析 handle；跨会话、过期、未知均失败（不会静默返回空）
    pub fn resolve(&self, session_id: &str, handle: &PipeHandle) -> Result<Arc<Value>, HandleError> {
        if handle.session_id != session_id {
            return Err(HandleError::Foreign(handle.id.clone()));
        }
        self.resolve_id(session_id, &handle.id)
    }

    /// 按 id 解析（LLM 在参数里给出的引用只有 id）
    pub fn resolve_id(&self, session_id: &str, id: &str) -> Result<Arc<Value>, HandleError> {
        let Some(partition) = self.partition(session_id) else {
            return Err(HandleError::Unknown(id.to_string()));
        };
        let mut p = partition.lock().unwrap_or_else(|e| e.into_inner());
        if !p.entries.contains_key(id) {
            return Err(HandleError::Unknown(id.to_string()));
        }
        if p.is_expired(self.idle_ttl) {
            p.entries.clear();
            p.order.clear();
            return Err(HandleError::Expired(id.to_string()));
        }
        p.last_touched = Instant::now();
        p.entries
            .get(id)
            .map(|e| Arc::clone(&e.payload))
            .ok_or_else(|| HandleError::Unknown(id.to_string()))
    }

    /// 丢弃会话全部 handle
    pub fn invalidate(&self, session_id: &str) {
        let removed = self
            .partitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        if removed.is_some() {
            tracing::debug!(session = session_id, "pipe partition invalidated");
        }
    }

    /// 清理空闲超时的分区，返回清理数量
    pub fn sweep_expired(&self) -> usize {
        let mut map = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, p| {
            let p = p.lock().unwrap_or_else(|e| e.into_inner());
            !p.is_expired(self.idle_ttl)
        });
        before - map.len()
    }

    /// 会话当前的 handle（旧的在前）
    pub fn handles(&self, session_id: &str) -> Vec<PipeHandle> {
        let Some(partition) = self.partition(session_id) else {
            return Vec::new();
        };
        let p = partition.lock().unwrap_or_else(|e| e.into_inner());
        p.order
            .iter()
            .filter_map(|id| p.entries.get(id).map(|e| e.handle.clone()))
            .collect()
    }

    /// 自动管道：从最新的 handle 开始查找同名且足够长的字符串字段
    pub fn find_field(&self, session_id: &str, key: &str, min_len: usize) -> Option<Value> {
        let partition = self.partition(session_id)?;
        let p = partition.lock().unwrap_or_else(|e| e.into_inner());
        if p.is_expired(self.idle_ttl) {
            return None;
        }
        p.order.iter().rev().find_map(|id| {
            let entry = p.entries.get(id)?;
            match entry.payload.get(key) {
                Some(Value::String(s)) if s.chars().count() >= min_len => {
                    Some(Value::String(s.clone()))
                }
                _ => None,
            }
        })
    }

    /// 将参数中的 `@pipe:` 引用替换为完整数据
    ///
    /// 顶层参数若声明为非 object 类型，而整体载荷是含同名字段的对象，则取该字段。
    pub fn resolve_params(
        &self,
        session_id: &str,
        params: &Value,
        schema: &InputSchema,
    ) -> Result<Value, HandleError> {
        let Value::Object(map) = params else {
            return self.resolve_value(session_id, params);
        };
        let mut out = serde_json::Map::with_capacity(map.len());
        for (key, value) in map {
            let resolved = match value.as_str().and_then(parse_reference) {
                Some((id, None)) => {
                    let payload = self.resolve_id(session_id, id)?;
                    let wants_scalar = schema
                        .properties
                        .get(key)
                        .and_then(|s| s.param_type())
                        .is_some_and(|t| t != ParamType::Object);
                    match payload.get(key) {
                        Some(field) if wants_scalar => field.clone(),
                        _ => (*payload).clone(),
                    }
                }
                _ => self.resolve_value(session_id, value)?,
            };
            out.insert(key.clone(), resolved);
        }
        Ok(Value::Object(out))
    }

    fn resolve_value(&self, session_id: &str, value: &Value) -> Result<Value, HandleError> {
        match value {
            Value::String(s) => match parse_reference(s) {
                Some((id, field)) => {
                    let payload = self.resolve_id(session_id, id)?;
                    match field {
                        None => Ok((*payload).clone()),
                        Some(f) => payload.get(f).cloned().ok_or_else(|| HandleError::MissingField {
                            id: id.to_string(),
                            field: f.to_string(),
                        }),
                    }
                }
                None => Ok(value.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(session_id, v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(session_id, v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for PipeCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(1800), 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ParamSpec;
    use serde_json::json;

    #[test]
    fn test_cross_session_resolution_fails() {
        let cache = PipeCache::default();
        let h = cache.put("s1", json!({"sequence": "ATG"}));
        assert_eq!(cache.resolve("s1", &h).unwrap().as_ref(), &json!({"sequence": "ATG"}));
        assert_eq!(cache.resolve("s2", &h), Err(HandleError::Foreign(h.id.clone())));
        assert_eq!(cache.resolve_id("s2", &h.id), Err(HandleError::Unknown(h.id.clone())));
    }

    #[test]
    fn test_invalidate_drops_partition() {
        let cache = PipeCache::default();
        let h = cache.put("s1", json!(1));
        cache.invalidate("s1");
        assert!(matches!(cache.resolve("s1", &h), Err(HandleError::Unknown(_))));
        assert!(cache.handles("s1").is_empty());
    }

    #[test]
    fn test_idle_ttl_expires_handles() {
        let cache = PipeCache::new(Duration::from_millis(10), 60);
        let h = cache.put("s1", json!({"a": 1}));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.resolve("s1", &h), Err(HandleError::Expired(h.id.clone())));
        cache.put("s2", json!(2));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.sweep_expired(), 2);
    }

    #[test]
    fn test_new_output_never_mutates_existing_handle() {
        let cache = PipeCache::default();
        let a = cache.put("s1", json!({"v": 1}));
        let b = cache.put("s1", json!({"v": 2}));
        assert_ne!(a.id, b.id);
        assert_eq!(cache.resolve("s1", &a).unwrap()["v"], json!(1));
        assert_eq!(cache.handles("s1").len(), 2);
    }

    #[test]
    fn test_parse_reference() {
        assert_eq!(parse_reference("@pipe:abc123"), Some(("abc123", None)));
        assert_eq!(parse_reference("@pipe:abc123.protein"), Some(("abc123", Some("protein"))));
        assert_eq!(parse_reference("pipe:abc"), None);
        assert_eq!(parse_reference("@pipe:"), None);
        assert_eq!(parse_reference("@pipe:abc."), None);
    }

    #[test]
    fn test_resolve_params_projects_same_named_field() {
        let cache = PipeCache::default();
        let seq = "ATGC".repeat(100);
        let h = cache.put("s1", json!({"sequence": seq, "name": "pUC19"}));
        let schema = InputSchema::new()
            .required_param("sequence", ParamSpec::new("string"))
            .param("source", ParamSpec::new("object"));
        let params = json!({
            "sequence": h.reference(),
            "source": h.reference(),
            "names": [format!("{}.name", h.reference())],
        });
        let out = cache.resolve_params("s1", &params, &schema).unwrap();
        assert_eq!(out["sequence"], json!(seq));
        assert_eq!(out["source"]["name"], json!("pUC19"));
        assert_eq!(out["names"], json!(["pUC19"]));

        let missing = json!({"x": format!("{}.nope", h.reference())});
        assert!(matches!(
            cache.resolve_params("s1", &missing, &schema),
            Err(HandleError::MissingField { .. })
        ));
    }

    #[test]
    fn test_find_field_prefers_newest_long_value() {
        let cache = PipeCache::default();
        cache.put("s1", json!({"sequence": "A".repeat(300)}));
        cache.put("s1", json!({"sequence": "C".repeat(300)}));
        cache.put("s1", json!({"sequence": "short"}));
        assert_eq!(cache.find_field("s1", "sequence", 200), Some(json!("C".repeat(300))));
        assert_eq!(cache.find_field("s2", "sequence", 200), None);
    }
}
