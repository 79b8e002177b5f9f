//! 模型池：模型 id -> 共享的 LlmClient
//!
//! 客户端在首次使用时按配置创建并缓存；第一项为默认模型。会话通过 set_model 在池内切换。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{LlmSection, ModelConfig};
use crate::core::AgentError;
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};

pub struct ModelPool {
    configs: Vec<ModelConfig>,
    default_id: String,
    clients: RwLock<HashMap<String, Arc<dyn LlmClient>>>,
}

impl ModelPool {
    /// 从 [llm] 段构建；未配置任何模型时放入一个 mock
    pub fn from_config(llm: &LlmSection) -> Self {
        let mut configs = llm.models.clone();
        if configs.is_empty() {
            configs.push(ModelConfig {
                id: "mock".to_string(),
                provider: "mock".to_string(),
                model: None,
                base_url: None,
                api_key_env: None,
            });
        }
        let default_id = llm
            .default_model
            .clone()
            .filter(|id| configs.iter().any(|c| &c.id == id))
            .unwrap_or_else(|| configs[0].id.clone());
        Self {
            configs,
            default_id,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// 单一模型（测试 / 嵌入）
    pub fn single(id: &str, client: Arc<dyn LlmClient>) -> Self {
        let pool = Self {
            configs: Vec::new(),
            default_id: id.to_string(),
            clients: RwLock::new(HashMap::new()),
        };
        pool.insert(id, client);
        pool
    }

    /// 放入现成的客户端（覆盖同名配置）
    pub fn insert(&self, id: &str, client: Arc<dyn LlmClient>) {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), client);
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// 全部模型 id（配置顺序，随后是额外插入的）
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.iter().map(|c| c.id.clone()).collect();
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        let mut extra: Vec<String> = clients
            .keys()
            .filter(|k| !ids.contains(k))
            .cloned()
            .collect();
        extra.sort();
        ids.extend(extra);
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.configs.iter().any(|c| c.id == id)
            || self
                .clients
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmClient>, AgentError> {
        if let Some(c) = self
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
        {
            return Ok(Arc::clone(c));
        }
        let cfg = self
            .configs
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| AgentError::UnknownModel(id.to_string()))?;
        let client = build_client(cfg)?;
        tracing::info!(model = id, provider = %cfg.provider, "llm client created");
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(clients.entry(id.to_string()).or_insert(client)))
    }
}

fn build_client(cfg: &ModelConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    let api_key = cfg
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());
    let model = cfg.model.as_deref().unwrap_or(&cfg.id);
    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(MockLlmClient::new())),
        "deepseek" => Ok(Arc::new(create_deepseek_client(Some(model), api_key.as_deref()))),
        "openai" => Ok(Arc::new(OpenAiClient::new(
            cfg.base_url.as_deref(),
            model,
            api_key.as_deref(),
        ))),
        other => Err(AgentError::ConfigError(format!(
            "model '{}': unknown provider '{other}'",
            cfg.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_cfg(id: &str) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            provider: "mock".to_string(),
            model: None,
            base_url: None,
            api_key_env: None,
        }
    }

    #[test]
    fn test_first_entry_is_default() {
        let llm = LlmSection {
            models: vec![mock_cfg("a"), mock_cfg("b")],
            ..LlmSection::default()
        };
        let pool = ModelPool::from_config(&llm);
        assert_eq!(pool.default_id(), "a");
        assert_eq!(pool.ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_model_and_provider() {
        let mut bad = mock_cfg("x");
        bad.provider = "carrier-pigeon".to_string();
        let llm = LlmSection {
            default_model: Some("missing".into()),
            models: vec![bad],
            ..LlmSection::default()
        };
        let pool = ModelPool::from_config(&llm);
        assert_eq!(pool.default_id(), "x");
        assert!(matches!(pool.get("nope"), Err(AgentError::UnknownModel(_))));
        assert!(matches!(pool.get("x"), Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn test_clients_are_shared() {
        let pool = ModelPool::from_config(&LlmSection::default());
        let a = pool.get("mock").unwrap();
        let b = pool.get("mock").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
