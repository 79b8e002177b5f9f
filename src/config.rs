//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__STEP_BUDGET=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub cache: CacheSection,
    pub gateway: GatewaySection,
}

/// [app] 段：应用名、历史窗口、组件数据阈值
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 进入 LLM 上下文的最近对话轮数（user + assistant 为一轮）
    #[serde(default = "default_max_history_pairs")]
    pub max_history_pairs: usize,
    /// 超过此字节数的组件数据在链中标记为 stale
    #[serde(default = "default_widget_data_threshold")]
    pub widget_data_threshold: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_history_pairs: default_max_history_pairs(),
            widget_data_threshold: default_widget_data_threshold(),
        }
    }
}

fn default_max_history_pairs() -> usize {
    20
}

fn default_widget_data_threshold() -> usize {
    2048
}

/// [llm] 段：模型池、步数上限、摘要与自动管道参数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 默认模型 id；未设置时取 models 的第一项
    pub default_model: Option<String>,
    #[serde(default = "default_step_budget")]
    pub step_budget: usize,
    /// 回灌给 LLM 的结果摘要上限（token 估算）
    #[serde(default = "default_summary_token_limit")]
    pub summary_token_limit: usize,
    /// 自动管道：字符串字段至少这么长才会被自动填入
    #[serde(default = "default_pipe_min_length")]
    pub pipe_min_length: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            default_model: None,
            step_budget: default_step_budget(),
            summary_token_limit: default_summary_token_limit(),
            pipe_min_length: default_pipe_min_length(),
            request_timeout_secs: default_request_timeout_secs(),
            models: Vec::new(),
        }
    }
}

fn default_step_budget() -> usize {
    5
}

fn default_summary_token_limit() -> usize {
    1000
}

fn default_pipe_min_length() -> usize {
    200
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// [[llm.models]]：模型池中的一项
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub id: String,
    /// openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 后端模型名，缺省同 id
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

/// [tools] 段：工具超时与纯查询重试次数
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_query_retries")]
    pub query_retries: u32,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            query_retries: default_query_retries(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_query_retries() -> u32 {
    1
}

/// [cache] 段：Pipe Cache 空闲超时、标签长度、清理周期
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_label_chars")]
    pub label_chars: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            label_chars: default_label_chars(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_idle_ttl_secs() -> u64 {
    1800
}

fn default_label_chars() -> usize {
    60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// [gateway] 段：WebSocket 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:9000".to_string()
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时回退到默认配置
pub fn load_or_default(config_path: Option<PathBuf>) -> AppConfig {
    match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_history_pairs, 20);
        assert_eq!(cfg.app.widget_data_threshold, 2048);
        assert_eq!(cfg.llm.step_budget, 5);
        assert_eq!(cfg.llm.pipe_min_length, 200);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.cache.idle_ttl_secs, 1800);
        assert_eq!(cfg.gateway.bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[llm]
step_budget = 3
default_model = "fast"

[[llm.models]]
id = "fast"
provider = "mock"

[cache]
idle_ttl_secs = 10
"#
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.step_budget, 3);
        assert_eq!(cfg.llm.default_model.as_deref(), Some("fast"));
        assert_eq!(cfg.llm.models.len(), 1);
        assert_eq!(cfg.llm.models[0].provider, "mock");
        assert_eq!(cfg.cache.idle_ttl_secs, 10);
        assert_eq!(cfg.cache.label_chars, 60);
    }
}
