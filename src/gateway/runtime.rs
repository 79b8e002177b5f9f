//! Runtime：所有会话共享的只读组件
//!
//! 工具注册表 / 执行器（启动后只读）、按会话分区的 Pipe Cache、模型池、编排器与会话参数。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::llm::ModelPool;
use crate::memory::PipeCache;
use crate::react::{LoopSettings, Orchestrator};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_history_pairs: usize,
    pub widget_data_threshold: usize,
    pub sweep_interval: Duration,
}

impl From<&AppConfig> for SessionSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_history_pairs: cfg.app.max_history_pairs,
            widget_data_threshold: cfg.app.widget_data_threshold,
            sweep_interval: Duration::from_secs(cfg.cache.sweep_interval_secs.max(1)),
        }
    }
}

pub struct Runtime {
    orchestrator: Arc<Orchestrator>,
    models: Arc<ModelPool>,
    settings: SessionSettings,
}

impl Runtime {
    /// 按配置组装：执行器超时、Pipe Cache TTL、模型池、循环参数
    pub fn from_config(cfg: &AppConfig, registry: ToolRegistry) -> Self {
        let models = ModelPool::from_config(&cfg.llm);
        Self::with_models(cfg, registry, models)
    }

    /// 使用现成的模型池（测试注入 MockLlmClient）
    pub fn with_models(cfg: &AppConfig, registry: ToolRegistry, models: ModelPool) -> Self {
        let registry = Arc::new(registry);
        let executor = Arc::new(
            ToolExecutor::new(Arc::clone(&registry), cfg.tools.tool_timeout_secs)
                .with_query_retries(cfg.tools.query_retries),
        );
        let pipe = Arc::new(PipeCache::new(
            Duration::from_secs(cfg.cache.idle_ttl_secs),
            cfg.cache.label_chars,
        ));
        Self::from_parts(
            Orchestrator::new(executor, pipe, LoopSettings::from(cfg)),
            models,
            SessionSettings::from(cfg),
        )
    }

    pub fn from_parts(orchestrator: Orchestrator, models: ModelPool, settings: SessionSettings) -> Self {
        tracing::info!(
            tools = orchestrator.registry().len(),
            models = models.ids().len(),
            default_model = models.default_id(),
            "runtime ready"
        );
        Self {
            orchestrator: Arc::new(orchestrator),
            models: Arc::new(models),
            settings,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.orchestrator.registry()
    }

    pub fn pipe(&self) -> &Arc<PipeCache> {
        self.orchestrator.pipe()
    }

    pub fn models(&self) -> &Arc<ModelPool> {
        &self.models
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}
