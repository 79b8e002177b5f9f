//! 集成测试共用的桩工具

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hive::memory::PipeCache;
use hive::react::{LoopSettings, Orchestrator};
use hive::tools::{EchoTool, InputSchema, ParamSpec, Tool, ToolExecutor, ToolOutput, ToolRegistry};
use serde_json::{json, Value};

pub const SEQUENCE_LEN: usize = 4000;

/// 查找记录：返回带长序列的对象
#[derive(Default, Clone)]
pub struct FindTool {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for FindTool {
    fn name(&self) -> &str {
        "find"
    }
    fn description(&self) -> &str {
        "Look up a record by name."
    }
    fn input_schema(&self) -> InputSchema {
        InputSchema::new().required_param("query", ParamSpec::new("string"))
    }
    fn output_contract(&self) -> &str {
        "sequence"
    }
    async fn execute(&self, params: Value) -> Result<ToolOutput, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let query = params["query"].as_str().unwrap_or_default();
        Ok(ToolOutput::new(
            json!({ "accession": query, "sequence": "ACGT".repeat(SEQUENCE_LEN / 4) }),
            "sequence",
        ))
    }
}

/// 翻译：记录收到的 sequence 参数
#[derive(Default, Clone)]
pub struct TranslateTool {
    pub received: Arc<Mutex<Vec<String>>>,
}

impl TranslateTool {
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for TranslateTool {
    fn name(&self) -> &str {
        "translate"
    }
    fn description(&self) -> &str {
        "Translate a DNA sequence to protein."
    }
    fn input_schema(&self) -> InputSchema {
        InputSchema::new().required_param("sequence", ParamSpec::new("string"))
    }
    async fn execute(&self, params: Value) -> Result<ToolOutput, String> {
        let seq = params["sequence"].as_str().unwrap_or_default().to_string();
        let len = seq.len();
        self.received.lock().unwrap().push(seq);
        Ok(ToolOutput::text(format!("translated {len} bases")))
    }
}

/// 慢查询：执行时间可观察，用于断开 / 忙碌场景
#[derive(Clone)]
pub struct SlowFindTool {
    pub delay: Duration,
}

#[async_trait]
impl Tool for SlowFindTool {
    fn name(&self) -> &str {
        "slowfind"
    }
    fn description(&self) -> &str {
        "Look up a record in the archive (slow)."
    }
    fn input_schema(&self) -> InputSchema {
        InputSchema::new().required_param("query", ParamSpec::new("string"))
    }
    async fn execute(&self, params: Value) -> Result<ToolOutput, String> {
        tokio::time::sleep(self.delay).await;
        let query = params["query"].as_str().unwrap_or_default();
        Ok(ToolOutput::text(format!("archived record {query}")))
    }
}

pub const SLOW_TOOL_DELAY: Duration = Duration::from_millis(300);

pub struct Fixture {
    pub find: FindTool,
    pub translate: TranslateTool,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            find: FindTool::default(),
            translate: TranslateTool::default(),
        }
    }

    pub fn registry(&self) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        reg.register(self.find.clone()).unwrap();
        reg.register(self.translate.clone()).unwrap();
        reg.register(SlowFindTool {
            delay: SLOW_TOOL_DELAY,
        })
        .unwrap();
        reg
    }

    pub fn orchestrator(&self, settings: LoopSettings) -> Orchestrator {
        let registry = Arc::new(self.registry());
        let executor = Arc::new(ToolExecutor::new(registry, 5));
        Orchestrator::new(executor, Arc::new(PipeCache::default()), settings)
    }
}
