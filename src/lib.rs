//! Hive - 工具编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、循环状态、失败恢复策略
//! - **gateway**: 会话管理与 WebSocket 接入
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）与模型池
//! - **memory**: 对话历史与按会话分区的 Pipe Cache
//! - **react**: Dispatcher、Planner、编排主循环
//! - **tools**: 工具注册表、参数 Schema、执行器

pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
