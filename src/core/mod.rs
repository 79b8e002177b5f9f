//! 核心层：错误分类、恢复策略、循环状态机

pub mod error;
pub mod recovery;
pub mod state;

pub use error::{AgentError, RecoveryAction, RegistryError, ToolError, MISSING_REQUIRED};
pub use recovery::RecoveryEngine;
pub use state::LoopPhase;
