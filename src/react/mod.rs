//! 编排层：Dispatcher、Planner、主循环、执行链与进度事件

pub mod chain;
pub mod dispatcher;
pub mod events;
pub mod loop_;
pub mod planner;

pub use chain::{ChainStep, FormArtifact, FormState, StepStatus, Widget};
pub use dispatcher::{classify, execute_direct, parse_payload, Dispatch};
pub use events::ProgressEvent;
pub use loop_::{LoopOutcome, LoopRequest, LoopSettings, LoopStatus, Orchestrator};
pub use planner::{parse_model_output, system_prompt, ModelAction, ToolCall};
