pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod summary;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{SideEffect, Tool, ToolDescriptor, ToolOutput, ToolRegistry, HIDDEN_TAG};
pub use schema::{action_formats_schema_json, InputSchema, ParamSpec, ParamType};
