//! 会话网关
//!
//! - **message**: 入站 / 出站事件协议
//! - **runtime**: 所有会话共享的注册表、Pipe Cache、模型池与编排器
//! - **session**: 会话 actor 与 SessionManager
//! - **hub**: WebSocket 接入（`gateway` feature）

#[cfg(feature = "gateway")]
mod hub;
mod message;
mod runtime;
mod session;

#[cfg(feature = "gateway")]
pub use hub::{Hub, HubConfig};
pub use message::{Inbound, Outbound};
pub use runtime::{Runtime, SessionSettings};
pub use session::{SessionConnection, SessionId, SessionManager};
