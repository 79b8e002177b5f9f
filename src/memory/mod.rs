//! 记忆层：会话历史与工具结果管道

pub mod conversation;
pub mod pipe_cache;

pub use conversation::{ConversationMemory, HistoryEntry, Message, Role};
pub use pipe_cache::{parse_reference, HandleError, PipeCache, PipeHandle, SizeClass, HANDLE_PREFIX};
