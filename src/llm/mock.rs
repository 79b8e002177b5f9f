//! Mock LLM 客户端（用于测试与无 Key 运行）
//!
//! 按脚本依次返回预设回复；脚本耗尽后回显：最后一条是观察结果则给出最终回答，否则调用 echo 工具。
//! 记录调用次数与每次收到的消息，便于断言「Direct 模式不调用 LLM」「上下文里只有标签」等。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{Completion, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// 观察结果消息的前缀（与 planner 约定）
const OBSERVATION_PREFIX: &str = "Observation";

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定回复
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for r in replies {
            mock.push_reply(r);
        }
        mock
    }

    /// 每次调用前等待（模拟慢模型，测试 THINKING 中取消）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock_script().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, err: LlmError) {
        self.lock_script().push_back(Err(err));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的完整消息列表
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn echo(messages: &[Message]) -> String {
        let last = messages.iter().rev().find(|m| m.role == Role::User);
        match last {
            Some(m) if m.content.starts_with(OBSERVATION_PREFIX) => {
                serde_json::json!({ "answer": "Echo from Mock: done" }).to_string()
            }
            Some(m) => serde_json::json!({
                "tool": "echo",
                "args": { "text": format!("Echo from Mock: {}", m.content) },
            })
            .to_string(),
            None => serde_json::json!({ "answer": "(no input)" }).to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let scripted = self.lock_script().pop_front();
        let content = match scripted {
            Some(reply) => reply?,
            None => Self::echo(messages),
        };
        let prompt_tokens: u64 = messages.iter().map(|m| m.content.len() as u64 / 4).sum();
        let completion_tokens = content.len() as u64 / 4;
        Ok(Completion {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_then_echo() {
        let mock = MockLlmClient::with_replies([r#"{"answer": "hi"}"#]);
        let first = mock.complete(&[Message::user("x")]).await.unwrap();
        assert_eq!(first.content, r#"{"answer": "hi"}"#);
        let second = mock.complete(&[Message::user("ping")]).await.unwrap();
        assert!(second.content.contains("\"tool\":\"echo\""));
        let third = mock
            .complete(&[Message::user("ping"), Message::user("Observation: ok")])
            .await
            .unwrap();
        assert!(third.content.contains("answer"));
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.requests()[1][0].content, "ping");
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let mock = MockLlmClient::new();
        mock.push_error(LlmError::Request("down".into()));
        assert!(mock.complete(&[]).await.is_err());
    }
}
