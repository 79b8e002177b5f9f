//! 会话历史
//!
//! 全部条目都保留（供 UI 回放与 get_history），但只有最近 max_pairs 轮
//! （user + assistant）标记为 active 并进入 LLM 上下文。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::react::Widget;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 历史条目
#[derive(Clone, Debug, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 是否仍在 LLM 上下文窗口内
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget: Option<Widget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ConversationMemory {
    entries: Vec<HistoryEntry>,
    max_pairs: usize,
}

impl ConversationMemory {
    pub fn new(max_pairs: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_pairs,
        }
    }

    /// 追加消息，返回条目下标
    pub fn push(&mut self, msg: Message) -> usize {
        self.push_entry(msg, None, None)
    }

    /// 追加带组件的助手回复
    pub fn push_reply(&mut self, content: impl Into<String>, widget: Option<Widget>, model: Option<String>) -> usize {
        self.push_entry(Message::assistant(content), widget, model)
    }

    fn push_entry(&mut self, msg: Message, widget: Option<Widget>, model: Option<String>) -> usize {
        self.entries.push(HistoryEntry {
            role: msg.role,
            content: msg.content,
            timestamp: Utc::now(),
            active: true,
            widget,
            model,
        });
        self.refresh_window();
        self.entries.len() - 1
    }

    /// 只有最近 max_pairs*2 条保持 active
    fn refresh_window(&mut self) {
        let keep = self.max_pairs * 2;
        let cutoff = self.entries.len().saturating_sub(keep);
        for (i, e) in self.entries.iter_mut().enumerate() {
            e.active = i >= cutoff;
        }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// 进入 LLM 上下文的消息
    pub fn active_messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .filter(|e| e.active)
            .map(|e| Message {
                role: e.role,
                content: e.content.clone(),
            })
            .collect()
    }

    /// 替换某条目的组件（rerun 后刷新），下标越界返回 false
    pub fn set_widget(&mut self, index: usize, widget: Widget) -> bool {
        match self.entries.get_mut(index) {
            Some(e) => {
                e.widget = Some(widget);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_window_marks_old_entries_inactive() {
        let mut mem = ConversationMemory::new(1);
        mem.push(Message::user("a"));
        mem.push(Message::assistant("b"));
        mem.push(Message::user("c"));
        mem.push(Message::assistant("d"));
        assert_eq!(mem.len(), 4);
        let active: Vec<_> = mem.active_messages().into_iter().map(|m| m.content).collect();
        assert_eq!(active, vec!["c", "d"]);
        assert!(!mem.entries()[0].active);
    }

    #[test]
    fn test_set_widget() {
        let mut mem = ConversationMemory::new(5);
        let idx = mem.push_reply("done", None, Some("mock".into()));
        let widget = Widget::fresh("text", json!({"content": "x"}));
        assert!(mem.set_widget(idx, widget.clone()));
        assert_eq!(mem.entries()[idx].widget, Some(widget));
        assert!(!mem.set_widget(99, Widget::fresh("text", json!(null))));
    }
}
