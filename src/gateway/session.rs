//! 会话管理
//!
//! 每个连接对应一个 Session actor（独立 tokio 任务），通过 mpsc 通道收发 Inbound / Outbound。
//! - 同一会话同时最多一个活动运行（循环 / Direct 执行 / 重跑）；忙时返回 `error {code: "busy"}`
//! - cancel 是建议性的，总会得到 `cancelled` 确认
//! - 新的顶层消息先清空本会话的 Pipe Cache；断开连接取消循环、清空缓存并丢弃结果

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::message::{Inbound, Outbound};
use super::runtime::Runtime;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, Message};
use crate::react::{classify, execute_direct, Dispatch, LoopOutcome, LoopRequest, Widget};

/// 会话 ID
pub type SessionId = String;

/// 连接端：向会话发送 Inbound，从 outbound 读取事件
pub struct SessionConnection {
    pub id: SessionId,
    pub inbound: UnboundedSender<Inbound>,
    pub outbound: UnboundedReceiver<Outbound>,
}

/// 活动槽位里跑的是什么
enum RunKind {
    /// 顶层消息（循环或 Direct 执行），结果写入历史
    Request,
    /// 重跑某一步，结果以 widget_data 返回
    Rerun {
        tool: String,
        message_index: Option<usize>,
    },
}

/// 正在运行的循环、Direct 执行或重跑；同一会话至多一个
struct ActiveRun {
    kind: RunKind,
    cancel: CancellationToken,
    handle: JoinHandle<LoopOutcome>,
}

/// 单个会话（由 actor 任务独占，不跨任务共享）
struct Session {
    id: SessionId,
    history: ConversationMemory,
    model_id: String,
    runtime: Arc<Runtime>,
    outbound: UnboundedSender<Outbound>,
    active: Option<ActiveRun>,
}

async fn join_active(active: &mut Option<ActiveRun>) -> Result<LoopOutcome, JoinError> {
    match active {
        Some(run) => (&mut run.handle).await,
        None => std::future::pending().await,
    }
}

impl Session {
    fn new(id: SessionId, runtime: Arc<Runtime>, outbound: UnboundedSender<Outbound>) -> Self {
        Self {
            history: ConversationMemory::new(runtime.settings().max_history_pairs),
            model_id: runtime.models().default_id().to_string(),
            id,
            runtime,
            outbound,
            active: None,
        }
    }

    fn send(&self, event: Outbound) {
        tracing::trace!(session = %self.id, event = event.kind(), "outbound");
        let _ = self.outbound.send(event);
    }

    fn init_event(&self) -> Outbound {
        Outbound::Init {
            session_id: self.id.clone(),
            tools: self.runtime.registry().metadata(),
            models: self.runtime.models().ids(),
            current_model: self.model_id.clone(),
            help: self.runtime.registry().help_text(),
        }
    }

    /// actor 主循环：入站消息 / 活动运行完成 / 关闭信号
    async fn run(mut self, mut inbound: UnboundedReceiver<Inbound>, closed: CancellationToken) {
        self.send(self.init_event());

        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                joined = join_active(&mut self.active) => {
                    let kind = self.active.take().map(|a| a.kind);
                    match (joined, kind) {
                        (Ok(outcome), Some(RunKind::Rerun { tool, message_index })) => {
                            self.finish_rerun(tool, message_index, outcome)
                        }
                        (Ok(outcome), _) => self.finish(outcome),
                        (Err(e), _) => {
                            tracing::error!(session = %self.id, error = %e, "loop task failed");
                            self.send(Outbound::error("internal", "The request failed unexpectedly."));
                        }
                    }
                }
                msg = inbound.recv() => match msg {
                    Some(m) => self.handle(m),
                    None => break,
                },
            }
        }

        self.teardown();
    }

    fn handle(&mut self, msg: Inbound) {
        match msg {
            Inbound::Message { content } => self.start(content),
            Inbound::Cancel => {
                if let Some(active) = &self.active {
                    active.cancel.cancel();
                    tracing::info!(session = %self.id, "cancel requested");
                }
                self.send(Outbound::Cancelled);
            }
            Inbound::RerunTool {
                tool,
                params,
                message_index,
            } => self.rerun(tool, params, message_index),
            Inbound::SetModel { model_id } => {
                if self.runtime.models().contains(&model_id) {
                    tracing::info!(session = %self.id, model = %model_id, "model changed");
                    self.model_id = model_id.clone();
                    self.send(Outbound::ModelChanged { model_id });
                } else {
                    self.send(Outbound::error(
                        "unknown_model",
                        AgentError::UnknownModel(model_id).to_string(),
                    ));
                }
            }
            Inbound::GetHistory { limit } => {
                let entries = self.history.entries();
                let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
                self.send(Outbound::History {
                    entries: entries[skip..].to_vec(),
                });
            }
        }
    }

    /// 新的顶层消息：分类后启动 Direct 执行或编排循环
    fn start(&mut self, content: String) {
        if self.reject_if_busy() {
            return;
        }
        let content = content.trim().to_string();
        if content.is_empty() {
            self.send(Outbound::error("empty_message", "Message is empty."));
            return;
        }

        let dispatch = classify(self.runtime.registry(), &content);
        let llm = match &dispatch {
            Dispatch::Direct { .. } => None,
            _ => match self.runtime.models().get(&self.model_id) {
                Ok(c) => Some(c),
                Err(e) => {
                    self.send(Outbound::error("unknown_model", e.to_string()));
                    return;
                }
            },
        };

        self.runtime.pipe().invalidate(&self.id);
        self.history.push(Message::user(content.clone()));
        let cancel = CancellationToken::new();

        let handle = match (dispatch, llm) {
            (Dispatch::Direct { tool, payload }, _) => {
                tracing::info!(session = %self.id, tool = %tool, "direct execution");
                let runtime = Arc::clone(&self.runtime);
                let session_id = self.id.clone();
                tokio::spawn(async move {
                    execute_direct(runtime.orchestrator(), &session_id, &tool, payload).await
                })
            }
            (Dispatch::Guided { tool, prompt }, Some(llm)) => {
                tracing::info!(session = %self.id, tool = %tool, "guided request");
                self.spawn_loop(llm, prompt, Some(tool), cancel.clone())
            }
            (Dispatch::FreeText { text }, Some(llm)) => {
                self.spawn_loop(llm, text, None, cancel.clone())
            }
            (_, None) => return,
        };
        self.active = Some(ActiveRun {
            kind: RunKind::Request,
            cancel,
            handle,
        });
    }

    /// 已有活动运行时回复 busy
    fn reject_if_busy(&self) -> bool {
        if self.active.is_none() {
            return false;
        }
        self.send(Outbound::error(
            "busy",
            AgentError::SessionBusy(self.id.clone()).to_string(),
        ));
        true
    }

    /// 启动编排循环；进度事件按顺序转发，循环结束后才返回结果
    fn spawn_loop(
        &self,
        llm: Arc<dyn LlmClient>,
        prompt: String,
        hint: Option<String>,
        cancel: CancellationToken,
    ) -> JoinHandle<LoopOutcome> {
        let mut history = self.history.active_messages();
        if let Some(last) = history.last_mut() {
            last.content = prompt;
        }
        let request = LoopRequest {
            session_id: self.id.clone(),
            history,
            hint,
        };
        let runtime = Arc::clone(&self.runtime);
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let forward = async {
                while let Some(p) = progress_rx.recv().await {
                    let _ = outbound.send(Outbound::Progress(p));
                }
            };
            let run = runtime
                .orchestrator()
                .run(llm, request, cancel, Some(progress_tx));
            let (outcome, ()) = tokio::join!(run, forward);
            outcome
        })
    }

    fn finish(&mut self, outcome: LoopOutcome) {
        let widget = history_widget(&outcome, self.runtime.settings().widget_data_threshold);
        let message_index =
            self.history
                .push_reply(outcome.message.clone(), widget, Some(self.model_id.clone()));
        tracing::info!(
            session = %self.id,
            status = ?outcome.status,
            steps = outcome.steps_used,
            "request finished"
        );
        self.send(Outbound::Message {
            outcome,
            model: self.model_id.clone(),
            message_index,
        });
    }

    /// 重跑走 Direct 模式（不调用 LLM），与其它请求一样占用活动槽位
    fn rerun(&mut self, tool: String, params: serde_json::Value, message_index: Option<usize>) {
        if self.reject_if_busy() {
            return;
        }
        tracing::info!(session = %self.id, tool = %tool, "rerun requested");
        let runtime = Arc::clone(&self.runtime);
        let session_id = self.id.clone();
        let name = tool.clone();
        let handle = tokio::spawn(async move {
            execute_direct(runtime.orchestrator(), &session_id, &name, Some(params)).await
        });
        self.active = Some(ActiveRun {
            kind: RunKind::Rerun {
                tool,
                message_index,
            },
            cancel: CancellationToken::new(),
            handle,
        });
    }

    fn finish_rerun(&mut self, tool: String, message_index: Option<usize>, outcome: LoopOutcome) {
        if let (Some(idx), Some(Widget::Fresh { .. })) = (message_index, outcome.widget.as_ref()) {
            let threshold = self.runtime.settings().widget_data_threshold;
            if let Some(stored) = history_widget(&outcome, threshold) {
                self.history.set_widget(idx, stored);
            }
        }
        self.send(Outbound::WidgetData {
            tool,
            message_index,
            status: outcome.status,
            content: outcome.message,
            widget: outcome.widget,
        });
    }

    /// 断开：取消在途循环并丢弃结果，清空缓存
    fn teardown(&mut self) {
        let pipe = Arc::clone(self.runtime.pipe());
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            let session_id = self.id.clone();
            let pipe = Arc::clone(&pipe);
            // 在途工具跑完后可能再写入缓存，结束后再清一次
            tokio::spawn(async move {
                let _ = active.handle.await;
                pipe.invalidate(&session_id);
            });
        }
        pipe.invalidate(&self.id);
        tracing::info!(session = %self.id, "session closed");
    }
}

/// 存入历史的组件：数据过大时只保留可重跑的 stale 标记
fn history_widget(outcome: &LoopOutcome, threshold: usize) -> Option<Widget> {
    match (&outcome.widget, outcome.widget_step) {
        (Some(Widget::Fresh { widget_type, data }), Some(i)) => match outcome.chain.get(i) {
            Some(step) => Some(Widget::sized(
                widget_type,
                data.clone(),
                &step.tool_name,
                &step.resolved_params,
                threshold,
            )),
            None => outcome.widget.clone(),
        },
        (widget, _) => widget.clone(),
    }
}

struct SessionEntry {
    inbound: UnboundedSender<Inbound>,
    closed: CancellationToken,
    task: JoinHandle<()>,
}

/// 会话管理器：session_id -> Session actor
pub struct SessionManager {
    runtime: Arc<Runtime>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionManager {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// 新连接：创建会话并启动 actor；首个出站事件为 init
    pub async fn connect(&self) -> SessionConnection {
        let id: SessionId = uuid::Uuid::new_v4().to_string();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let session = Session::new(id.clone(), Arc::clone(&self.runtime), out_tx);
        let task = tokio::spawn(session.run(in_rx, closed.clone()));

        let live = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                id.clone(),
                SessionEntry {
                    inbound: in_tx.clone(),
                    closed,
                    task,
                },
            );
            sessions.len()
        };
        tracing::info!(session = %id, live, "session connected");

        SessionConnection {
            id,
            inbound: in_tx,
            outbound: out_rx,
        }
    }

    pub async fn send(&self, session_id: &str, msg: Inbound) -> Result<(), AgentError> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| AgentError::UnknownSession(session_id.to_string()))?;
        entry
            .inbound
            .send(msg)
            .map_err(|_| AgentError::UnknownSession(session_id.to_string()))
    }

    /// 设置取消标记（建议性，总会得到 cancelled 确认）
    pub async fn request_cancel(&self, session_id: &str) -> Result<(), AgentError> {
        self.send(session_id, Inbound::Cancel).await
    }

    /// 断开并销毁会话；返回会话是否存在
    pub async fn disconnect(&self, session_id: &str) -> bool {
        let entry = self.sessions.write().await.remove(session_id);
        match entry {
            Some(entry) => {
                entry.closed.cancel();
                if let Err(e) = entry.task.await {
                    tracing::warn!(session = session_id, error = %e, "session task ended abnormally");
                }
                let live = self.active_count().await;
                tracing::info!(session = session_id, live, "session disconnected");
                true
            }
            None => false,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 断开全部会话
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    /// 定期清理空闲超时的 Pipe Cache 分区
    pub fn spawn_janitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let pipe = Arc::clone(self.runtime.pipe());
        let period = self.runtime.settings().sweep_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {
                        let swept = pipe.sweep_expired();
                        if swept > 0 {
                            tracing::info!(swept, "expired pipe partitions dropped");
                        }
                    }
                }
            }
        })
    }
}
