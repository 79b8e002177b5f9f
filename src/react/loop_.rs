//! 编排主循环
//!
//! INIT -> THINKING -> (TOOL_EXEC -> THINKING)* -> DONE | CANCELLED | FAILED
//!
//! - THINKING：拼 system（工具目录 + 已存结果的标签）+ 历史 + 本轮草稿，调用 LLM
//! - TOOL_EXEC：解析 `@pipe:` 引用 -> 自动管道补参 -> Schema 校验 -> 执行 -> 结果入 Pipe Cache，只把摘要回灌给 LLM
//! - 可恢复错误由 RecoveryEngine 转为 Observation；步数上限、重复失败、LLM 失败结束为 FAILED（保留已完成的链）
//! - 取消只在步骤边界与 THINKING 期间生效，不会打断正在执行的工具

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, LoopPhase, RecoveryAction, RecoveryEngine, ToolError};
use crate::llm::LlmClient;
use crate::memory::{Message, PipeCache, PipeHandle};
use crate::react::planner::{parse_model_output, system_prompt, ModelAction, ToolCall};
use crate::react::{ChainStep, ProgressEvent, StepStatus, Widget};
use crate::tools::{summary, ToolDescriptor, ToolExecutor, ToolOutput, ToolRegistry};

/// 循环参数（来自 [llm] / [app]）
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub step_budget: usize,
    pub summary_token_limit: usize,
    pub pipe_min_length: usize,
    pub widget_data_threshold: usize,
    pub llm_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for LoopSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            step_budget: cfg.llm.step_budget,
            summary_token_limit: cfg.llm.summary_token_limit,
            pipe_min_length: cfg.llm.pipe_min_length,
            widget_data_threshold: cfg.app.widget_data_threshold,
            llm_timeout: Duration::from_secs(cfg.llm.request_timeout_secs),
        }
    }
}

/// 一次循环的输入
#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub session_id: String,
    /// 进入上下文的历史（末尾为本轮用户消息）
    pub history: Vec<Message>,
    /// Guided 模式：首轮只提供该工具
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Done,
    Cancelled,
    Failed,
}

/// 循环结果：FAILED / CANCELLED 同样带上已完成的链
#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    pub message: String,
    pub chain: Vec<ChainStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget: Option<Widget>,
    /// widget 来自链中的哪一步
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget_step: Option<usize>,
    pub steps_used: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl LoopOutcome {
    pub fn is_done(&self) -> bool {
        self.status == LoopStatus::Done
    }
}

/// 单次工具调用的产物
pub(crate) struct ToolRun {
    pub step: ChainStep,
    pub handle: Option<PipeHandle>,
    pub result: Result<ToolOutput, ToolError>,
}

/// 编排器：持有只读的工具层与 Pipe Cache，run 可被多个会话并发调用
pub struct Orchestrator {
    executor: Arc<ToolExecutor>,
    pipe: Arc<PipeCache>,
    settings: LoopSettings,
}

/// 单次 run 的可变状态
struct RunState {
    phase: LoopPhase,
    chain: Vec<ChainStep>,
    outputs: Vec<Option<ToolOutput>>,
    scratch: Vec<Message>,
    steps_used: usize,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl RunState {
    fn advance(&mut self, next: LoopPhase) {
        debug_assert!(
            self.phase.can_transition(next),
            "illegal loop transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    fn finish(mut self, status: LoopStatus, message: String, widget: Option<(usize, Widget)>) -> LoopOutcome {
        self.advance(match status {
            LoopStatus::Done => LoopPhase::Done,
            LoopStatus::Cancelled => LoopPhase::Cancelled,
            LoopStatus::Failed => LoopPhase::Failed,
        });
        let (widget_step, widget) = widget.unzip();
        LoopOutcome {
            status,
            message,
            chain: self.chain,
            widget,
            widget_step,
            steps_used: self.steps_used,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
        }
    }

    fn tools_used(&self) -> Vec<String> {
        self.chain.iter().map(|s| s.tool_name.clone()).collect()
    }
}

impl Orchestrator {
    pub fn new(executor: Arc<ToolExecutor>, pipe: Arc<PipeCache>, settings: LoopSettings) -> Self {
        Self {
            executor,
            pipe,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.executor.registry()
    }

    pub fn pipe(&self) -> &Arc<PipeCache> {
        &self.pipe
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    fn emit(
        &self,
        progress: Option<&UnboundedSender<ProgressEvent>>,
        state: &RunState,
        phase: LoopPhase,
        tool: Option<&str>,
    ) {
        if let Some(tx) = progress {
            let _ = tx.send(ProgressEvent {
                phase: phase.as_str(),
                tool: tool.map(String::from),
                steps_used: state.steps_used,
                step_budget: self.settings.step_budget,
                tools_used: state.tools_used(),
                prompt_tokens: state.prompt_tokens,
                completion_tokens: state.completion_tokens,
            });
        }
    }

    /// 本轮提供给模型的工具目录；allowed 为 None 时是全部可见工具
    fn active_catalog(&self, allowed: Option<&BTreeSet<String>>) -> Vec<Arc<ToolDescriptor>> {
        self.registry()
            .catalog(true)
            .into_iter()
            .filter(|d| allowed.map_or(true, |a| a.contains(&d.name)))
            .collect()
    }

    /// 运行一次编排循环
    pub async fn run(
        &self,
        llm: Arc<dyn LlmClient>,
        request: LoopRequest,
        cancel: CancellationToken,
        progress: Option<UnboundedSender<ProgressEvent>>,
    ) -> LoopOutcome {
        let progress = progress.as_ref();
        let session_id = request.session_id.as_str();
        let mut state = RunState {
            phase: LoopPhase::Init,
            chain: Vec::new(),
            outputs: Vec::new(),
            scratch: Vec::new(),
            steps_used: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
        };
        let mut recovery = RecoveryEngine::new();
        let mut allowed: Option<BTreeSet<String>> =
            request.hint.as_ref().map(|t| BTreeSet::from([t.clone()]));
        let mut hint = request.hint.clone();

        loop {
            if cancel.is_cancelled() {
                return cancelled(state);
            }

            // THINKING
            state.advance(LoopPhase::Thinking);
            self.emit(progress, &state, LoopPhase::Thinking, None);
            let catalog = self.active_catalog(allowed.as_ref());
            let system = system_prompt(&catalog, &self.pipe.handles(session_id), hint.as_deref());
            let mut messages = Vec::with_capacity(request.history.len() + state.scratch.len() + 1);
            messages.push(Message::system(system));
            messages.extend(request.history.iter().cloned());
            messages.extend(state.scratch.iter().cloned());

            let completion = tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(state),
                r = tokio::time::timeout(self.settings.llm_timeout, llm.complete(&messages)) => r,
            };
            let completion = match completion {
                Ok(Ok(c)) => c,
                Ok(Err(e)) => {
                    let err = AgentError::LlmError(e.to_string());
                    tracing::warn!(session = session_id, error = %err, "llm call failed");
                    return failed(state, err.to_string());
                }
                Err(_) => {
                    let err = AgentError::LlmTimeout(self.settings.llm_timeout.as_secs());
                    tracing::warn!(session = session_id, error = %err, "llm call timed out");
                    return failed(state, err.to_string());
                }
            };
            state.prompt_tokens += completion.prompt_tokens;
            state.completion_tokens += completion.completion_tokens;

            // hint 只限制首轮
            allowed = None;
            hint = None;

            let call = match parse_model_output(&completion.content) {
                ModelAction::FinalAnswer { text, render } => {
                    let widget = pick_widget(&state, render.as_deref());
                    tracing::info!(
                        session = session_id,
                        steps = state.steps_used,
                        prompt_tokens = state.prompt_tokens,
                        completion_tokens = state.completion_tokens,
                        "loop done"
                    );
                    return state.finish(LoopStatus::Done, text, widget);
                }
                ModelAction::Malformed(detail) => {
                    // 每个请求工具（或输出无法解析）的回合消耗一个步数单位
                    if state.steps_used >= self.settings.step_budget {
                        return self.over_budget(state);
                    }
                    state.steps_used += 1;
                    state.scratch.push(Message::assistant(completion.content.clone()));
                    match recovery.handle(&ToolError::MalformedOutput(detail), None) {
                        RecoveryAction::Observe(obs) => {
                            state.scratch.push(Message::user(format!("Observation: {obs}")));
                            continue;
                        }
                        RecoveryAction::Abort(reason) => return aborted(state, reason),
                    }
                }
                ModelAction::ToolCall(call) => call,
            };

            // 每个请求工具（或输出无法解析）的回合消耗一个步数单位
            if state.steps_used >= self.settings.step_budget {
                return self.over_budget(state);
            }
            state.steps_used += 1;
            state.scratch.push(Message::assistant(completion.content.clone()));
            tracing::info!(
                session = session_id,
                step = state.steps_used,
                tool = %call.tool,
                "tool requested"
            );

            let Some(descriptor) = catalog.iter().find(|d| d.name == call.tool).cloned() else {
                let err = ToolError::UnknownTool(call.tool.clone());
                match recovery.handle(&err, None) {
                    RecoveryAction::Observe(obs) => {
                        state.scratch.push(Message::user(format!("Observation: {obs}")));
                        continue;
                    }
                    RecoveryAction::Abort(reason) => return aborted(state, reason),
                }
            };

            if cancel.is_cancelled() {
                return cancelled(state);
            }

            // TOOL_EXEC
            state.advance(LoopPhase::ToolExec);
            self.emit(progress, &state, LoopPhase::ToolExec, Some(&descriptor.name));
            let ToolCall { tool, args } = call;
            let run = self.run_tool(session_id, &descriptor, args).await;
            state.chain.push(run.step);

            match run.result {
                Ok(output) => {
                    recovery.record_success();
                    let stored = run
                        .handle
                        .map(|h| format!("{} ({})", h.reference(), h.label))
                        .unwrap_or_default();
                    let observation = format!(
                        "Observation from {tool}: ok. Result stored as {stored}. Summary: {}",
                        summary::summarize_for_model(&output.data, self.settings.summary_token_limit),
                    );
                    state.outputs.push(Some(output));
                    state.scratch.push(Message::user(observation));
                    allowed = descriptor.next_tools.clone();
                }
                Err(err) => {
                    state.outputs.push(None);
                    match recovery.handle(&err, Some(descriptor.side_effect)) {
                        RecoveryAction::Observe(obs) => {
                            state
                                .scratch
                                .push(Message::user(format!("Observation from {tool}: {obs}")));
                        }
                        RecoveryAction::Abort(reason) => return aborted(state, reason),
                    }
                }
            }
        }
    }

    /// 步数耗尽：FAILED，保留已完成的链
    fn over_budget(&self, state: RunState) -> LoopOutcome {
        let err = AgentError::StepBudgetExceeded(self.settings.step_budget);
        failed(state, format!("{err}. Stopped before reaching a final answer."))
    }

    /// 解析引用、自动补参、校验并执行一个工具；链步骤总会生成
    pub(crate) async fn run_tool(
        &self,
        session_id: &str,
        descriptor: &ToolDescriptor,
        args: Value,
    ) -> ToolRun {
        let name = descriptor.name.as_str();

        let mut resolved = match self
            .pipe
            .resolve_params(session_id, &args, &descriptor.input_schema)
        {
            Ok(v) => v,
            Err(e) => {
                let err = ToolError::from(e);
                return ToolRun {
                    step: ChainStep::failed(name, args, StepStatus::SchemaError, err.to_string()),
                    handle: None,
                    result: Err(err),
                };
            }
        };
        self.auto_pipe(session_id, descriptor, &mut resolved);

        let params = match self.registry().validate(name, &resolved) {
            Ok(p) => p,
            Err(err) => {
                return ToolRun {
                    step: ChainStep::failed(name, resolved, StepStatus::SchemaError, err.to_string()),
                    handle: None,
                    result: Err(err),
                }
            }
        };

        match self.executor.execute(name, params.clone()).await {
            Ok(output) => {
                let handle = self.pipe.put(session_id, output.data.clone());
                let result_summary = match self.registry().get(name) {
                    Some(tool) => tool.format_result(&output),
                    None => summary::short_summary(name, &output.data),
                };
                let widget = Widget::sized(
                    &output.widget_type,
                    output.data.clone(),
                    name,
                    &params,
                    self.settings.widget_data_threshold,
                );
                ToolRun {
                    step: ChainStep {
                        tool_name: name.to_string(),
                        resolved_params: params,
                        result_summary,
                        widget: Some(widget),
                        status: StepStatus::Ok,
                        handle: Some(handle.reference()),
                    },
                    handle: Some(handle),
                    result: Ok(output),
                }
            }
            Err(err) => ToolRun {
                step: ChainStep::failed(name, params, StepStatus::ToolError, err.to_string()),
                handle: None,
                result: Err(err),
            },
        }
    }

    /// 必填字符串参数仍缺失时，从最新的同名长字段结果中补齐
    fn auto_pipe(&self, session_id: &str, descriptor: &ToolDescriptor, params: &mut Value) {
        if params.is_null() {
            *params = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = params else { return };
        for field in descriptor.input_schema.required_fields() {
            if map.get(&field).map_or(false, |v| !v.is_null()) {
                continue;
            }
            if let Some(value) = self
                .pipe
                .find_field(session_id, &field, self.settings.pipe_min_length)
            {
                tracing::debug!(tool = %descriptor.name, field = %field, "auto-piped field from earlier result");
                map.insert(field, value);
            }
        }
    }
}

/// render 指定工具 -> 该工具最近一次成功结果；未指定 -> 最近一次成功结果；未知工具 -> 无组件
fn pick_widget(state: &RunState, render: Option<&str>) -> Option<(usize, Widget)> {
    state
        .chain
        .iter()
        .zip(state.outputs.iter())
        .enumerate()
        .rev()
        .filter(|(_, (step, _))| step.is_ok() && render.map_or(true, |r| step.tool_name == r))
        .find_map(|(i, (_, out))| out.as_ref().map(|o| (i, Widget::fresh(&o.widget_type, o.data.clone()))))
}

fn cancelled(state: RunState) -> LoopOutcome {
    tracing::info!(steps = state.chain.len(), "loop cancelled");
    state.finish(LoopStatus::Cancelled, AgentError::Cancelled.to_string(), None)
}

/// 恢复引擎判定不可再恢复
fn aborted(state: RunState, reason: String) -> LoopOutcome {
    failed(state, AgentError::RepeatedFailure(reason).to_string())
}

fn failed(state: RunState, reason: String) -> LoopOutcome {
    tracing::warn!(steps = state.chain.len(), reason = %reason, "loop failed");
    state.finish(LoopStatus::Failed, reason, None)
}
