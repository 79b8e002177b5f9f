//! 编排循环集成测试（MockLlmClient + 桩工具）

mod common;

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::llm::{Completion, LlmClient, LlmError, MockLlmClient};
    use hive::memory::Message;
    use hive::react::{
        classify, execute_direct, Dispatch, LoopRequest, LoopSettings, LoopStatus, StepStatus, Widget,
    };
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::common::{Fixture, SEQUENCE_LEN};

    fn request(session: &str, text: &str) -> LoopRequest {
        LoopRequest {
            session_id: session.to_string(),
            history: vec![Message::user(text)],
            hint: None,
        }
    }

    /// 第二轮从观察中取出 `@pipe:` 引用并交给 translate
    #[derive(Default)]
    struct RelayLlm {
        requests: Mutex<Vec<Vec<Message>>>,
    }

    #[async_trait]
    impl LlmClient for RelayLlm {
        async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError> {
            let n = {
                let mut reqs = self.requests.lock().unwrap();
                reqs.push(messages.to_vec());
                reqs.len()
            };
            let content = match n {
                1 => json!({"tool": "find", "args": {"query": "pUC19"}}).to_string(),
                2 => {
                    let obs = &messages.last().unwrap().content;
                    let start = obs.find("@pipe:").unwrap();
                    let reference: String = obs[start..].chars().take("@pipe:".len() + 12).collect();
                    json!({"tool": "translate", "args": {"sequence": reference}}).to_string()
                }
                _ => json!({"answer": "Translated pUC19.", "render": "translate"}).to_string(),
            };
            Ok(Completion {
                content,
                prompt_tokens: 10,
                completion_tokens: 5,
            })
        }

        fn model_name(&self) -> &str {
            "relay"
        }
    }

    #[tokio::test]
    async fn test_find_then_translate_relays_handle() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(LoopSettings::default());
        let llm = Arc::new(RelayLlm::default());

        let outcome = orch
            .run(
                llm.clone(),
                request("s1", "find pUC19 then translate it"),
                CancellationToken::new(),
                None,
            )
            .await;

        assert_eq!(outcome.status, LoopStatus::Done);
        assert_eq!(outcome.chain.len(), 2);
        assert_eq!(outcome.chain[1].tool_name, "translate");
        assert_eq!(outcome.widget_step, Some(1));

        // 第二个工具拿到完整数据
        let received = fx.translate.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].len(), SEQUENCE_LEN);

        // 第二轮上下文只有引用与标签
        let handles = orch.pipe().handles("s1");
        let find_label = handles[0].label.clone();
        let second = llm.requests.lock().unwrap()[1].clone();
        let context: String = second.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        assert!(context.contains("@pipe:"));
        assert!(context.contains(&find_label));
        assert!(!context.contains(&"ACGT".repeat(SEQUENCE_LEN / 4)));
    }

    #[tokio::test]
    async fn test_step_budget_bounds_the_chain() {
        let fx = Fixture::new();
        let settings = LoopSettings {
            step_budget: 2,
            ..LoopSettings::default()
        };
        let orch = fx.orchestrator(settings);
        let call = r#"{"tool": "echo", "args": {"text": "again"}}"#;
        let mock = Arc::new(MockLlmClient::with_replies([call, call, call, call]));

        let outcome = orch
            .run(mock.clone(), request("s1", "loop forever"), CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, LoopStatus::Failed);
        assert_eq!(outcome.steps_used, 2);
        assert_eq!(outcome.chain.len(), 2);
        assert!(outcome.chain.iter().all(|s| s.status == StepStatus::Ok));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_cancel_during_thinking() {
        let fx = Fixture::new();
        let orch = Arc::new(fx.orchestrator(LoopSettings::default()));
        let mock = Arc::new(MockLlmClient::new().with_delay(Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let run = {
            let orch = Arc::clone(&orch);
            let cancel = cancel.clone();
            let mock = mock.clone();
            tokio::spawn(async move { orch.run(mock, request("s1", "slow"), cancel, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("loop should stop promptly")
            .unwrap();
        assert_eq!(outcome.status, LoopStatus::Cancelled);
        assert!(outcome.chain.is_empty());
        assert_eq!(mock.call_count(), 1);
        assert_eq!(outcome.message, "Cancelled by user");
    }

    #[tokio::test]
    async fn test_unknown_tool_twice_fails_after_one_retry() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(LoopSettings::default());
        let foo = r#"{"tool": "fooTool", "args": {}}"#;
        let mock = Arc::new(MockLlmClient::with_replies([foo, foo]));

        let outcome = orch
            .run(mock.clone(), request("s1", "use foo"), CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, LoopStatus::Failed);
        assert_eq!(mock.call_count(), 2);
        assert!(outcome.message.starts_with("Stopped after unrecoverable tool failure"));
        assert!(outcome.chain.is_empty());
        // 第二轮上下文带着第一次的错误观察
        let second = &mock.requests()[1];
        assert!(second.iter().any(|m| m.content.contains("unknown_tool")));
    }

    #[tokio::test]
    async fn test_form_then_resubmit_executes_once() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(LoopSettings::default());

        let first = execute_direct(&orch, "s1", "find", None).await;
        assert_eq!(first.status, LoopStatus::Done);
        let Some(Widget::AwaitingParams { mut form }) = first.widget else {
            panic!("expected a parameter form");
        };
        assert_eq!(form.missing, vec!["query".to_string()]);
        assert_eq!(fx.find.calls.load(Ordering::SeqCst), 0);

        let text = form.submit(&json!({"query": "pUC19"}));
        let Dispatch::Direct { tool, payload } = classify(orch.registry(), &text) else {
            panic!("resubmission should be a direct command");
        };
        let second = execute_direct(&orch, "s1", &tool, payload).await;

        assert_eq!(second.status, LoopStatus::Done);
        assert_eq!(second.chain.len(), 1);
        assert_eq!(fx.find.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rerun_step_matches_output_contract() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(LoopSettings::default());

        let first = execute_direct(&orch, "s1", "find", Some(json!({"query": "pBR322"}))).await;
        let step = first.chain[0].clone();
        let rerun = execute_direct(&orch, "s1", &step.tool_name, Some(step.resolved_params)).await;

        let contract = orch.registry().descriptor("find").unwrap().output_contract.clone();
        match rerun.widget {
            Some(Widget::Fresh { widget_type, data }) => {
                assert_eq!(widget_type, contract);
                assert_eq!(data["accession"], "pBR322");
            }
            other => panic!("expected a fresh widget, got {other:?}"),
        }
        // 大结果在链中以 stale 形式记录，可凭参数重跑
        assert!(matches!(step.widget, Some(Widget::Stale { .. })));
    }

    #[tokio::test]
    async fn test_direct_mode_rejects_foreign_handle() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(LoopSettings::default());

        let found = execute_direct(&orch, "alice", "find", Some(json!({"query": "pUC19"}))).await;
        let handle = found.chain[0].handle.clone().unwrap();

        let stolen = execute_direct(&orch, "bob", "translate", Some(json!({"sequence": handle}))).await;
        assert_eq!(stolen.status, LoopStatus::Failed);
        assert!(fx.translate.received().is_empty());

        let own = execute_direct(&orch, "alice", "translate", Some(json!({"sequence": handle}))).await;
        assert_eq!(own.status, LoopStatus::Done);
        assert_eq!(fx.translate.received()[0].len(), SEQUENCE_LEN);
    }
}
