//! Hive - 本地 REPL
//!
//! 从 stdin 逐行读取输入，驱动单个会话：
//! - 普通文本 / `/tool ...` / `//tool {...}` 作为消息发送
//! - `:cancel` 取消当前循环，`:model <id>` 切换模型，`:history [n]` 查看历史，`:quit` 退出

use std::sync::Arc;

use anyhow::Context;
use hive::config::load_or_default;
use hive::gateway::{Inbound, Outbound, Runtime, SessionManager};
use hive::react::Widget;
use hive::tools::{EchoTool, ToolRegistry};
use tokio::io::{AsyncBufReadExt, BufReader};

fn parse_line(line: &str) -> Option<Inbound> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let msg = match parts.next() {
        Some(":cancel") => Inbound::Cancel,
        Some(":model") => Inbound::SetModel {
            model_id: parts.next().unwrap_or_default().trim().to_string(),
        },
        Some(":history") => Inbound::GetHistory {
            limit: parts.next().and_then(|n| n.trim().parse().ok()),
        },
        _ => Inbound::Message {
            content: line.to_string(),
        },
    };
    Some(msg)
}

fn render(event: &Outbound) {
    match event {
        Outbound::Init {
            session_id,
            current_model,
            help,
            ..
        } => {
            println!("session {session_id} (model: {current_model})\n");
            println!("{help}\n");
        }
        Outbound::Progress(p) => match &p.tool {
            Some(tool) => println!("  [{}] {} ({}/{})", p.phase, tool, p.steps_used, p.step_budget),
            None => println!("  [{}] ({}/{})", p.phase, p.steps_used, p.step_budget),
        },
        Outbound::Message { outcome, .. } => {
            println!("{:?}: {}", outcome.status, outcome.message);
            if let Some(Widget::AwaitingParams { form }) = &outcome.widget {
                let schema = serde_json::to_string(&form.schema.to_json_schema()).unwrap_or_default();
                println!("  form for {}: {}", form.tool, schema);
            }
        }
        Outbound::Cancelled => println!("(cancelled)"),
        Outbound::WidgetData { tool, content, .. } => println!("[{tool}] {content}"),
        Outbound::ModelChanged { model_id } => println!("model -> {model_id}"),
        Outbound::History { entries } => {
            for e in entries {
                let mark = if e.active { ' ' } else { '~' };
                println!("{mark} {:?}: {}", e.role, e.content);
            }
        }
        Outbound::Error { code, message } => eprintln!("error[{code}]: {message}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_or_default(None);

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool).context("Failed to register tools")?;

    let runtime = Arc::new(Runtime::from_config(&cfg, registry));
    let sessions = SessionManager::new(runtime);
    let conn = sessions.connect().await;
    let session_id = conn.id.clone();
    let inbound = conn.inbound;
    let mut outbound = conn.outbound;

    let printer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            render(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                if line.trim() == ":quit" {
                    break;
                }
                if let Some(msg) = parse_line(&line) {
                    if inbound.send(msg).is_err() {
                        break;
                    }
                }
            }
        }
    }

    sessions.disconnect(&session_id).await;
    drop(inbound);
    let _ = printer.await;
    Ok(())
}
