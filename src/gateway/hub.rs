//! Hub - WebSocket 接入
//!
//! 每个 WebSocket 连接对应一个会话：连接即创建（首帧为 init），断开即销毁。
//! 文本帧为 JSON 编码的 Inbound，出站事件同样以 JSON 文本帧写回。

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::message::{Inbound, Outbound};
use super::session::SessionManager;

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// WebSocket 监听地址
    pub bind_addr: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
        }
    }
}

pub struct Hub {
    config: HubConfig,
    sessions: Arc<SessionManager>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(config: HubConfig, sessions: Arc<SessionManager>) -> Self {
        Self {
            config,
            sessions,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// 启动监听与缓存清理任务，返回实际监听地址
    pub async fn start(&self) -> Result<SocketAddr, String> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))?;
        let local = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        tracing::info!("Gateway listening on ws://{}", local);

        self.sessions.spawn_janitor(self.shutdown.clone());

        let shutdown = self.shutdown.clone();
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            let sessions = Arc::clone(&sessions);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, sessions).await {
                                    tracing::error!("Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
            }
        });

        Ok(local)
    }

    /// 停止监听并断开全部会话
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.sessions.shutdown().await;
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.active_count().await
    }
}

fn encode(event: &Outbound) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(event = event.kind(), error = %e, "failed to encode outbound event");
            None
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sessions: Arc<SessionManager>,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let conn = sessions.connect().await;
    let session_id = conn.id.clone();
    let inbound = conn.inbound;
    let mut outbound = conn.outbound;
    tracing::info!(session = %session_id, "New WebSocket connection from {}", peer);

    // 解析错误直接回写，不经过会话
    let (reject_tx, mut reject_rx) = tokio::sync::mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(e) = outbound.recv() => e,
                Some(e) = reject_rx.recv() => e,
                else => break,
            };
            let Some(json) = encode(&event) else { continue };
            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<Inbound>(&text) {
                Ok(inbound_msg) => {
                    if inbound.send(inbound_msg).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = reject_tx.send(Outbound::error("parse_error", e.to_string()));
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    drop(reject_tx);
    sessions.disconnect(&session_id).await;
    let _ = writer.await;

    tracing::info!(session = %session_id, "WebSocket connection closed: {}", peer);
    Ok(())
}
