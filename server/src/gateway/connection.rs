//! WebSocket connection driver.
//!
//! Couples a socket to a session: the session task produces frames into a
//! bounded channel, and this task writes them out while reading status
//! acks from the subscriber.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::close::CloseReason;
use super::manager::ConnectionManager;
use super::session::{
    handle_inbound, record_delivered, run_session, Outbound, SessionContext, SessionParams,
};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the session with the manager
/// 2. Spawns the session producer
/// 3. Forwards frames and processes inbound messages in a loop
/// 4. Cancels the session and cleans up on disconnect
pub async fn handle_socket(
    socket: WebSocket,
    ctx: SessionContext,
    manager: Arc<ConnectionManager>,
    shard_id: String,
    last_watermark: Option<String>,
    buffer: usize,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(buffer);

    let (session_id, cancel) = manager.register(&shard_id);
    let params = SessionParams {
        session_id: session_id.clone(),
        shard_id: shard_id.clone(),
        last_watermark,
    };
    let shards = ctx.shards.clone();
    let producer = tokio::spawn(run_session(ctx, params, tx, cancel.clone()));

    tracing::info!(session_id = %session_id, shard_id = %shard_id, "subscriber connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Message(message)) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(session_id = %session_id, "Failed to serialize frame: {}", e);
                            let reason = CloseReason::internal("cannot encode frame");
                            let _ = ws_sender.send(reason.into_message()).await;
                            break;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!(session_id = %session_id, "Failed to send frame: {}", e);
                        break;
                    }
                    if let Err(e) = record_delivered(shards.as_ref(), &shard_id, &message).await {
                        tracing::error!(session_id = %session_id, "Failed to record progress: {}", e);
                        let reason = CloseReason::internal(e.to_string());
                        let _ = ws_sender.send(reason.into_message()).await;
                        break;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    tracing::info!(session_id = %session_id, code = reason.code, reason = %reason.reason, "closing");
                    let _ = ws_sender.send(reason.into_message()).await;
                    break;
                }
                // Producer gone without a close: the session was cancelled.
                None => {
                    let reason = if manager.is_shutting_down() {
                        CloseReason::service_restart("server shutting down")
                    } else {
                        CloseReason::service_restart("session cancelled")
                    };
                    let _ = ws_sender.send(reason.into_message()).await;
                    break;
                }
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(reason) = handle_inbound(shards.as_ref(), &shard_id, text.as_str()).await {
                        let _ = ws_sender.send(reason.into_message()).await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let reason = CloseReason::policy_violation("binary frames are not supported");
                    let _ = ws_sender.send(reason.into_message()).await;
                    break;
                }
                Some(Ok(Message::Ping(data))) => {
                    tracing::trace!("Received ping: {} bytes", data.len());
                }
                Some(Ok(Message::Pong(_))) => {
                    tracing::trace!("Received pong");
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(session_id = %session_id, "subscriber closed the socket");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %session_id, "WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    // Clean up
    cancel.cancel();
    manager.unregister(&session_id);
    if let Err(e) = producer.await {
        tracing::error!(session_id = %session_id, "session task panicked: {}", e);
    }

    tracing::info!(
        session_id = %session_id,
        shard_id = %shard_id,
        active_sessions = manager.session_count(),
        "subscriber disconnected"
    );
}
