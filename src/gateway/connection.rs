use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gateway::handlers::{self, Session};
use crate::state::AppState;
use crate::types::events::{InboundFrame, OutboundFrame};

const PING_INTERVAL: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// One task per socket. Events are processed strictly in arrival order, so
/// per-session ordering (and the voice handshake sequence in particular)
/// holds without extra synchronization.
pub async fn handle_connection(state: AppState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let connection_id = Uuid::now_v7();
    state.gateway.add_connection(connection_id, tx.clone());

    // Forward broker/handler output to the socket
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(connection_id);
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut last_pong = Instant::now();

    tracing::debug!(connection_id = %connection_id, "Client connected");

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        handle_frame(&state, &mut session, text.as_str()).await;
                    }
                    Message::Pong(_) => last_pong = Instant::now(),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > PING_INTERVAL + PONG_TIMEOUT {
                    tracing::info!(connection_id = %connection_id, "Connection timed out");
                    break;
                }
                let _ = tx.send(Message::Ping(Vec::new().into()));
            }
        }
    }

    // In-flight work has finished by the time we get here; release
    // everything in the documented order, then drop the connection.
    handlers::cleanup_on_disconnect(&state, &mut session).await;
    state.gateway.remove_connection(connection_id);
    sender_task.abort();

    tracing::debug!(connection_id = %connection_id, "Client disconnected");
}

/// Decode one frame and run its handler. Failures become a negative ack
/// when the client asked for one, an ERROR event otherwise; they never
/// reach the transport.
async fn handle_frame(state: &AppState, session: &mut Session, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(connection_id = %session.connection_id, error = %e, "Malformed frame");
            state
                .gateway
                .send_to_session(session.connection_id, &OutboundFrame::error("Malformed frame"));
            return;
        }
    };

    let ack = frame.ack;
    let event_name = frame.event.clone();
    let event = match frame.into_event() {
        Ok((event, _)) => event,
        Err(e) => {
            tracing::warn!(connection_id = %session.connection_id, event = %event_name, error = %e, "Unrecognized event");
            let reply = match ack {
                Some(id) => OutboundFrame::ack_err(id, "Unrecognized event"),
                None => OutboundFrame::error("Unrecognized event"),
            };
            state.gateway.send_to_session(session.connection_id, &reply);
            return;
        }
    };

    match handlers::dispatch(state, session, event).await {
        Ok(data) => {
            if let Some(id) = ack {
                state
                    .gateway
                    .send_to_session(session.connection_id, &OutboundFrame::ack_ok(id, data));
            }
        }
        Err(err) => {
            if err.is_backend() {
                tracing::error!(connection_id = %session.connection_id, event = %event_name, error = %err, "Event handler failed");
            } else {
                tracing::debug!(connection_id = %session.connection_id, event = %event_name, error = %err, "Event rejected");
            }
            let message = err.client_message();
            let reply = match ack {
                Some(id) => OutboundFrame::ack_err(id, &message),
                None => OutboundFrame::error(&message),
            };
            state.gateway.send_to_session(session.connection_id, &reply);
        }
    }
}
