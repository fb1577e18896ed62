pub mod connection;
pub mod handlers;
pub mod voice;

use std::collections::HashSet;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::events::OutboundFrame;

/// Fan-out group for everyone joined to a server.
pub fn server_room(server_id: Uuid) -> String {
    format!("server:{server_id}")
}

/// Fan-out group for the occupants of one channel.
pub fn channel_room(channel_id: Uuid) -> String {
    format!("channel:{channel_id}")
}

/// The room broker: maps live connections to named rooms and fans events
/// out to them. Membership changes only through join/leave on a session.
pub struct GatewayState {
    /// connection_id -> outbound sender
    connections: DashMap<Uuid, ConnectionHandle>,
    /// room name -> set of connection_ids
    rooms: DashMap<String, HashSet<Uuid>>,
}

struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Message>,
}

impl GatewayState {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    pub fn add_connection(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<Message>) {
        self.connections
            .insert(connection_id, ConnectionHandle { sender });
    }

    /// Drop the connection and scrub it from every room.
    pub fn remove_connection(&self, connection_id: Uuid) {
        self.connections.remove(&connection_id);
        self.rooms.retain(|_, members| {
            members.remove(&connection_id);
            !members.is_empty()
        });
    }

    pub fn join_room(&self, room: &str, connection_id: Uuid) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
    }

    pub fn leave_room(&self, room: &str, connection_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&connection_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
    }

    /// Send a frame to one session. Delivery failures mean the connection is
    /// already gone; its cleanup will run from the socket loop.
    pub fn send_to_session(&self, connection_id: Uuid, frame: &OutboundFrame) {
        if let Some(handle) = self.connections.get(&connection_id) {
            if let Some(msg) = encode(frame) {
                let _ = handle.sender.send(msg);
            }
        }
    }

    /// Deliver to every current subscriber of the room.
    pub fn emit_to_room(&self, room: &str, frame: &OutboundFrame) {
        self.emit(room, frame, None);
    }

    /// Deliver to every subscriber except the emitting session, so actors do
    /// not receive their own join/leave notifications.
    pub fn emit_to_room_except(&self, room: &str, except: Uuid, frame: &OutboundFrame) {
        self.emit(room, frame, Some(except));
    }

    fn emit(&self, room: &str, frame: &OutboundFrame, except: Option<Uuid>) {
        let Some(msg) = encode(frame) else {
            return;
        };
        if let Some(members) = self.rooms.get(room) {
            for connection_id in members.iter() {
                if except == Some(*connection_id) {
                    continue;
                }
                if let Some(handle) = self.connections.get(connection_id) {
                    let _ = handle.sender.send(msg.clone());
                }
            }
        }
    }

    #[cfg(test)]
    fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }
}

fn encode(frame: &OutboundFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(error = %e, event = %frame.event, "Failed to encode outbound frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(gateway: &GatewayState) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::now_v7();
        gateway.add_connection(id, tx);
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(text.to_string());
            }
        }
        out
    }

    #[test]
    fn test_emit_reaches_all_members() {
        let gateway = GatewayState::new();
        let (a, mut rx_a) = connect(&gateway);
        let (b, mut rx_b) = connect(&gateway);
        let room = channel_room(Uuid::now_v7());
        gateway.join_room(&room, a);
        gateway.join_room(&room, b);

        gateway.emit_to_room(&room, &OutboundFrame::event("PING", serde_json::json!({})));

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_emit_except_skips_the_actor() {
        let gateway = GatewayState::new();
        let (a, mut rx_a) = connect(&gateway);
        let (b, mut rx_b) = connect(&gateway);
        let room = channel_room(Uuid::now_v7());
        gateway.join_room(&room, a);
        gateway.join_room(&room, b);

        let frame = OutboundFrame::event("NEW_PRODUCER", serde_json::json!({ "who": "a" }));
        gateway.emit_to_room_except(&room, a, &frame);

        assert_eq!(drain(&mut rx_a).len(), 0);
        let received = drain(&mut rx_b);
        assert_eq!(received.len(), 1);
        assert!(received[0].contains("NEW_PRODUCER"));
    }

    #[test]
    fn test_non_members_receive_nothing() {
        let gateway = GatewayState::new();
        let (a, _rx_a) = connect(&gateway);
        let (_b, mut rx_b) = connect(&gateway);
        let room = server_room(Uuid::now_v7());
        gateway.join_room(&room, a);

        gateway.emit_to_room(&room, &OutboundFrame::event("PING", serde_json::json!({})));

        assert_eq!(drain(&mut rx_b).len(), 0);
    }

    #[test]
    fn test_remove_connection_scrubs_rooms() {
        let gateway = GatewayState::new();
        let (a, _rx_a) = connect(&gateway);
        let room = server_room(Uuid::now_v7());
        gateway.join_room(&room, a);
        assert_eq!(gateway.room_size(&room), 1);

        gateway.remove_connection(a);
        assert_eq!(gateway.room_size(&room), 0);
    }

    #[test]
    fn test_leave_room_is_scoped_to_that_room() {
        let gateway = GatewayState::new();
        let (a, mut rx_a) = connect(&gateway);
        let server = server_room(Uuid::now_v7());
        let channel = channel_room(Uuid::now_v7());
        gateway.join_room(&server, a);
        gateway.join_room(&channel, a);

        gateway.leave_room(&channel, a);
        gateway.emit_to_room(&server, &OutboundFrame::event("PING", serde_json::json!({})));
        gateway.emit_to_room(&channel, &OutboundFrame::event("PING", serde_json::json!({})));

        assert_eq!(drain(&mut rx_a).len(), 1);
    }
}
