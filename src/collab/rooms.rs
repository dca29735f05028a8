//! Live WebSocket connection registry for collaboration rooms.
//!
//! Each connection is represented by an unbounded channel sender; the
//! socket task drains the channel. All mutations are non-suspending, so the
//! registry needs no lock beyond the map's own sharding.

use axum::extract::ws::Message;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// One live socket in a room.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Collaboration token this socket authenticated with.
    pub token: String,
    /// Short random id exposed to other members instead of the token.
    pub public_id: String,
    /// Channel into the socket's send task.
    pub sender: UnboundedSender<Message>,
    /// Last accepted `set_username`, for rate limiting.
    pub last_username_change: Option<Instant>,
}

#[derive(Debug, Default)]
struct Room {
    controller: Option<Connection>,
    viewers: HashMap<String, Connection>,
}

/// Registry of live room connections keyed by session id.
#[derive(Debug, Default)]
pub struct RoomConnections {
    rooms: DashMap<Uuid, Room>,
}

impl RoomConnections {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the controller socket, replacing any previous one.
    pub fn register_controller(&self, session_id: Uuid, connection: Connection) {
        self.rooms.entry(session_id).or_default().controller = Some(connection);
    }

    /// Register a viewer socket.
    pub fn register_viewer(&self, session_id: Uuid, connection: Connection) {
        self.rooms
            .entry(session_id)
            .or_default()
            .viewers
            .insert(connection.token.clone(), connection);
    }

    /// Drop the controller socket. Returns true when the room is now empty.
    pub fn unregister_controller(&self, session_id: Uuid) -> bool {
        let empty = self.rooms.get_mut(&session_id).is_some_and(|mut room| {
            room.controller = None;
            room.viewers.is_empty()
        });
        if empty {
            self.rooms.remove(&session_id);
            tracing::info!(session = %session_id, "collab room is empty and was cleaned up");
        }
        empty
    }

    /// Drop a viewer socket. Returns true when the room is now empty.
    pub fn unregister_viewer(&self, session_id: Uuid, token: &str) -> bool {
        let empty = self.rooms.get_mut(&session_id).is_some_and(|mut room| {
            room.viewers.remove(token);
            room.controller.is_none() && room.viewers.is_empty()
        });
        if empty {
            self.rooms.remove(&session_id);
            tracing::info!(session = %session_id, "collab room is empty and was cleaned up");
        }
        empty
    }

    /// Whether the controller socket is live.
    #[must_use]
    pub fn controller_online(&self, session_id: Uuid) -> bool {
        self.rooms
            .get(&session_id)
            .is_some_and(|room| room.controller.is_some())
    }

    /// Public id of the live controller socket.
    #[must_use]
    pub fn controller_public_id(&self, session_id: Uuid) -> Option<String> {
        self.rooms
            .get(&session_id)?
            .controller
            .as_ref()
            .map(|c| c.public_id.clone())
    }

    /// Tokens of viewers with live sockets.
    #[must_use]
    pub fn online_viewer_tokens(&self, session_id: Uuid) -> HashSet<String> {
        self.rooms
            .get(&session_id)
            .map(|room| room.viewers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Public id of a live viewer socket.
    #[must_use]
    pub fn viewer_public_id(&self, session_id: Uuid, token: &str) -> Option<String> {
        self.rooms
            .get(&session_id)?
            .viewers
            .get(token)
            .map(|c| c.public_id.clone())
    }

    /// Read and update the username rate-limit stamp for a viewer socket.
    ///
    /// Returns false when the previous accepted change was under
    /// `min_interval` ago.
    pub fn try_stamp_username_change(
        &self,
        session_id: Uuid,
        token: &str,
        min_interval: std::time::Duration,
    ) -> bool {
        let Some(mut room) = self.rooms.get_mut(&session_id) else {
            return false;
        };
        let Some(connection) = room.viewers.get_mut(token) else {
            return false;
        };
        let now = Instant::now();
        if connection
            .last_username_change
            .is_some_and(|last| now.duration_since(last) < min_interval)
        {
            return false;
        }
        connection.last_username_change = Some(now);
        true
    }

    /// Send a JSON payload to every member of a room.
    pub fn broadcast_json(&self, session_id: Uuid, payload: &serde_json::Value) {
        let Some(room) = self.rooms.get(&session_id) else {
            return;
        };
        let text = payload.to_string();
        if let Some(controller) = &room.controller {
            if controller.sender.send(Message::Text(text.clone().into())).is_err() {
                tracing::warn!(session = %session_id, "failed to send message to controller");
            }
        }
        for viewer in room.viewers.values() {
            if viewer.sender.send(Message::Text(text.clone().into())).is_err() {
                tracing::warn!(session = %session_id, "failed to send message to a viewer");
            }
        }
    }

    /// Send a JSON payload to a single member by token.
    pub fn send_to(&self, session_id: Uuid, token: &str, payload: &serde_json::Value) {
        let Some(room) = self.rooms.get(&session_id) else {
            return;
        };
        let text = payload.to_string();
        let target = room
            .controller
            .as_ref()
            .filter(|c| c.token == token)
            .or_else(|| room.viewers.get(token));
        if let Some(connection) = target {
            let _ = connection.sender.send(Message::Text(text.into()));
        }
    }

    /// Relay raw bytes to every member except the sender.
    pub fn broadcast_binary(&self, session_id: Uuid, payload: &Bytes, sender_token: &str) {
        let Some(room) = self.rooms.get(&session_id) else {
            return;
        };
        if let Some(controller) = &room.controller {
            if controller.token != sender_token
                && controller
                    .sender
                    .send(Message::Binary(payload.clone()))
                    .is_err()
            {
                tracing::warn!(session = %session_id, "failed to send binary to controller");
            }
        }
        for viewer in room.viewers.values() {
            if viewer.token != sender_token
                && viewer.sender.send(Message::Binary(payload.clone())).is_err()
            {
                tracing::warn!(session = %session_id, "failed to send binary to a viewer");
            }
        }
    }
}
