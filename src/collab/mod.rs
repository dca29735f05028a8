//! Collaboration rooms: many-to-one multiplexing of a session to a
//! controller plus N viewers, with server-mediated input ownership.

pub mod control_plane;
pub mod rooms;

use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::{Error, Result, Session, ViewerPermission};
use crate::launch::new_viewer;
use crate::store::SessionStore;
use crate::util::constant_time_eq;
pub use control_plane::{ControlPlaneClient, HttpControlPlane, RecordingControlPlane};
pub use rooms::{Connection, RoomConnections};

/// Binary frames at or above this size are dropped.
pub const MAX_BINARY_FRAME: usize = 1024 * 1024;

/// First byte of audio packets in the binary stream.
pub const AUDIO_PACKET_TAG: u8 = 0x02;

/// Minimum interval between accepted username changes per socket.
const USERNAME_CHANGE_INTERVAL: Duration = Duration::from_secs(2);

fn ts_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Resolution of an incoming room page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomAccess {
    /// Session owner or controller-token holder.
    Controller,
    /// An admitted viewer presenting their stored token.
    Viewer {
        /// The viewer's stored token.
        token: String,
        /// The viewer's stored permission.
        permission: ViewerPermission,
    },
    /// A valid invite token; a viewer must be minted and the client
    /// redirected to its personal token.
    NewViewer {
        /// Permission level granted by the invite.
        permission: ViewerPermission,
    },
    /// No valid token presented.
    Denied,
}

/// Room state machine over the session store and live connections.
pub struct CollabService {
    store: Arc<SessionStore>,
    rooms: RoomConnections,
    control_plane: Arc<dyn ControlPlaneClient>,
}

impl std::fmt::Debug for CollabService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabService").finish_non_exhaustive()
    }
}

impl CollabService {
    /// Wire up the service.
    #[must_use]
    pub fn new(store: Arc<SessionStore>, control_plane: Arc<dyn ControlPlaneClient>) -> Self {
        Self {
            store,
            rooms: RoomConnections::new(),
            control_plane,
        }
    }

    /// The live connection registry.
    #[must_use]
    pub fn rooms(&self) -> &RoomConnections {
        &self.rooms
    }

    /// Classify a room page request by the tokens it presents.
    #[must_use]
    pub fn resolve_access(
        session: &Session,
        main_access_token: Option<&str>,
        collab_token: Option<&str>,
    ) -> RoomAccess {
        if main_access_token
            .is_some_and(|token| constant_time_eq(token, &session.access_token))
        {
            return RoomAccess::Controller;
        }
        let Some(collab_token) = collab_token else {
            return RoomAccess::Denied;
        };
        if session
            .controller_token
            .as_deref()
            .is_some_and(|t| constant_time_eq(collab_token, t))
        {
            return RoomAccess::Controller;
        }
        if let Some(viewer) = session.viewer(collab_token) {
            return RoomAccess::Viewer {
                token: viewer.token.clone(),
                permission: viewer.permission,
            };
        }
        if session
            .participant_invite_token
            .as_deref()
            .is_some_and(|t| constant_time_eq(collab_token, t))
        {
            return RoomAccess::NewViewer {
                permission: ViewerPermission::Participant,
            };
        }
        if session
            .readonly_invite_token
            .as_deref()
            .is_some_and(|t| constant_time_eq(collab_token, t))
        {
            return RoomAccess::NewViewer {
                permission: ViewerPermission::ReadOnly,
            };
        }
        RoomAccess::Denied
    }

    /// Mint a viewer for a redeemed invite token and publish the new state
    /// downstream. Returns the viewer's personal token.
    ///
    /// # Errors
    /// `NotFound` when the session vanished mid-join.
    pub async fn admit_viewer(
        &self,
        session_id: Uuid,
        permission: ViewerPermission,
    ) -> Result<String> {
        let viewer = new_viewer(permission);
        let token = viewer.token.clone();
        let session = self
            .store
            .update(session_id, |s| s.viewers.push(viewer))
            .await?
            .ok_or_else(|| Error::not_found("Collaboration room not found."))?;
        self.broadcast_token_state(&session).await;
        tracing::info!(
            session = %session_id,
            permission = %permission,
            "new viewer joined, token created and pushed"
        );
        Ok(token)
    }

    /// Authenticate a websocket join token against a session.
    ///
    /// Returns `(is_controller, permission)`; `None` when the token grants
    /// nothing.
    #[must_use]
    pub fn authenticate_socket(
        session: &Session,
        token: &str,
    ) -> Option<(bool, Option<ViewerPermission>)> {
        if session
            .controller_token
            .as_deref()
            .is_some_and(|t| constant_time_eq(token, t))
        {
            return Some((true, None));
        }
        session
            .viewer(token)
            .map(|v| (false, Some(v.permission)))
    }

    /// Push the authoritative token map to every downstream container.
    ///
    /// Best-effort with a short per-target timeout; failures are ignored
    /// (the next push converges).
    pub async fn broadcast_token_state(&self, session: &Session) {
        let Some(controller_token) = session.controller_token.as_deref() else {
            return;
        };
        let Some(master_token) = session.master_token.as_deref() else {
            return;
        };

        let mk_owner = session.mk_owner_token.as_deref();
        let mut tokens = serde_json::Map::new();
        tokens.insert(
            controller_token.to_owned(),
            json!({
                "role": "controller",
                "slot": session.controller_slot,
                "mk_control": mk_owner.map_or(true, |owner| owner == controller_token),
            }),
        );
        for viewer in &session.viewers {
            tokens.insert(
                viewer.token.clone(),
                json!({
                    "role": "viewer",
                    "slot": viewer.slot,
                    "mk_control": mk_owner == Some(viewer.token.as_str()),
                }),
            );
        }
        let payload = Value::Object(tokens);

        for ip in session.downstream_ips() {
            if let Err(e) = self
                .control_plane
                .push_tokens(&ip, master_token, &payload)
                .await
            {
                tracing::debug!(session = %session.session_id, ip, error = %e, "token push failed");
            }
        }
    }

    /// Broadcast the full membership/ownership state to every live socket.
    pub async fn broadcast_state(&self, session_id: Uuid) {
        let Some(session) = self.store.get(session_id).await else {
            return;
        };
        let mk_owner = session.mk_owner_token.as_deref();
        let controller_token = session.controller_token.clone().unwrap_or_default();

        let mut users = vec![json!({
            "token": controller_token,
            "username": "Controller",
            "slot": session.controller_slot,
            "online": self.rooms.controller_online(session_id),
            "has_mk": mk_owner.is_none() || mk_owner == Some(controller_token.as_str()),
            "permission": "controller",
            "publicId": self.rooms.controller_public_id(session_id),
        })];

        let online = self.rooms.online_viewer_tokens(session_id);
        for viewer in &session.viewers {
            let is_online = online.contains(&viewer.token);
            let mut entry = json!({
                "token": viewer.token,
                "username": viewer.username,
                "slot": viewer.slot,
                "permission": viewer.permission,
                "has_mk": mk_owner == Some(viewer.token.as_str()),
                "online": is_online,
            });
            if is_online {
                if let Some(public_id) = self.rooms.viewer_public_id(session_id, &viewer.token) {
                    entry["publicId"] = json!(public_id);
                }
            }
            users.push(entry);
        }

        self.rooms.broadcast_json(
            session_id,
            &json!({
                "type": "state_update",
                "viewers": users,
                "designated_speaker": session.designated_speaker,
            }),
        );
    }

    /// Announce a join and publish state.
    pub async fn handle_join(&self, session_id: Uuid, username: &str) {
        self.rooms.broadcast_json(
            session_id,
            &json!({
                "type": "user_joined",
                "username": username,
                "timestamp": ts_ms(),
            }),
        );
        self.broadcast_state(session_id).await;
    }

    /// Dispatch one JSON control frame from a room member.
    pub async fn handle_text(
        &self,
        session_id: Uuid,
        sender_token: &str,
        is_controller: bool,
        data: &Value,
    ) {
        let action = data.get("action").and_then(Value::as_str).unwrap_or("");
        match action {
            "assign_slot" if is_controller => {
                let viewer_token = data.get("viewer_token").and_then(Value::as_str);
                let slot = data.get("slot").and_then(Value::as_u64).map(|s| s as u32);
                if let Some(viewer_token) = viewer_token {
                    self.assign_slot(session_id, viewer_token, slot).await;
                }
            }
            "assign_mk" if is_controller => {
                let target = data.get("token").and_then(Value::as_str);
                self.assign_mk(session_id, target).await;
            }
            "set_designated_speaker" if is_controller => {
                let speaker = data
                    .get("token")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                self.set_designated_speaker(session_id, speaker).await;
            }
            "set_username" if !is_controller => {
                let username = data
                    .get("username")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_owned();
                self.set_username(session_id, sender_token, &username).await;
            }
            "send_chat_message" => {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_owned();
                let reply_to = data.get("replyTo").cloned().unwrap_or(Value::Null);
                self.send_chat(session_id, sender_token, is_controller, &message, reply_to)
                    .await;
            }
            "video_state" | "audio_state" => {
                let mut payload = data.clone();
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("sender_token".to_owned(), json!(sender_token));
                }
                self.rooms.broadcast_json(
                    session_id,
                    &json!({ "type": "control", "payload": payload }),
                );
            }
            other => {
                tracing::debug!(session = %session_id, action = other, "ignoring room action");
            }
        }
    }

    /// Relay one binary frame, enforcing permission, size and speaker rules.
    pub async fn handle_binary(
        &self,
        session_id: Uuid,
        sender_token: &str,
        permission: Option<ViewerPermission>,
        data: &Bytes,
    ) {
        if permission == Some(ViewerPermission::ReadOnly) {
            tracing::warn!(session = %session_id, "discarding binary packet from read-only user");
            return;
        }
        if data.len() >= MAX_BINARY_FRAME {
            tracing::warn!(
                session = %session_id,
                bytes = data.len(),
                "discarding oversized binary packet"
            );
            return;
        }
        if let Some(session) = self.store.get(session_id).await {
            if let Some(speaker) = session.designated_speaker.as_deref() {
                let is_audio = data.first() == Some(&AUDIO_PACKET_TAG);
                if is_audio && sender_token != speaker {
                    return;
                }
            }
        }
        self.rooms.broadcast_binary(session_id, data, sender_token);
    }

    async fn assign_slot(&self, session_id: Uuid, viewer_token: &str, slot: Option<u32>) {
        let Some(session) = self.store.get(session_id).await else {
            return;
        };

        let is_controller_target = session
            .controller_token
            .as_deref()
            .is_some_and(|t| t == viewer_token);
        let target_exists =
            is_controller_target || session.viewer(viewer_token).is_some();
        if !target_exists {
            tracing::warn!(session = %session_id, "attempted to assign slot to non-existent user");
            return;
        }

        let mut notifications: Vec<String> = Vec::new();
        let update = self
            .store
            .update(session_id, |s| {
                let target_username = if is_controller_target {
                    "Controller".to_owned()
                } else {
                    s.viewer(viewer_token)
                        .map_or_else(|| "Unnamed".to_owned(), |v| v.username.clone())
                };
                let old_slot = if is_controller_target {
                    s.controller_slot
                } else {
                    s.viewer(viewer_token).and_then(|v| v.slot)
                };

                if let Some(slot) = slot {
                    // Preempt whoever currently holds the slot.
                    if s.controller_slot == Some(slot) && !is_controller_target {
                        s.controller_slot = None;
                        notifications
                            .push(format!("Controller was unassigned from Gamepad {slot}."));
                    } else {
                        for viewer in &mut s.viewers {
                            if viewer.slot == Some(slot) && viewer.token != viewer_token {
                                viewer.slot = None;
                                notifications.push(format!(
                                    "{} was unassigned from Gamepad {slot}.",
                                    viewer.username
                                ));
                                break;
                            }
                        }
                    }
                }

                if is_controller_target {
                    s.controller_slot = slot;
                } else if let Some(viewer) = s.viewer_mut(viewer_token) {
                    viewer.slot = slot;
                }

                match (slot, old_slot) {
                    (Some(new), old) if old != Some(new) => {
                        notifications
                            .push(format!("Gamepad {new} was assigned to {target_username}."));
                    }
                    (None, Some(old)) => {
                        notifications.push(format!(
                            "{target_username} was unassigned from Gamepad {old}."
                        ));
                    }
                    _ => {}
                }
            })
            .await;

        match update {
            Ok(Some(session)) => {
                self.broadcast_token_state(&session).await;
                tracing::info!(session = %session_id, ?slot, "assigned gamepad slot");
                for message in notifications {
                    self.rooms.broadcast_json(
                        session_id,
                        &json!({
                            "type": "gamepad_change",
                            "message": message,
                            "timestamp": ts_ms(),
                        }),
                    );
                }
                self.broadcast_state(session_id).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "failed to persist slot assignment");
            }
        }
    }

    async fn assign_mk(&self, session_id: Uuid, target_token: Option<&str>) {
        let Some(session) = self.store.get(session_id).await else {
            return;
        };
        // Assigning to the controller is stored as the implicit default.
        let target = target_token
            .filter(|t| session.controller_token.as_deref() != Some(*t))
            .map(str::to_owned);
        if session.mk_owner_token == target {
            return;
        }

        let username = target.as_deref().map_or_else(
            || "Controller".to_owned(),
            |token| {
                session
                    .viewer(token)
                    .map_or_else(|| "User".to_owned(), |v| v.username.clone())
            },
        );

        match self
            .store
            .update(session_id, |s| s.mk_owner_token = target.clone())
            .await
        {
            Ok(Some(session)) => {
                self.broadcast_token_state(&session).await;
                self.rooms.broadcast_json(
                    session_id,
                    &json!({
                        "type": "mk_change",
                        "message": format!("Mouse & Keyboard control assigned to {username}."),
                        "timestamp": ts_ms(),
                    }),
                );
                self.broadcast_state(session_id).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "failed to assign MK control");
            }
        }
    }

    async fn set_designated_speaker(&self, session_id: Uuid, speaker: Option<String>) {
        match self
            .store
            .update(session_id, |s| s.designated_speaker = speaker.clone())
            .await
        {
            Ok(Some(_)) => {
                tracing::info!(session = %session_id, ?speaker, "designated speaker set");
                self.broadcast_state(session_id).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "failed to set designated speaker");
            }
        }
    }

    async fn set_username(&self, session_id: Uuid, token: &str, new_username: &str) {
        if new_username.is_empty() || new_username.len() > 25 {
            return;
        }
        if !self
            .rooms
            .try_stamp_username_change(session_id, token, USERNAME_CHANGE_INTERVAL)
        {
            return;
        }
        let Some(session) = self.store.get(session_id).await else {
            return;
        };
        let Some(old_username) = session.viewer(token).map(|v| v.username.clone()) else {
            return;
        };
        if old_username == new_username {
            return;
        }

        match self
            .store
            .update(session_id, |s| {
                if let Some(viewer) = s.viewer_mut(token) {
                    viewer.username = new_username.to_owned();
                }
            })
            .await
        {
            Ok(Some(_)) => {
                tracing::info!(
                    session = %session_id,
                    from = %old_username,
                    to = %new_username,
                    "viewer changed name"
                );
                self.rooms.broadcast_json(
                    session_id,
                    &json!({
                        "type": "username_changed",
                        "old_username": old_username,
                        "new_username": new_username,
                        "timestamp": ts_ms(),
                    }),
                );
                self.broadcast_state(session_id).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "failed to persist username change");
            }
        }
    }

    async fn send_chat(
        &self,
        session_id: Uuid,
        sender_token: &str,
        is_controller: bool,
        message: &str,
        reply_to: Value,
    ) {
        if message.is_empty() || message.len() > 500 {
            return;
        }
        let sender = if is_controller {
            "Controller".to_owned()
        } else {
            match self.store.get(session_id).await {
                Some(session) => session
                    .viewer(sender_token)
                    .map_or_else(|| "User".to_owned(), |v| v.username.clone()),
                None => return,
            }
        };
        let now = ts_ms();
        self.rooms.broadcast_json(
            session_id,
            &json!({
                "type": "chat_message",
                "sender": sender,
                "message": message,
                "timestamp": now,
                "messageId": format!("{now}-{}", crate::util::hex_token(4)),
                "replyTo": reply_to,
            }),
        );
    }

    /// Tear down one member's socket and repair the room state.
    pub async fn handle_disconnect(
        &self,
        session_id: Uuid,
        token: &str,
        is_controller: bool,
        username: &str,
    ) {
        if is_controller {
            self.rooms.unregister_controller(session_id);
            tracing::info!(session = %session_id, "controller disconnected from collab room");
            self.rooms
                .broadcast_json(session_id, &json!({ "type": "controller_disconnected" }));
        } else {
            self.rooms.unregister_viewer(session_id, token);
            tracing::info!(session = %session_id, "viewer disconnected from collab room");

            if let Some(session) = self.store.get(session_id).await {
                let disconnected = session.viewer(token).cloned();
                if let Some(viewer) = &disconnected {
                    if let Some(slot) = viewer.slot {
                        self.rooms.broadcast_json(
                            session_id,
                            &json!({
                                "type": "gamepad_change",
                                "message": format!(
                                    "{} disconnected and was unassigned from Gamepad {slot}.",
                                    viewer.username
                                ),
                                "timestamp": ts_ms(),
                            }),
                        );
                    }
                    if session.mk_owner_token.as_deref() == Some(token) {
                        self.rooms.broadcast_json(
                            session_id,
                            &json!({
                                "type": "mk_change",
                                "message": format!(
                                    "{} disconnected. MK control reverted to Controller.",
                                    viewer.username
                                ),
                                "timestamp": ts_ms(),
                            }),
                        );
                    }

                    let update = self
                        .store
                        .update(session_id, |s| {
                            if s.designated_speaker.as_deref() == Some(token) {
                                s.designated_speaker = None;
                            }
                            if s.mk_owner_token.as_deref() == Some(token) {
                                s.mk_owner_token = None;
                            }
                            s.viewers.retain(|v| v.token != token);
                        })
                        .await;
                    match update {
                        Ok(Some(session)) => {
                            tracing::info!(session = %session_id, "removed disconnected viewer");
                            self.broadcast_token_state(&session).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(session = %session_id, error = %e, "failed to remove viewer");
                        }
                    }
                }
            }
        }

        self.rooms.broadcast_json(
            session_id,
            &json!({
                "type": "user_left",
                "username": username,
                "timestamp": ts_ms(),
            }),
        );
        self.broadcast_state(session_id).await;
    }
}
