//! Collaboration room page and room WebSocket.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::ProxyState;
use crate::collab::{CollabService, Connection, RoomAccess};
use crate::core::{Session, ViewerPermission};
use crate::util::hex_token;

#[derive(Debug, Deserialize)]
pub struct RoomQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

fn replace_token_query(session_id: Uuid, token: &str) -> String {
    format!("/room/{session_id}?token={token}")
}

fn room_shell(client_data: &serde_json::Value, iframe_src: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Collaboration room</title></head>\n<body>\n\
         <script>window.COLLAB_DATA = {client_data};</script>\n\
         <iframe id=\"session\" src=\"{iframe_src}\" allow=\"autoplay; clipboard-read; clipboard-write; gamepad\"></iframe>\n\
         </body>\n</html>\n"
    )
}

/// `GET /room/{session_id}?token=...`: resolve the caller's role, minting a
/// viewer for invite tokens, and serve the room shell.
pub async fn room_page(
    State(state): State<ProxyState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<RoomQuery>,
    jar: CookieJar,
) -> Response {
    let Some(session) = state.broker.store.get(session_id).await else {
        return (StatusCode::NOT_FOUND, "Collaboration room not found.").into_response();
    };
    if !session.is_collaboration {
        return (StatusCode::NOT_FOUND, "Collaboration room not found.").into_response();
    }

    let cookie_name = &state.broker.settings.session_cookie_name;
    let main_access_token = query
        .access_token
        .clone()
        .or_else(|| jar.get(cookie_name).map(|c| c.value().to_owned()));

    let access = CollabService::resolve_access(
        &session,
        main_access_token.as_deref(),
        query.token.as_deref(),
    );

    let (role, user_token, permission) = match access {
        RoomAccess::Denied => {
            return (
                StatusCode::UNAUTHORIZED,
                "Invalid or missing authentication token.",
            )
                .into_response();
        }
        RoomAccess::NewViewer { permission } => {
            match state.broker.collab.admit_viewer(session_id, permission).await {
                Ok(token) => {
                    return Response::builder()
                        .status(StatusCode::SEE_OTHER)
                        .header(header::LOCATION, replace_token_query(session_id, &token))
                        .body(Body::empty())
                        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
                }
                Err(e) => {
                    tracing::error!(session = %session_id, error = %e, "failed to register new viewer");
                    return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to register new viewer.")
                        .into_response();
                }
            }
        }
        RoomAccess::Controller => {
            let token = session.controller_token.clone().unwrap_or_default();
            ("controller", token, "participant".to_owned())
        }
        RoomAccess::Viewer { token, permission } => {
            ("viewer", token, permission.to_string())
        }
    };

    let mut client_data = json!({
        "sessionId": session_id,
        "userRole": role,
        "userToken": user_token,
        "userPermission": permission,
    });
    if role == "controller" {
        if let Some(invite) = &session.participant_invite_token {
            client_data["participantJoinUrl"] = json!(replace_token_query(session_id, invite));
        }
        if let Some(invite) = &session.readonly_invite_token {
            client_data["readonlyJoinUrl"] = json!(replace_token_query(session_id, invite));
        }
    } else if permission == "participant" {
        if let Some(invite) = &session.readonly_invite_token {
            client_data["readonlyJoinUrl"] = json!(replace_token_query(session_id, invite));
        }
    }

    let iframe_src = format!("/{session_id}/?token={user_token}");
    let html = room_shell(&client_data, &iframe_src);

    let mut response = Html(html).into_response();
    // The iframe authenticates via cookies scoped to the session prefix.
    if let Some(token) = &query.access_token {
        tracing::info!(session = %session_id, "collab room: setting session cookie");
        if let Ok(value) = header::HeaderValue::from_str(&format!(
            "{cookie_name}_{session_id}={token}; HttpOnly; Secure; SameSite=Lax; Path=/{session_id}"
        )) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    if let Ok(value) = header::HeaderValue::from_str(&format!(
        "collab_token_{session_id}={user_token}; HttpOnly; Secure; SameSite=None; Path=/{session_id}"
    )) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

/// `GET /ws/room/{session_id}?token=...`: the room control socket.
pub async fn room_socket(
    ws: WebSocketUpgrade,
    State(state): State<ProxyState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<RoomQuery>,
) -> Response {
    let Some(session) = state.broker.store.get(session_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !session.is_collaboration {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(token) = query.token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some((is_controller, permission)) = CollabService::authenticate_socket(&session, &token)
    else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let collab = state.broker.collab.clone();
    ws.on_upgrade(move |socket| async move {
        run_room_socket(socket, collab, session, token, is_controller, permission).await;
    })
}

async fn run_room_socket(
    socket: WebSocket,
    collab: std::sync::Arc<CollabService>,
    session: Session,
    token: String,
    is_controller: bool,
    permission: Option<ViewerPermission>,
) {
    let session_id = session.session_id;
    let username = if is_controller {
        "Controller".to_owned()
    } else {
        session
            .viewer(&token)
            .map_or_else(|| format!("User-{}", &token[..token.len().min(6)]), |v| {
                v.username.clone()
            })
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = Connection {
        token: token.clone(),
        public_id: hex_token(4),
        sender: tx,
        last_username_change: None,
    };
    if is_controller {
        collab.rooms().register_controller(session_id, connection);
    } else {
        collab.rooms().register_viewer(session_id, connection);
    }

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    collab.handle_join(session_id, &username).await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(data) => {
                        collab
                            .handle_text(session_id, &token, is_controller, &data)
                            .await;
                    }
                    Err(e) => {
                        tracing::debug!(session = %session_id, error = %e, "invalid JSON on room socket");
                    }
                }
            }
            Ok(Message::Binary(bytes)) => {
                collab
                    .handle_binary(session_id, &token, permission, &bytes)
                    .await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    tracing::info!(session = %session_id, username = %username, "room socket disconnected");
    collab
        .handle_disconnect(session_id, &token, is_controller, &username)
        .await;
    send_task.abort();
}
