//! Per-session reverse proxy (the "session port" listener).
//!
//! Routes `/{session_id}/...` to the session's container, authenticated by
//! the session access token. The first authenticated GET redirects to the
//! same URL without the token and sets an HttpOnly cookie; WebSocket
//! upgrades are bridged frame-for-frame. Collaboration room pages and
//! sockets live on this listener too so the embedded iframe stays
//! same-origin.

pub mod room;

use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{FromRequestParts, Path, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum_extra::extract::cookie::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use uuid::Uuid;

use crate::broker::Broker;
use crate::core::Session;
use crate::util::constant_time_eq;

/// Shared state for proxy handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub broker: Arc<Broker>,
    pub http: reqwest::Client,
}

/// Build the session-port router.
#[must_use]
pub fn router(broker: Arc<Broker>) -> Router {
    let state = ProxyState {
        broker,
        http: reqwest::Client::new(),
    };
    Router::new()
        .route("/room/{session_id}", get(room::room_page))
        .route("/ws/room/{session_id}", get(room::room_socket))
        .route("/{session_id}/", any(proxy_root))
        .route("/{session_id}/{*path}", any(proxy_path))
        .with_state(state)
}

/// One `key=value` query pair; values pass through verbatim.
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// The query string with one key removed.
fn query_without(query: &str, key: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some(key))
        .collect::<Vec<_>>()
        .join("&")
}

/// Resolve the bearer token of a proxy request: query parameter first,
/// session cookie second.
fn request_token(query: &str, jar: &CookieJar, cookie_name: &str) -> Option<String> {
    query_param(query, "access_token")
        .map(str::to_owned)
        .or_else(|| jar.get(cookie_name).map(|c| c.value().to_owned()))
}

async fn authenticate(
    state: &ProxyState,
    session_id: Uuid,
    query: &str,
    jar: &CookieJar,
) -> Result<Session, Response> {
    let cookie_name = &state.broker.settings.session_cookie_name;
    let Some(token) = request_token(query, jar, cookie_name) else {
        return Err(
            (StatusCode::UNAUTHORIZED, "Authentication token missing.").into_response(),
        );
    };
    let session = state.broker.store.get(session_id).await;
    match session {
        Some(session) if constant_time_eq(&token, &session.access_token) => Ok(session),
        _ => Err((
            StatusCode::FORBIDDEN,
            "Forbidden: Invalid session or token.",
        )
            .into_response()),
    }
}

fn basic_auth_value(session: &Session) -> HeaderValue {
    let credentials = B64.encode(format!("{}:{}", session.custom_user, session.password));
    HeaderValue::from_str(&format!("Basic {credentials}"))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"))
}

async fn proxy_root(
    State(state): State<ProxyState>,
    Path(session_id): Path<Uuid>,
    jar: CookieJar,
    request: Request,
) -> Response {
    proxy(state, session_id, String::new(), jar, request).await
}

async fn proxy_path(
    State(state): State<ProxyState>,
    Path((session_id, path)): Path<(Uuid, String)>,
    jar: CookieJar,
    request: Request,
) -> Response {
    proxy(state, session_id, path, jar, request).await
}

async fn proxy(
    state: ProxyState,
    session_id: Uuid,
    path: String,
    jar: CookieJar,
    request: Request,
) -> Response {
    let query = request.uri().query().unwrap_or("").to_owned();
    let session = match authenticate(&state, session_id, &query, &jar).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let forwarded_query = query_without(&query, "access_token");
    let target_path = format!("/{session_id}/{path}");

    let (mut parts, body) = request.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
        .await
        .ok();
    let request = Request::from_parts(parts, body);

    if let Some(ws) = ws {
        let upstream = format!(
            "ws://{}:{}{}{}",
            session.ip,
            session.port,
            target_path,
            if forwarded_query.is_empty() {
                String::new()
            } else {
                format!("?{forwarded_query}")
            }
        );
        let auth = basic_auth_value(&session);
        return ws.on_upgrade(move |socket| async move {
            forward_websocket(socket, session_id, upstream, auth).await;
        });
    }

    // One-shot cookie handoff: an authenticated GET carrying the token in
    // the query redirects to the clean URL and moves the token to a cookie.
    let token_in_query = query_param(&query, "access_token").map(str::to_owned);
    if let Some(token) = token_in_query {
        if request.method() == axum::http::Method::GET {
            let location = if forwarded_query.is_empty() {
                target_path.clone()
            } else {
                format!("{target_path}?{forwarded_query}")
            };
            tracing::info!(session = %session_id, "initial auth: setting cookie and redirecting");
            let cookie = format!(
                "{}={token}; HttpOnly; Secure; SameSite=Lax; Path=/",
                state.broker.settings.session_cookie_name
            );
            return Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header(header::LOCATION, location)
                .header(header::SET_COOKIE, cookie)
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    }

    forward_http(state, session, target_path, forwarded_query, request).await
}

async fn forward_http(
    state: ProxyState,
    session: Session,
    target_path: String,
    query: String,
    request: Request,
) -> Response {
    let url = format!(
        "http://{}:{}{}{}",
        session.ip,
        session.port,
        target_path,
        if query.is_empty() {
            String::new()
        } else {
            format!("?{query}")
        }
    );

    let method = request.method().clone();
    let mut headers = request.headers().clone();
    headers.remove(header::HOST);
    // The body is re-streamed, so the original framing headers do not apply.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::AUTHORIZATION);
    headers.insert(header::AUTHORIZATION, basic_auth_value(&session));

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    let body_stream = request.into_body().into_data_stream();
    let upstream = state
        .http
        .request(reqwest_method, &url)
        .headers(convert_headers(&headers))
        .body(reqwest::Body::wrap_stream(body_stream))
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::error!(session = %session.session_id, error = %e, "cannot connect to backend");
            return (
                StatusCode::BAD_GATEWAY,
                "Bad Gateway: Cannot connect to application container.",
            )
                .into_response();
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    if let Some(response_headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            // hyper re-frames the body; hop-by-hop framing headers must not
            // be copied through.
            if name == &reqwest::header::TRANSFER_ENCODING || name == &reqwest::header::CONNECTION
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.insert(name, value);
            }
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn convert_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut converted = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            converted.insert(name, value);
        }
    }
    converted
}

async fn forward_websocket(
    client: WebSocket,
    session_id: Uuid,
    upstream_url: String,
    auth: HeaderValue,
) {
    let mut request = match upstream_url.clone().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(session = %session_id, error = %e, "invalid upstream websocket URL");
            return;
        }
    };
    request.headers_mut().insert(header::AUTHORIZATION, auth);

    let (upstream, _) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::warn!(session = %session_id, error = %e, "websocket proxy connect failed");
            return;
        }
    };
    tracing::info!(session = %session_id, url = %upstream_url, "websocket proxy connection opened");

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let forwarded = match message {
                WsMessage::Text(text) => UpstreamMessage::Text(text.to_string().into()),
                WsMessage::Binary(bytes) => UpstreamMessage::Binary(bytes.to_vec().into()),
                WsMessage::Ping(bytes) => UpstreamMessage::Ping(bytes.to_vec().into()),
                WsMessage::Pong(bytes) => UpstreamMessage::Pong(bytes.to_vec().into()),
                WsMessage::Close(_) => break,
            };
            if upstream_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let forwarded = match message {
                UpstreamMessage::Text(text) => WsMessage::Text(text.to_string().into()),
                UpstreamMessage::Binary(bytes) => WsMessage::Binary(bytes.to_vec().into()),
                UpstreamMessage::Ping(bytes) => WsMessage::Ping(bytes.to_vec().into()),
                UpstreamMessage::Pong(bytes) => WsMessage::Pong(bytes.to_vec().into()),
                UpstreamMessage::Close(_) => break,
                UpstreamMessage::Frame(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    // Either direction closing tears both down.
    tokio::select! {
        () = client_to_upstream => {}
        () = upstream_to_client => {}
    }
    tracing::info!(session = %session_id, "websocket proxy connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_helpers() {
        let query = "access_token=abc&scale=2&mode=fit";
        assert_eq!(query_param(query, "access_token"), Some("abc"));
        assert_eq!(query_param(query, "scale"), Some("2"));
        assert_eq!(query_param(query, "missing"), None);

        assert_eq!(query_without(query, "access_token"), "scale=2&mode=fit");
        assert_eq!(query_without("access_token=abc", "access_token"), "");
        assert_eq!(query_without("", "access_token"), "");
    }
}
