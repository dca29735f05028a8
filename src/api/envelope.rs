//! Encrypted request/response envelope for the control-plane API.
//!
//! After the handshake, request bodies arrive as `{iv, ciphertext}` under
//! the crypto session named by the `X-Session-ID` header, and JSON responses
//! are sealed under the same session on the way out.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::ApiState;
use crate::core::{Error, Result};
use crate::crypto::EncryptedPayload;

/// Name of the crypto-session header.
pub const SESSION_ID_HEADER: &str = "X-Session-ID";

/// Read and validate the crypto-session id from the request headers.
///
/// # Errors
/// `BadRequest` when the header is missing, malformed or unknown.
pub fn crypto_session_id(state: &ApiState, headers: &HeaderMap) -> Result<Uuid> {
    let raw = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::bad_request("Invalid or missing session ID"))?;
    let id = Uuid::parse_str(raw).map_err(|_| Error::bad_request("Invalid or missing session ID"))?;
    if !state.broker.crypto.has_session(id) {
        return Err(Error::bad_request("Invalid or missing session ID"));
    }
    Ok(id)
}

/// Decrypt an enveloped request body into a typed value.
///
/// # Errors
/// `BadRequest` when the session is unknown, the envelope is malformed, or
/// the decrypted bytes are not valid JSON for `T`.
pub fn open_request<T: DeserializeOwned>(
    state: &ApiState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T> {
    let session_id = crypto_session_id(state, headers)?;
    let payload: EncryptedPayload = serde_json::from_slice(body)
        .map_err(|_| Error::bad_request("Failed to decrypt request"))?;
    let plaintext = state.broker.crypto.open(session_id, &payload)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| Error::bad_request(format!("Invalid request body: {e}")))
}

/// Middleware sealing JSON responses for callers with a valid crypto session.
///
/// Responses that are not JSON, or requests without a valid `X-Session-ID`,
/// pass through untouched.
pub async fn encrypt_response(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let session_id = crypto_session_id(&state, request.headers()).ok();
    let response = next.run(request).await;

    let Some(session_id) = session_id else {
        return response;
    };
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!(error = %e, "failed to buffer response for encryption");
            return Error::Internal(anyhow::anyhow!("response buffering failed")).into_response();
        }
    };
    if bytes.is_empty() {
        return Response::from_parts(parts, Body::empty());
    }

    match state.broker.crypto.seal(session_id, &bytes) {
        Ok(payload) => {
            let body = serde_json::to_vec(&payload).unwrap_or_default();
            let mut response = Response::from_parts(parts, Body::from(body));
            response.headers_mut().remove(header::CONTENT_LENGTH);
            response
        }
        Err(e) => e.into_response(),
    }
}
