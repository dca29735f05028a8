//! Anonymous public-share download endpoints.
//!
//! Open shares stream directly; password-protected shares serve a small
//! password form whose submission 303-redirects to a one-shot, sixty-second
//! download URL.

use axum::Form;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::ApiState;
use crate::core::{Error, Result};
use crate::shares::ShareMetadata;

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    password: String,
}

fn password_page(share_id: Uuid, filename: &str, error: Option<&str>) -> Html<String> {
    let error_html = error.map_or_else(String::new, |e| {
        format!("<p class=\"error\">{e}</p>")
    });
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Protected download</title></head>\n<body>\n\
         <h1>{filename}</h1>\n{error_html}\n\
         <form method=\"post\" action=\"/public/{share_id}\">\n\
         <input type=\"password\" name=\"password\" placeholder=\"Password\" autofocus>\n\
         <button type=\"submit\">Download</button>\n\
         </form>\n</body>\n</html>\n"
    ))
}

async fn stream_blob(state: &ApiState, share_id: Uuid, metadata: &ShareMetadata) -> Result<Response> {
    let blob = state.broker.shares.blob_path(share_id);
    let file = tokio::fs::File::open(&blob)
        .await
        .map_err(|_| Error::not_found("Share not found."))?;
    let stream = ReaderStream::new(file);

    let disposition = format!(
        "attachment; filename=\"{}\"",
        metadata.original_filename.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// `GET /public/{share_id}`: the bytes, or the password page.
pub async fn get_share(
    State(state): State<ApiState>,
    Path(share_id): Path<Uuid>,
) -> Result<Response> {
    let metadata = state
        .broker
        .shares
        .get(share_id)
        .await
        .ok_or_else(|| Error::not_found("Share not found."))?;

    if metadata.password_hash.is_some() {
        return Ok(password_page(share_id, &metadata.original_filename, None).into_response());
    }
    stream_blob(&state, share_id, &metadata).await
}

/// `POST /public/{share_id}`: check the password, mint a one-shot URL.
pub async fn submit_share_password(
    State(state): State<ApiState>,
    Path(share_id): Path<Uuid>,
    Form(form): Form<PasswordForm>,
) -> Result<Response> {
    match state
        .broker
        .shares
        .verify_password(share_id, &form.password)
        .await
    {
        Ok(token) => Ok(Redirect::to(&format!("/public/download/{token}")).into_response()),
        Err(Error::Unauthorized(_)) => {
            let metadata = state
                .broker
                .shares
                .get(share_id)
                .await
                .ok_or_else(|| Error::not_found("Share not found."))?;
            Ok((
                StatusCode::UNAUTHORIZED,
                password_page(share_id, &metadata.original_filename, Some("Incorrect password.")),
            )
                .into_response())
        }
        Err(e) => Err(e),
    }
}

/// `GET /public/download/{token}`: consume a one-shot grant.
pub async fn download_share(
    State(state): State<ApiState>,
    Path(token): Path<String>,
) -> Result<Response> {
    let (share_id, metadata) = state.broker.shares.consume_download_token(&token).await?;
    stream_blob(&state, share_id, &metadata).await
}
