//! HTTP mapping for the broker error sum.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::core::Error;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            Self::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred.".to_owned(),
                )
            }
        };
        (status, Json(json!({ "detail": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_per_kind() {
        assert_eq!(
            Error::bad_request("x").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::unauthorized("x").into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::forbidden("x").into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::not_found("x").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::conflict("x").into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::bad_gateway("x").into_response().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::GatewayTimeout("x".into()).into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::Internal(anyhow::anyhow!("boom"))
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
