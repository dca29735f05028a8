//! Control-plane HTTP API (the "API port" listener).

pub mod envelope;
pub mod error;
pub mod handlers;
pub mod public;

use axum::Router;
use axum::http::HeaderMap;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;
use crate::core::Result;
use crate::identity::AuthenticatedUser;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<Broker>,
}

impl ApiState {
    /// Authenticate the bearer token of a request.
    ///
    /// # Errors
    /// As [`crate::identity::Identity::verify_bearer`].
    pub async fn user(&self, headers: &HeaderMap) -> Result<AuthenticatedUser> {
        let auth = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        self.broker.identity.verify_bearer(auth).await
    }

    /// Authenticate and require admin.
    ///
    /// # Errors
    /// As [`crate::identity::Identity::verify_admin`].
    pub async fn admin(&self, headers: &HeaderMap) -> Result<AuthenticatedUser> {
        let auth = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        self.broker.identity.verify_admin(auth).await
    }
}

/// Build the API router.
///
/// Handshake and public-share routes are plaintext; everything else runs
/// under the response-encryption layer and expects enveloped bodies.
#[must_use]
pub fn router(broker: Arc<Broker>) -> Router {
    let state = ApiState { broker };

    let encrypted = Router::new()
        .route("/api/applications", post(handlers::get_applications))
        .route("/api/launch/simple", post(handlers::launch_simple))
        .route("/api/launch/url", post(handlers::launch_url))
        .route("/api/launch/file", post(handlers::launch_file))
        .route("/api/sessions", get(handlers::get_my_sessions))
        .route("/api/sessions/{session_id}", delete(handlers::stop_my_session))
        .route(
            "/api/sessions/{session_id}/send_file",
            post(handlers::send_file_to_session),
        )
        .route(
            "/api/homedirs",
            get(handlers::list_my_home_dirs).post(handlers::create_my_home_dir),
        )
        .route(
            "/api/homedirs/{home_name}",
            delete(handlers::delete_my_home_dir),
        )
        .route("/api/upload/initiate", post(handlers::upload_initiate))
        .route("/api/upload/chunk", post(handlers::upload_chunk))
        .route("/api/upload/to_storage", post(handlers::upload_to_storage))
        .route("/api/files/list", post(handlers::list_files))
        .route("/api/files/folder", post(handlers::create_folder))
        .route("/api/files/delete", post(handlers::delete_files))
        .route(
            "/api/shares",
            get(handlers::list_my_shares).post(handlers::create_share),
        )
        .route("/api/shares/{share_id}", delete(handlers::delete_share))
        .route("/api/admin/status", post(handlers::admin_status))
        .route("/api/admin/data", post(handlers::get_management_data))
        .route(
            "/api/admin/apps/stores",
            get(handlers::get_app_stores).post(handlers::add_app_store),
        )
        .route(
            "/api/admin/apps/stores/{store_name}",
            delete(handlers::delete_app_store),
        )
        .route("/api/admin/apps/available", get(handlers::get_available_apps))
        .route(
            "/api/admin/apps/installed",
            get(handlers::list_installed_apps).post(handlers::install_app),
        )
        .route(
            "/api/admin/apps/installed/{app_id}",
            put(handlers::update_installed_app).delete(handlers::delete_installed_app),
        )
        .route(
            "/api/admin/apps/installed/{app_id}/check_update",
            post(handlers::check_app_update),
        )
        .route(
            "/api/admin/apps/installed/{app_id}/pull_latest",
            post(handlers::pull_latest_app_image),
        )
        .route(
            "/api/admin/apps/templates",
            get(handlers::get_app_templates).post(handlers::save_app_template),
        )
        .route(
            "/api/admin/apps/templates/{template_name}",
            delete(handlers::delete_app_template),
        )
        .route("/api/admin/sessions", get(handlers::get_all_sessions))
        .route(
            "/api/admin/sessions/{session_id}",
            delete(handlers::stop_any_session),
        )
        .route("/api/admin/admins", post(handlers::create_admin))
        .route("/api/admin/admins/{username}", delete(handlers::delete_admin))
        .route("/api/admin/users", post(handlers::create_user))
        .route(
            "/api/admin/users/{username}",
            put(handlers::update_user).delete(handlers::delete_user),
        )
        .route(
            "/api/admin/users/{username}/homedirs",
            get(handlers::list_user_home_dirs).post(handlers::create_user_home_dir),
        )
        .route(
            "/api/admin/users/{username}/homedirs/{home_name}",
            delete(handlers::delete_user_home_dir),
        )
        .route(
            "/api/admin/admins/{username}/homedirs",
            get(handlers::list_admin_home_dirs).post(handlers::create_admin_home_dir),
        )
        .route(
            "/api/admin/admins/{username}/homedirs/{home_name}",
            delete(handlers::delete_admin_home_dir),
        )
        .route("/api/admin/groups", post(handlers::create_group))
        .route(
            "/api/admin/groups/{group_name}",
            put(handlers::update_group).delete(handlers::delete_group),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            envelope::encrypt_response,
        ));

    Router::new()
        .route("/api/handshake/initiate", post(handlers::handshake_initiate))
        .route("/api/handshake/exchange", post(handlers::handshake_exchange))
        .route("/public/{share_id}", get(public::get_share).post(public::submit_share_password))
        .route("/public/download/{token}", get(public::download_share))
        .merge(encrypted)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
