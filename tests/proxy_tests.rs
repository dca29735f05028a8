//! Reverse proxy tests: token auth, cookie handoff, header injection.

mod common;

use axum::Router;
use axum::extract::Request;
use axum::routing::any;
use serde_json::Value;

use common::{make_session, serve_router, test_broker};

/// Upstream stub that reports what it received.
async fn echo_upstream() -> std::net::SocketAddr {
    async fn echo(request: Request) -> axum::Json<Value> {
        let auth = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        axum::Json(serde_json::json!({
            "path": request.uri().path(),
            "query": request.uri().query().unwrap_or(""),
            "authorization": auth,
            "method": request.method().as_str(),
        }))
    }

    let app = Router::new().fallback(any(echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

#[tokio::test]
async fn missing_and_invalid_tokens_are_rejected() {
    let env = test_broker().await;
    let upstream = echo_upstream().await;
    let session = make_session("alice", upstream, "valid-token");
    let sid = session.session_id;
    env.broker.store.insert(session).await.unwrap();

    let base = serve_router(sealskin::proxy::router(env.broker.clone())).await;
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = http.get(format!("{base}/{sid}/")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let response = http
        .get(format!("{base}/{sid}/?access_token=wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Unknown session, valid-shaped token
    let response = http
        .get(format!(
            "{base}/{}/?access_token=valid-token",
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn first_get_redirects_and_sets_cookie() {
    let env = test_broker().await;
    let upstream = echo_upstream().await;
    let session = make_session("alice", upstream, "valid-token");
    let sid = session.session_id;
    env.broker.store.insert(session).await.unwrap();

    let base = serve_router(sealskin::proxy::router(env.broker.clone())).await;
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = http
        .get(format!("{base}/{sid}/?access_token=valid-token&scale=2"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 307);

    // Location keeps other query params but drops the token
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(location, format!("/{sid}/?scale=2"));

    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cookie.starts_with(&format!(
        "{}=valid-token",
        env.settings.session_cookie_name
    )));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Secure"));
    assert!(cookie.contains("SameSite=Lax"));
}

#[tokio::test]
async fn forwarding_injects_basic_auth_and_strips_token() {
    let env = test_broker().await;
    let upstream = echo_upstream().await;
    let session = make_session("alice", upstream, "valid-token");
    let sid = session.session_id;
    env.broker.store.insert(session).await.unwrap();

    let base = serve_router(sealskin::proxy::router(env.broker.clone())).await;
    let http = reqwest::Client::new();

    // Authenticate via cookie, like a browser after the redirect
    let response = http
        .get(format!("{base}/{sid}/app/index.html?scale=2"))
        .header(
            "cookie",
            format!("{}=valid-token", env.settings.session_cookie_name),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echo: Value = response.json().await.unwrap();

    assert_eq!(echo["path"], format!("/{sid}/app/index.html"));
    assert_eq!(echo["query"], "scale=2");

    // Basic credentials for the container's built-in auth
    use base64::Engine;
    let expected = base64::engine::general_purpose::STANDARD.encode("cu-user:cu-pass");
    assert_eq!(echo["authorization"], format!("Basic {expected}"));
}

#[tokio::test]
async fn non_get_methods_forward_with_query_token() {
    let env = test_broker().await;
    let upstream = echo_upstream().await;
    let session = make_session("alice", upstream, "valid-token");
    let sid = session.session_id;
    env.broker.store.insert(session).await.unwrap();

    let base = serve_router(sealskin::proxy::router(env.broker.clone())).await;
    let http = reqwest::Client::new();

    // A POST with the token in the query is forwarded, not redirected
    let response = http
        .post(format!("{base}/{sid}/submit?access_token=valid-token"))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echo: Value = response.json().await.unwrap();
    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["query"], "");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let env = test_broker().await;
    // A port nothing listens on
    let dead = std::net::SocketAddr::from(([127, 0, 0, 1], 1));
    let session = make_session("alice", dead, "valid-token");
    let sid = session.session_id;
    env.broker.store.insert(session).await.unwrap();

    let base = serve_router(sealskin::proxy::router(env.broker.clone())).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{base}/{sid}/anything?access_token=valid-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn room_page_access_and_invite_redirect() {
    let env = test_broker().await;
    let upstream = echo_upstream().await;
    let mut session = make_session("alice", upstream, "valid-token");
    session.is_collaboration = true;
    session.master_token = Some("master".to_owned());
    session.controller_token = Some("ctl-token".to_owned());
    session.participant_invite_token = Some("invite-p".to_owned());
    session.readonly_invite_token = Some("invite-r".to_owned());
    let sid = session.session_id;
    env.broker.store.insert(session).await.unwrap();

    let base = serve_router(sealskin::proxy::router(env.broker.clone())).await;
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    // No token at all
    let response = http.get(format!("{base}/room/{sid}")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    // The session owner gets the controller page plus both cookies
    let response = http
        .get(format!("{base}/room/{sid}?access_token=valid-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let cookies: Vec<String> = response
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_owned())
        .collect();
    assert!(cookies.iter().any(|c| c.contains("SameSite=None")));
    let page = response.text().await.unwrap();
    assert!(page.contains("\"userRole\":\"controller\""));
    assert!(page.contains("participantJoinUrl"));

    // A participant invite mints a viewer and 303-redirects to its token
    let response = http
        .get(format!("{base}/room/{sid}?token=invite-p"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 303);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(location.starts_with(&format!("/room/{sid}?token=")));
    assert!(!location.contains("invite-p"));

    let viewer_token = location.split("token=").nth(1).unwrap();
    let stored = env.broker.store.get(sid).await.unwrap();
    assert!(stored.viewer(viewer_token).is_some());

    // The minted token now renders the viewer page
    let response = http.get(format!("{base}{location}")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let page = response.text().await.unwrap();
    assert!(page.contains("\"userRole\":\"viewer\""));

    // Garbage tokens stay locked out
    let response = http
        .get(format!("{base}/room/{sid}?token=junk"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}
