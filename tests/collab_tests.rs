//! Collaboration room semantics over a recording control plane.

mod common;

use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use common::{create_user, fast_readiness, install_stub_app, test_broker};
use sealskin::collab::{CollabService, Connection, RoomAccess};
use sealskin::core::{Session, ViewerPermission};
use sealskin::directory::UserSettings;
use sealskin::launch::{LaunchEngine, LaunchRequest};

struct RoomFixture {
    env: common::TestBroker,
    collab: Arc<CollabService>,
    session_id: Uuid,
    controller_token: String,
}

/// Launch a room-mode session through the engine so the store holds a real
/// collaboration record.
async fn room_fixture() -> RoomFixture {
    let env = test_broker().await;
    install_stub_app(&env, "app-1", true).await;
    create_user(&env.broker, "alice", UserSettings::default()).await;

    let engine = LaunchEngine::new(
        env.settings.clone(),
        Arc::clone(&env.broker.catalog),
        Arc::clone(&env.broker.autostart),
        Arc::clone(&env.broker.storage),
        Arc::clone(&env.broker.runtime),
        Arc::clone(&env.broker.translator),
        Arc::clone(&env.broker.store),
        Vec::new(),
    )
    .with_readiness(fast_readiness());

    let response = engine
        .launch(
            "alice",
            &UserSettings::default(),
            LaunchRequest {
                application_id: "app-1".to_owned(),
                room_mode: true,
                ..LaunchRequest::default()
            },
        )
        .await
        .unwrap();

    let session = env.broker.store.get(response.session_id).await.unwrap();
    let controller_token = session.controller_token.clone().unwrap();
    let collab = Arc::clone(&env.broker.collab);
    RoomFixture {
        env,
        collab,
        session_id: response.session_id,
        controller_token,
    }
}

fn attach(
    collab: &CollabService,
    session_id: Uuid,
    token: &str,
    is_controller: bool,
) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Connection {
        token: token.to_owned(),
        public_id: sealskin::util::hex_token(4),
        sender: tx,
        last_username_change: None,
    };
    if is_controller {
        collab.rooms().register_controller(session_id, connection);
    } else {
        collab.rooms().register_viewer(session_id, connection);
    }
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Text(text) = message {
            messages.push(serde_json::from_str(&text).unwrap());
        }
    }
    messages
}

fn messages_of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages
        .iter()
        .filter(|m| m["type"] == kind)
        .collect()
}

async fn session(fixture: &RoomFixture) -> Session {
    fixture
        .env
        .broker
        .store
        .get(fixture.session_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn access_resolution_covers_every_token_kind() {
    let fixture = room_fixture().await;
    let session = session(&fixture).await;

    assert_eq!(
        CollabService::resolve_access(&session, Some(&session.access_token), None),
        RoomAccess::Controller
    );
    assert_eq!(
        CollabService::resolve_access(&session, None, Some(&fixture.controller_token)),
        RoomAccess::Controller
    );
    assert_eq!(
        CollabService::resolve_access(
            &session,
            None,
            session.participant_invite_token.as_deref()
        ),
        RoomAccess::NewViewer {
            permission: ViewerPermission::Participant
        }
    );
    assert_eq!(
        CollabService::resolve_access(&session, None, session.readonly_invite_token.as_deref()),
        RoomAccess::NewViewer {
            permission: ViewerPermission::ReadOnly
        }
    );
    assert_eq!(
        CollabService::resolve_access(&session, None, Some("bogus")),
        RoomAccess::Denied
    );
    assert_eq!(
        CollabService::resolve_access(&session, None, None),
        RoomAccess::Denied
    );
}

#[tokio::test]
async fn admitted_viewer_is_persisted_and_pushed_downstream() {
    let fixture = room_fixture().await;

    let token = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();

    let session = session(&fixture).await;
    let viewer = session.viewer(&token).unwrap();
    assert_eq!(viewer.permission, ViewerPermission::Participant);
    assert!(viewer.username.starts_with("User-"));
    assert!(viewer.slot.is_none());

    // The token map went to the session's container IP and contains both
    // the controller and the new viewer
    let (ip, tokens) = fixture.env.control_plane.last_push().await.unwrap();
    assert_eq!(ip, session.ip);
    assert_eq!(tokens[&fixture.controller_token]["role"], "controller");
    assert_eq!(tokens[&fixture.controller_token]["mk_control"], true);
    assert_eq!(tokens[&token]["role"], "viewer");
    assert_eq!(tokens[&token]["mk_control"], false);

    // Resolving the viewer token now yields their stored role
    assert_eq!(
        CollabService::resolve_access(&session, None, Some(&token)),
        RoomAccess::Viewer {
            token: token.clone(),
            permission: ViewerPermission::Participant
        }
    );
}

#[tokio::test]
async fn slot_assignment_preempts_previous_holder() {
    let fixture = room_fixture().await;
    let v1 = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();
    let v2 = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();

    let mut controller_rx = attach(
        &fixture.collab,
        fixture.session_id,
        &fixture.controller_token,
        true,
    );
    let _v1_rx = attach(&fixture.collab, fixture.session_id, &v1, false);
    let _v2_rx = attach(&fixture.collab, fixture.session_id, &v2, false);

    let v1_name = session(&fixture).await.viewer(&v1).unwrap().username.clone();
    let v2_name = session(&fixture).await.viewer(&v2).unwrap().username.clone();

    // Controller gives slot 1 to V1, then to V2
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &fixture.controller_token,
            true,
            &json!({ "action": "assign_slot", "viewer_token": v1, "slot": 1 }),
        )
        .await;
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &fixture.controller_token,
            true,
            &json!({ "action": "assign_slot", "viewer_token": v2, "slot": 1 }),
        )
        .await;

    let messages = drain(&mut controller_rx);
    let changes = messages_of_type(&messages, "gamepad_change");
    let texts: Vec<String> = changes
        .iter()
        .map(|m| m["message"].as_str().unwrap().to_owned())
        .collect();
    assert!(texts.contains(&format!("Gamepad 1 was assigned to {v1_name}.")));
    assert!(texts.contains(&format!("{v1_name} was unassigned from Gamepad 1.")));
    assert!(texts.contains(&format!("Gamepad 1 was assigned to {v2_name}.")));

    // At most one holder: V1 lost the slot, V2 holds it
    let session = session(&fixture).await;
    assert_eq!(session.viewer(&v1).unwrap().slot, None);
    assert_eq!(session.viewer(&v2).unwrap().slot, Some(1));

    // Downstream saw the final ownership
    let (_, tokens) = fixture.env.control_plane.last_push().await.unwrap();
    assert_eq!(tokens[&v1]["slot"], Value::Null);
    assert_eq!(tokens[&v2]["slot"], 1);

    // State updates were broadcast after each mutation
    assert!(!messages_of_type(&messages, "state_update").is_empty());
}

#[tokio::test]
async fn mk_ownership_transfers_and_reverts() {
    let fixture = room_fixture().await;
    let v1 = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();
    let mut controller_rx = attach(
        &fixture.collab,
        fixture.session_id,
        &fixture.controller_token,
        true,
    );
    let _v1_rx = attach(&fixture.collab, fixture.session_id, &v1, false);

    // Give MK to the viewer
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &fixture.controller_token,
            true,
            &json!({ "action": "assign_mk", "token": v1 }),
        )
        .await;
    assert_eq!(session(&fixture).await.mk_owner_token.as_deref(), Some(v1.as_str()));
    let (_, tokens) = fixture.env.control_plane.last_push().await.unwrap();
    assert_eq!(tokens[&v1]["mk_control"], true);
    assert_eq!(tokens[&fixture.controller_token]["mk_control"], false);

    // Assigning back to the controller stores the implicit default
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &fixture.controller_token,
            true,
            &json!({ "action": "assign_mk", "token": fixture.controller_token }),
        )
        .await;
    assert!(session(&fixture).await.mk_owner_token.is_none());
    let (_, tokens) = fixture.env.control_plane.last_push().await.unwrap();
    assert_eq!(tokens[&fixture.controller_token]["mk_control"], true);

    let messages = drain(&mut controller_rx);
    assert_eq!(messages_of_type(&messages, "mk_change").len(), 2);
}

#[tokio::test]
async fn designated_speaker_filters_audio_frames() {
    let fixture = room_fixture().await;
    let speaker = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();
    let other = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();

    let mut controller_rx = attach(
        &fixture.collab,
        fixture.session_id,
        &fixture.controller_token,
        true,
    );
    let _speaker_rx = attach(&fixture.collab, fixture.session_id, &speaker, false);
    let _other_rx = attach(&fixture.collab, fixture.session_id, &other, false);

    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &fixture.controller_token,
            true,
            &json!({ "action": "set_designated_speaker", "token": speaker }),
        )
        .await;
    while controller_rx.try_recv().is_ok() {}

    let audio = Bytes::from_static(b"\x02audio-frame");
    // Audio from the non-designated sender is dropped
    fixture
        .collab
        .handle_binary(fixture.session_id, &other, Some(ViewerPermission::Participant), &audio)
        .await;
    assert!(controller_rx.try_recv().is_err());

    // Audio from the designated speaker is relayed
    fixture
        .collab
        .handle_binary(
            fixture.session_id,
            &speaker,
            Some(ViewerPermission::Participant),
            &audio,
        )
        .await;
    assert!(matches!(controller_rx.try_recv(), Ok(Message::Binary(_))));

    // Non-audio frames from anyone still flow
    let video = Bytes::from_static(b"\x01video-frame");
    fixture
        .collab
        .handle_binary(fixture.session_id, &other, Some(ViewerPermission::Participant), &video)
        .await;
    assert!(matches!(controller_rx.try_recv(), Ok(Message::Binary(_))));
}

#[tokio::test]
async fn binary_guards_reject_readonly_and_oversized() {
    let fixture = room_fixture().await;
    let readonly = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::ReadOnly)
        .await
        .unwrap();
    let mut controller_rx = attach(
        &fixture.collab,
        fixture.session_id,
        &fixture.controller_token,
        true,
    );
    let _readonly_rx = attach(&fixture.collab, fixture.session_id, &readonly, false);

    fixture
        .collab
        .handle_binary(
            fixture.session_id,
            &readonly,
            Some(ViewerPermission::ReadOnly),
            &Bytes::from_static(b"\x01input"),
        )
        .await;
    assert!(controller_rx.try_recv().is_err());

    let oversized = Bytes::from(vec![1u8; 1024 * 1024]);
    fixture
        .collab
        .handle_binary(
            fixture.session_id,
            &fixture.controller_token,
            None,
            &oversized,
        )
        .await;
    assert!(controller_rx.try_recv().is_err());
}

#[tokio::test]
async fn chat_messages_are_bounded_and_broadcast() {
    let fixture = room_fixture().await;
    let v1 = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();
    let mut controller_rx = attach(
        &fixture.collab,
        fixture.session_id,
        &fixture.controller_token,
        true,
    );
    let _v1_rx = attach(&fixture.collab, fixture.session_id, &v1, false);

    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &v1,
            false,
            &json!({ "action": "send_chat_message", "message": "hello there" }),
        )
        .await;
    let messages = drain(&mut controller_rx);
    let chats = messages_of_type(&messages, "chat_message");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["message"], "hello there");
    assert!(chats[0]["messageId"].as_str().unwrap().contains('-'));

    // Empty and oversized messages are dropped
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &v1,
            false,
            &json!({ "action": "send_chat_message", "message": "" }),
        )
        .await;
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &v1,
            false,
            &json!({ "action": "send_chat_message", "message": "x".repeat(501) }),
        )
        .await;
    assert!(messages_of_type(&drain(&mut controller_rx), "chat_message").is_empty());
}

#[tokio::test]
async fn viewer_disconnect_releases_slot_mk_and_speaker() {
    let fixture = room_fixture().await;
    let v1 = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();
    let mut controller_rx = attach(
        &fixture.collab,
        fixture.session_id,
        &fixture.controller_token,
        true,
    );
    let _v1_rx = attach(&fixture.collab, fixture.session_id, &v1, false);
    let v1_name = session(&fixture).await.viewer(&v1).unwrap().username.clone();

    // V1 holds a slot, MK and the speaker role
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &fixture.controller_token,
            true,
            &json!({ "action": "assign_slot", "viewer_token": v1, "slot": 2 }),
        )
        .await;
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &fixture.controller_token,
            true,
            &json!({ "action": "assign_mk", "token": v1 }),
        )
        .await;
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &fixture.controller_token,
            true,
            &json!({ "action": "set_designated_speaker", "token": v1 }),
        )
        .await;
    while controller_rx.try_recv().is_ok() {}

    fixture
        .collab
        .handle_disconnect(fixture.session_id, &v1, false, &v1_name)
        .await;

    let session = session(&fixture).await;
    assert!(session.viewers.is_empty());
    assert!(session.mk_owner_token.is_none());
    assert!(session.designated_speaker.is_none());

    let messages = drain(&mut controller_rx);
    let gamepad: Vec<_> = messages_of_type(&messages, "gamepad_change");
    assert_eq!(gamepad.len(), 1);
    assert_eq!(
        gamepad[0]["message"],
        format!("{v1_name} disconnected and was unassigned from Gamepad 2.")
    );
    assert_eq!(messages_of_type(&messages, "mk_change").len(), 1);
    assert_eq!(messages_of_type(&messages, "user_left").len(), 1);

    // Downstream no longer lists the viewer
    let (_, tokens) = fixture.env.control_plane.last_push().await.unwrap();
    assert!(tokens.get(&v1).is_none());
    assert_eq!(tokens[&fixture.controller_token]["mk_control"], true);
}

#[tokio::test]
async fn username_changes_are_validated_and_rate_limited() {
    let fixture = room_fixture().await;
    let v1 = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();
    let mut controller_rx = attach(
        &fixture.collab,
        fixture.session_id,
        &fixture.controller_token,
        true,
    );
    let _v1_rx = attach(&fixture.collab, fixture.session_id, &v1, false);

    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &v1,
            false,
            &json!({ "action": "set_username", "username": "Viewer One" }),
        )
        .await;
    assert_eq!(
        session(&fixture).await.viewer(&v1).unwrap().username,
        "Viewer One"
    );
    let messages = drain(&mut controller_rx);
    assert_eq!(messages_of_type(&messages, "username_changed").len(), 1);

    // A second change inside the rate window is ignored
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &v1,
            false,
            &json!({ "action": "set_username", "username": "Again" }),
        )
        .await;
    assert_eq!(
        session(&fixture).await.viewer(&v1).unwrap().username,
        "Viewer One"
    );

    // Oversized names are rejected outright
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &v1,
            false,
            &json!({ "action": "set_username", "username": "x".repeat(26) }),
        )
        .await;
    assert_eq!(
        session(&fixture).await.viewer(&v1).unwrap().username,
        "Viewer One"
    );
}

#[tokio::test]
async fn viewers_cannot_invoke_controller_actions() {
    let fixture = room_fixture().await;
    let v1 = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();
    let v2 = fixture
        .collab
        .admit_viewer(fixture.session_id, ViewerPermission::Participant)
        .await
        .unwrap();

    // A viewer attempting assign_slot is ignored
    fixture
        .collab
        .handle_text(
            fixture.session_id,
            &v1,
            false,
            &json!({ "action": "assign_slot", "viewer_token": v2, "slot": 1 }),
        )
        .await;
    let session = session(&fixture).await;
    assert_eq!(session.viewer(&v2).unwrap().slot, None);
}
