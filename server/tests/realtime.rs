mod common;

use chat_proto::ServerEvent;
use common::{connect, next_frame, next_matching, none_matching, send, spawn_server};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

async fn group(server: &common::TestServer, owner: Uuid, member: Uuid) -> Uuid {
    let conv: Value = reqwest::Client::new()
        .post(server.url("/api/conversations"))
        .bearer_auth(server.token(owner, "Alice"))
        .json(&json!({
            "name": "Family",
            "participants": [{"user_id": member, "display_name": "Bob"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    conv["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn connected_frame_advertises_features() {
    let server = spawn_server().await;
    let user = Uuid::new_v4();
    let (_ws, hello) = connect(server.addr, &server.token(user, "Alice")).await;
    assert_eq!(hello.seq, None);
    match hello.event {
        ServerEvent::Connected {
            user_id, features, ..
        } => {
            assert_eq!(user_id, user);
            assert!(features.typing);
            assert_eq!(features.heartbeat_timeout_secs, 60);
        }
        other => panic!("expected connected, got {other:?}"),
    }
}

#[tokio::test]
async fn messages_fan_out_in_commit_order() {
    let server = spawn_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = group(&server, alice, bob).await;
    let (mut alice_ws, _) = connect(server.addr, &server.token(alice, "Alice")).await;
    let (mut bob_ws, _) = connect(server.addr, &server.token(bob, "Bob")).await;
    send(&mut alice_ws, json!({"type": "subscribe_conversation", "id": conv})).await;
    send(&mut bob_ws, json!({"type": "subscribe_conversation", "id": conv})).await;
    // status replies are ordered after the subscribe on the same socket
    send(&mut bob_ws, json!({"type": "get_status"})).await;
    let status = next_matching(&mut bob_ws, |f| matches!(f.event, ServerEvent::Status { .. })).await;
    match status.event {
        ServerEvent::Status { subscriptions, .. } => assert_eq!(subscriptions.len(), 1),
        _ => unreachable!(),
    }
    send(&mut alice_ws, json!({"type": "get_status"})).await;
    next_matching(&mut alice_ws, |f| matches!(f.event, ServerEvent::Status { .. })).await;

    let client = reqwest::Client::new();
    for text in ["one", "two", "three"] {
        let resp = client
            .post(server.url(&format!("/api/conversations/{conv}/messages")))
            .bearer_auth(server.token(alice, "Alice"))
            .json(&json!({"content": text}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    let mut last_seq = 0;
    let mut seen = Vec::new();
    while seen.len() < 3 {
        let frame = next_matching(&mut bob_ws, |f| matches!(f.event, ServerEvent::NewMessage { .. })).await;
        let seq = frame.seq.expect("mutations are sequenced");
        assert!(seq > last_seq);
        last_seq = seq;
        if let ServerEvent::NewMessage { message } = frame.event {
            seen.push(message.content.unwrap());
        }
    }
    assert_eq!(seen, vec!["one", "two", "three"]);

    // REST senders get their own echo
    let echo = next_matching(&mut alice_ws, |f| matches!(f.event, ServerEvent::NewMessage { .. })).await;
    match echo.event {
        ServerEvent::NewMessage { message } => assert_eq!(message.content.as_deref(), Some("one")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn typing_skips_the_typist() {
    let server = spawn_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = group(&server, alice, bob).await;
    let (mut alice_ws, _) = connect(server.addr, &server.token(alice, "Alice")).await;
    let (mut bob_ws, _) = connect(server.addr, &server.token(bob, "Bob")).await;
    for ws in [&mut alice_ws, &mut bob_ws] {
        send(ws, json!({"type": "subscribe_conversation", "id": conv})).await;
        send(ws, json!({"type": "get_status"})).await;
        next_matching(ws, |f| matches!(f.event, ServerEvent::Status { .. })).await;
    }

    send(
        &mut bob_ws,
        json!({"type": "typing", "conversation_id": conv, "is_typing": true}),
    )
    .await;
    let frame = next_matching(&mut alice_ws, |f| matches!(f.event, ServerEvent::Typing { .. })).await;
    assert_eq!(frame.seq, None);
    match frame.event {
        ServerEvent::Typing {
            user_id,
            display_name,
            is_typing,
            ..
        } => {
            assert_eq!(user_id, bob);
            assert_eq!(display_name, "Bob");
            assert!(is_typing);
        }
        _ => unreachable!(),
    }
    assert!(
        none_matching(&mut bob_ws, Duration::from_millis(300), |f| matches!(
            f.event,
            ServerEvent::Typing { .. }
        ))
        .await
    );

    // closing the typist's only session clears the indicator
    drop(bob_ws);
    let frame = next_matching(&mut alice_ws, |f| {
        matches!(f.event, ServerEvent::Typing { is_typing: false, .. })
    })
    .await;
    assert_eq!(frame.event.conversation_id(), Some(conv));
}

#[tokio::test]
async fn outsiders_cannot_subscribe() {
    let server = spawn_server().await;
    let (alice, bob, mallory) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let conv = group(&server, alice, bob).await;
    let (mut ws, _) = connect(server.addr, &server.token(mallory, "Mallory")).await;
    send(&mut ws, json!({"type": "subscribe_conversation", "id": conv})).await;
    let frame = next_frame(&mut ws).await;
    match frame.event {
        ServerEvent::Error { code, .. } => assert_eq!(code, "forbidden"),
        other => panic!("expected error, got {other:?}"),
    }
    send(&mut ws, json!({"type": "nonsense"})).await;
    let frame = next_frame(&mut ws).await;
    match frame.event {
        ServerEvent::Error { code, .. } => assert_eq!(code, "invalid_frame"),
        other => panic!("expected error, got {other:?}"),
    }
    send(&mut ws, json!({"type": "ping"})).await;
    let frame = next_frame(&mut ws).await;
    assert!(matches!(frame.event, ServerEvent::Pong { .. }));
}

#[tokio::test]
async fn leaving_stops_conversation_traffic() {
    let server = spawn_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = group(&server, alice, bob).await;
    let (mut bob_ws, _) = connect(server.addr, &server.token(bob, "Bob")).await;
    send(&mut bob_ws, json!({"type": "subscribe_conversation", "id": conv})).await;
    send(&mut bob_ws, json!({"type": "get_status"})).await;
    next_matching(&mut bob_ws, |f| matches!(f.event, ServerEvent::Status { .. })).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(server.url(&format!("/api/conversations/{conv}/leave")))
        .bearer_auth(server.token(bob, "Bob"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    // the leaver still sees their own departure
    let update = next_matching(&mut bob_ws, |f| {
        matches!(f.event, ServerEvent::ConversationUpdated { .. })
    })
    .await;
    assert_eq!(update.event.conversation_id(), Some(conv));

    let resp = client
        .post(server.url(&format!("/api/conversations/{conv}/messages")))
        .bearer_auth(server.token(alice, "Alice"))
        .json(&json!({"content": "still there?"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert!(
        none_matching(&mut bob_ws, Duration::from_millis(300), |f| matches!(
            f.event,
            ServerEvent::NewMessage { .. }
        ))
        .await
    );
    send(&mut bob_ws, json!({"type": "get_status"})).await;
    let status = next_matching(&mut bob_ws, |f| matches!(f.event, ServerEvent::Status { .. })).await;
    match status.event {
        ServerEvent::Status { subscriptions, .. } => assert!(subscriptions.is_empty()),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn presence_event_when_member_comes_online() {
    let server = spawn_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conv = group(&server, alice, bob).await;
    let (mut alice_ws, _) = connect(server.addr, &server.token(alice, "Alice")).await;
    send(&mut alice_ws, json!({"type": "subscribe_conversation", "id": conv})).await;
    send(&mut alice_ws, json!({"type": "get_status"})).await;
    next_matching(&mut alice_ws, |f| matches!(f.event, ServerEvent::Status { .. })).await;

    let (_bob_ws, _) = connect(server.addr, &server.token(bob, "Bob")).await;
    let frame = next_matching(&mut alice_ws, |f| {
        matches!(f.event, ServerEvent::Presence { user_id, .. } if user_id == bob)
    })
    .await;
    match frame.event {
        ServerEvent::Presence { is_online, .. } => assert!(is_online),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn folder_events_reach_folder_subscribers() {
    let server = spawn_server().await;
    let user = Uuid::new_v4();
    let token = server.token(user, "Alice");
    let (mut ws, _) = connect(server.addr, &token).await;
    send(&mut ws, json!({"type": "subscribe_folder", "id": "inbox"})).await;
    send(&mut ws, json!({"type": "get_status"})).await;
    next_matching(&mut ws, |f| matches!(f.event, ServerEvent::Status { .. })).await;

    let resp = reqwest::Client::new()
        .post(server.url("/api/folders/inbox/events"))
        .bearer_auth(&token)
        .json(&json!({"type": "error", "code": "mailbox", "message": "3 new"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let frame = next_matching(&mut ws, |f| matches!(f.event, ServerEvent::Error { .. })).await;
    match frame.event {
        ServerEvent::Error { code, message } => {
            assert_eq!(code, "mailbox");
            assert_eq!(message, "3 new");
        }
        _ => unreachable!(),
    }
}
