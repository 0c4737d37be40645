mod common;

use common::spawn_server;
use reqwest::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn conversation_message_and_receipt_flow() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let alice_token = server.token(alice, "Alice");
    let bob_token = server.token(bob, "Bob");
    let carol_token = server.token(carol, "Carol");

    let resp = client
        .get(server.url("/api/conversations"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice_token)
        .json(&json!({
            "name": "Weekend",
            "participants": [{"user_id": bob, "display_name": "Bob"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let conv: Value = resp.json().await.unwrap();
    let conv_id = conv["id"].as_str().unwrap().to_string();
    assert_eq!(conv["type"], "group");

    // client-chosen id makes the send idempotent
    let msg_id = Uuid::new_v4();
    let body = json!({"id": msg_id, "content": "hi"});
    let resp = client
        .post(server.url(&format!("/api/conversations/{conv_id}/messages")))
        .bearer_auth(&alice_token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = client
        .post(server.url(&format!("/api/conversations/{conv_id}/messages")))
        .bearer_auth(&alice_token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let unread: Value = client
        .get(server.url("/api/unread"))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unread["total"], 1);

    let history: Vec<Value> = client
        .get(server.url(&format!("/api/conversations/{conv_id}/messages?limit=10")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["content"], "hi");

    let marked: Value = client
        .post(server.url(&format!("/api/conversations/{conv_id}/read")))
        .bearer_auth(&bob_token)
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(marked["message_ids"][0], msg_id.to_string());

    let unread: Value = client
        .get(server.url("/api/unread"))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unread["total"], 0);

    let receipts: Value = client
        .get(server.url(&format!("/api/messages/{msg_id}/receipts")))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(receipts["read_count"], 1);
    assert_eq!(receipts["read_by"][0]["display_name"], "Bob");

    // only the sender edits
    let resp = client
        .patch(server.url(&format!("/api/messages/{msg_id}")))
        .bearer_auth(&bob_token)
        .json(&json!({"content": "hijacked"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "forbidden");

    let resp = client
        .get(server.url(&format!("/api/conversations/{conv_id}")))
        .bearer_auth(&carol_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = client
        .get(server.url(&format!("/api/conversations/{}", Uuid::new_v4())))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn direct_conversation_is_get_or_create() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let first: Value = client
        .post(server.url("/api/conversations/direct"))
        .bearer_auth(server.token(alice, "Alice"))
        .json(&json!({"user_id": bob, "display_name": "Bob"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: Value = client
        .post(server.url("/api/conversations/direct"))
        .bearer_auth(server.token(bob, "Bob"))
        .json(&json!({"user_id": alice, "display_name": "Alice"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["type"], "direct");

    let resp = client
        .post(server.url("/api/conversations/direct"))
        .bearer_auth(server.token(alice, "Alice"))
        .json(&json!({"user_id": alice, "display_name": "Alice"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forbidden_patch_applies_nothing() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conv: Value = client
        .post(server.url("/api/conversations"))
        .bearer_auth(server.token(alice, "Alice"))
        .json(&json!({
            "name": "Family",
            "participants": [{"user_id": bob, "display_name": "Bob"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = conv["id"].as_str().unwrap();

    let resp = client
        .patch(server.url(&format!("/api/conversations/{id}")))
        .bearer_auth(server.token(bob, "Bob"))
        .json(&json!({"name": "Bob's", "is_archived": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let view: Value = client
        .get(server.url(&format!("/api/conversations/{id}")))
        .bearer_auth(server.token(bob, "Bob"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["name"], "Family");
    assert_eq!(view["is_archived"], false);

    // archiving alone is open to any member
    let resp = client
        .patch(server.url(&format!("/api/conversations/{id}")))
        .bearer_auth(server.token(bob, "Bob"))
        .json(&json!({"is_archived": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let view: Value = resp.json().await.unwrap();
    assert_eq!(view["is_archived"], true);
}

#[tokio::test]
async fn call_lifecycle_over_rest() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let alice_token = server.token(alice, "Alice");
    let bob_token = server.token(bob, "Bob");
    let conv: Value = client
        .post(server.url("/api/conversations/direct"))
        .bearer_auth(&alice_token)
        .json(&json!({"user_id": bob, "display_name": "Bob"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conv_id = conv["id"].as_str().unwrap().to_string();

    let resp = client
        .post(server.url(&format!("/api/conversations/{conv_id}/calls")))
        .bearer_auth(&alice_token)
        .json(&json!({"call_type": "video"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let started: Value = resp.json().await.unwrap();
    let call_id = started["call"]["id"].as_str().unwrap().to_string();
    assert_eq!(started["call"]["status"], "ringing");
    assert_eq!(started["token"]["call_id"], call_id.as_str());

    // a second call while one is ringing
    let resp = client
        .post(server.url(&format!("/api/conversations/{conv_id}/calls")))
        .bearer_auth(&bob_token)
        .json(&json!({"call_type": "audio"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // the callee cannot join before answering
    let resp = client
        .get(server.url(&format!("/api/calls/{call_id}/token")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let answered: Value = client
        .post(server.url(&format!("/api/calls/{call_id}/answer")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(answered["call"]["status"], "ongoing");

    let resp = client
        .post(server.url(&format!("/api/calls/{call_id}/decline")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "invalid_transition");

    let active: Value = client
        .get(server.url(&format!("/api/conversations/{conv_id}/call")))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active["id"], call_id.as_str());

    let ended: Value = client
        .post(server.url(&format!("/api/calls/{call_id}/end")))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ended["status"], "ended");

    let history: Vec<Value> = client
        .get(server.url(&format!("/api/conversations/{conv_id}/messages")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let log = history.last().unwrap();
    assert_eq!(log["message_type"], "call");
    assert!(log["content"].as_str().unwrap().starts_with("Video call"));
}

#[tokio::test]
async fn presence_heartbeat_and_snapshot() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    client
        .post(server.url("/api/conversations/direct"))
        .bearer_auth(server.token(alice, "Alice"))
        .json(&json!({"user_id": bob, "display_name": "Bob"}))
        .send()
        .await
        .unwrap();

    let me: Value = client
        .post(server.url("/api/presence/heartbeat"))
        .bearer_auth(server.token(bob, "Bob"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["is_online"], true);

    let records: Vec<Value> = client
        .get(server.url("/api/presence"))
        .bearer_auth(server.token(alice, "Alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let bob_record = records
        .iter()
        .find(|r| r["user_id"] == bob.to_string())
        .unwrap();
    assert_eq!(bob_record["is_online"], true);
    let alice_record = records
        .iter()
        .find(|r| r["user_id"] == alice.to_string())
        .unwrap();
    assert_eq!(alice_record["is_online"], false);

    let resp = client
        .get(server.url("/api/presence?users=not-a-uuid"))
        .bearer_auth(server.token(alice, "Alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn state_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_path_buf();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let server = common::spawn_server_in(tmp).await;
    let client = reqwest::Client::new();
    let conv: Value = client
        .post(server.url("/api/conversations/direct"))
        .bearer_auth(server.token(alice, "Alice"))
        .json(&json!({"user_id": bob, "display_name": "Bob"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conv_id = conv["id"].as_str().unwrap().to_string();
    client
        .post(server.url(&format!("/api/conversations/{conv_id}/messages")))
        .bearer_auth(server.token(alice, "Alice"))
        .json(&json!({"content": "still here?"}))
        .send()
        .await
        .unwrap();
    server.handle.abort();
    let tmp = server.tmp;
    drop(server.state);

    let restarted = common::spawn_server_in(tmp).await;
    assert_eq!(restarted.tmp.path(), dir.as_path());
    let history: Vec<Value> = client
        .get(restarted.url(&format!("/api/conversations/{conv_id}/messages")))
        .bearer_auth(restarted.token(bob, "Bob"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["content"], "still here?");
}
