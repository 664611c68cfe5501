use std::sync::Arc;

use charity_relay::api;
use charity_relay::models::{Conversation, Message, Notification};
use charity_relay::room::resolve_room;
use charity_relay::server::Server;
use charity_relay::store::MemoryStore;
use serde_json::{json, Value};
use tempfile::tempdir;
use warp::http::StatusCode;

fn server() -> Server {
    Server::new(Arc::new(MemoryStore::new()))
}

async fn post_message(server: &Server, text: &str, from: &str, to: &str) -> (StatusCode, Value) {
    let static_dir = tempdir().unwrap();
    let resp = warp::test::request()
        .method("POST")
        .path("/message")
        .json(&json!({
            "text": text,
            "isRead": false,
            "roomId": resolve_room(from, to),
            "senderId": from,
            "receiverId": to,
        }))
        .reply(&api::routes(server.clone(), static_dir.path()))
        .await;
    (resp.status(), serde_json::from_slice(resp.body()).unwrap())
}

#[tokio::test]
async fn created_messages_are_listed_by_room() {
    let server = server();
    let static_dir = tempdir().unwrap();
    let routes = api::routes(server.clone(), static_dir.path());

    let (status, body) = post_message(&server, "hello", "bob", "alice").await;
    assert_eq!(status, StatusCode::CREATED);
    let created: Message = serde_json::from_value(body).unwrap();
    assert_eq!(created.room_id, "alice-bob");
    assert!(!created.is_read);

    let resp = warp::test::request()
        .path("/message/room/alice-bob")
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let listed: Vec<Message> = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(listed, vec![created]);
}

#[tokio::test]
async fn blank_message_is_a_bad_request() {
    let server = server();
    let (status, body) = post_message(&server, "   ", "alice", "bob").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "message text is empty");
}

#[tokio::test]
async fn conversation_tracks_last_message_for_both_participants() {
    let server = server();
    let static_dir = tempdir().unwrap();
    let routes = api::routes(server.clone(), static_dir.path());

    post_message(&server, "first", "alice", "bob").await;
    post_message(&server, "second", "bob", "alice").await;

    for user in ["alice", "bob"] {
        let resp = warp::test::request()
            .path(&format!("/conversation/{user}"))
            .reply(&routes)
            .await;
        let conversations: Vec<Conversation> = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].last_message, "second");
        assert_eq!(conversations[0].participants, vec!["alice", "bob"]);
    }
}

#[tokio::test]
async fn mark_read_route_flips_flags() {
    let server = server();
    let static_dir = tempdir().unwrap();
    let routes = api::routes(server.clone(), static_dir.path());

    let (_, body) = post_message(&server, "hi", "alice", "bob").await;
    let created: Message = serde_json::from_value(body).unwrap();

    let resp = warp::test::request()
        .method("PATCH")
        .path("/message/read")
        .json(&json!({ "messageIds": [created.id] }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = warp::test::request()
        .path("/message/room/alice-bob")
        .reply(&routes)
        .await;
    let listed: Vec<Message> = serde_json::from_slice(resp.body()).unwrap();
    assert!(listed[0].is_read);
}

#[tokio::test]
async fn domain_posts_raise_notifications_until_marked_seen() {
    let server = server();
    let static_dir = tempdir().unwrap();
    let routes = api::routes(server.clone(), static_dir.path());

    let resp = warp::test::request()
        .method("POST")
        .path("/donation")
        .json(&json!({ "id": "donation-42", "name": "Winter coats", "quantity": 12, "seen": true }))
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let notification: Notification = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(notification.message, "New donation item: Winter coats");
    assert_eq!(notification.details["quantity"], 12);
    // The item's own id and flags stay inside the details.
    assert_ne!(notification.id, "donation-42");
    assert_eq!(notification.details["id"], "donation-42");
    assert!(!notification.seen);

    warp::test::request()
        .method("POST")
        .path("/inNeed")
        .json(&json!({ "title": "Rice" }))
        .reply(&routes)
        .await;

    let resp = warp::test::request()
        .path("/notification/GetAllnotification")
        .reply(&routes)
        .await;
    let listed: Vec<Notification> = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].message, "New in-need request: Rice");

    let resp = warp::test::request()
        .path("/notification/unseen-count")
        .reply(&routes)
        .await;
    let body: Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["count"], 2);

    let resp = warp::test::request()
        .method("PATCH")
        .path("/notification/mark-all-seen")
        .reply(&routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = warp::test::request()
        .path("/notification/unseen-count")
        .reply(&routes)
        .await;
    let body: Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let static_dir = tempdir().unwrap();
    let resp = warp::test::request()
        .path("/nothing/here")
        .reply(&api::routes(server(), static_dir.path()))
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
