//! WebSocket session protocol tests
//!
//! Full request/reply exchanges through the warp routes, with the broker
//! replaced by the mock transport.

use bytes::Bytes;
use robot_relay::config::RelayConfig;
use robot_relay::hub::server::routes;
use robot_relay::protocol::{MessageEnvelope, QosLevel};
use robot_relay::relay::RelayContext;
use robot_relay::testing::MockTransport;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use warp::test::WsClient;

fn relay() -> Arc<RelayContext<MockTransport>> {
    Arc::new(RelayContext::new(
        RelayConfig::default(),
        Arc::new(MockTransport::connected()),
    ))
}

async fn connect(ctx: &Arc<RelayContext<MockTransport>>) -> WsClient {
    warp::test::ws()
        .path("/ws")
        .handshake(routes(ctx.clone()))
        .await
        .expect("handshake")
}

async fn recv_json(client: &mut WsClient) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("frame within two seconds")
        .expect("socket open");
    serde_json::from_str(message.to_str().expect("text frame")).unwrap()
}

async fn request(client: &mut WsClient, body: Value) -> Value {
    client.send_text(body.to_string()).await;
    recv_json(client).await
}

async fn wait_for_sessions(ctx: &Arc<RelayContext<MockTransport>>, expected: usize) {
    for _ in 0..100 {
        if ctx.hub.session_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session count never reached {expected}");
}

#[tokio::test]
async fn test_welcome_then_ping_pong() {
    let ctx = relay();
    let mut client = connect(&ctx).await;

    let welcome = recv_json(&mut client).await;
    assert_eq!(welcome["type"], "welcome");
    assert!(welcome["data"]["sessionId"].is_string());

    let pong = request(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(ctx.metrics.snapshot().sessions.accepted, 1);
}

#[tokio::test]
async fn test_subscribed_session_receives_matching_messages_only() {
    let ctx = relay();
    let mut client = connect(&ctx).await;
    let _welcome = recv_json(&mut client).await;

    let ack = request(
        &mut client,
        json!({ "type": "subscribe", "topic": "scale/+" }),
    )
    .await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["topic"], "scale/+");

    let mut pipeline = ctx.pipeline();
    pipeline
        .process(MessageEnvelope::new(
            "camera/frame",
            Bytes::from_static(b"{}"),
            QosLevel::AtMostOnce,
        ))
        .await;
    pipeline
        .process(MessageEnvelope::new(
            "scale/weight",
            Bytes::from_static(b"7.25"),
            QosLevel::AtMostOnce,
        ))
        .await;

    let frame = recv_json(&mut client).await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["topic"], "scale/weight");
    assert_eq!(frame["data"]["normalizedData"]["value"], 7.25);
}

#[tokio::test]
async fn test_history_and_status_requests() {
    let ctx = relay();
    let mut pipeline = ctx.pipeline();
    for payload in [&b"1.5"[..], b"2.5"] {
        pipeline
            .process(MessageEnvelope::new(
                "scale/weight",
                Bytes::copy_from_slice(payload),
                QosLevel::AtMostOnce,
            ))
            .await;
    }

    let mut client = connect(&ctx).await;
    let _welcome = recv_json(&mut client).await;

    let history = request(
        &mut client,
        json!({ "type": "get_history", "topic": "scale/weight" }),
    )
    .await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["data"]["count"], 2);
    assert_eq!(history["data"]["entries"][1]["normalizedData"]["value"], 2.5);

    let status = request(&mut client, json!({ "type": "get_status" })).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["data"]["sessionCount"], 1);
    assert_eq!(status["data"]["connection"]["connected"], true);
}

#[tokio::test]
async fn test_publish_is_forwarded_upstream() {
    let ctx = relay();
    let mut client = connect(&ctx).await;
    let _welcome = recv_json(&mut client).await;

    let ack = request(
        &mut client,
        json!({
            "type": "publish",
            "topic": "robot/control/move_joint",
            "message": { "positions": [0, 0, 0, 0, 0, 400] },
        }),
    )
    .await;
    assert_eq!(ack["type"], "ack");
    assert!(!ack["data"]["warnings"].as_array().unwrap().is_empty());

    let forwarded = ctx
        .transport
        .published_to("robot/control/move_joint")
        .await;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].json()["positions"][5], 360.0);
}

#[tokio::test]
async fn test_bad_requests_get_error_frames() {
    let ctx = relay();
    let mut client = connect(&ctx).await;
    let _welcome = recv_json(&mut client).await;

    let error = request(&mut client, json!({ "type": "teleport" })).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], "invalid_request");

    let error = request(
        &mut client,
        json!({ "type": "subscribe", "topic": "scale/#/weight" }),
    )
    .await;
    assert_eq!(error["type"], "error");

    // The session survives bad requests
    let pong = request(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn test_closed_socket_removes_session() {
    let ctx = relay();
    let mut client = connect(&ctx).await;
    let _welcome = recv_json(&mut client).await;
    wait_for_sessions(&ctx, 1).await;

    drop(client);
    wait_for_sessions(&ctx, 0).await;
    for _ in 0..100 {
        if ctx.metrics.snapshot().sessions.closed == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("closed session was never counted");
}

#[tokio::test]
async fn test_shutdown_notifies_and_refuses_new_sessions() {
    let ctx = relay();
    let mut client = connect(&ctx).await;
    let _welcome = recv_json(&mut client).await;

    ctx.shutdown().await;
    let notice = recv_json(&mut client).await;
    assert_eq!(notice["type"], "shutdown");

    let mut late = connect(&ctx).await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), late.recv())
        .await
        .expect("close within two seconds");
    assert!(outcome.map(|m| m.is_close()).unwrap_or(true));
}
