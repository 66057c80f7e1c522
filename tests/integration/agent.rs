use std::sync::Arc;
use std::time::Duration;

use chatd::agent::{Agent, InitRequest, bind_init};
use chatd::limits::Policy;
use chatd::models::{Chat, User};
use chatd::store::ChatStore;
use chatd::ws;
use futures::SinkExt;
use futures::StreamExt;
use futures::channel::mpsc as fmpsc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{CoreHarness, core_harness, seed_history, wait_until};

type ClientTx = fmpsc::Sender<Result<ws::Message, ws::result::Error>>;
type ServerRx = fmpsc::Receiver<ws::Message>;

fn seed_member(store: &Arc<dyn ChatStore>, channel: &str, uid: &str, secret: &str) {
    let mut chat = match store.get(channel) {
        Ok(chat) => chat,
        Err(_) => Chat::new(channel, false),
    };
    chat.register(User {
        uid: uid.to_string(),
        display_name: format!("{uid} display"),
        email: format!("{uid}@example.com"),
        secret: secret.to_string(),
    })
    .unwrap();
    store.save(&chat).unwrap();
}

/// Wires an agent to in-memory socket halves and spawns it.
fn connect_agent(h: &CoreHarness, init: Value) -> (ClientTx, ServerRx, JoinHandle<()>) {
    let (client_tx, reader) = fmpsc::channel::<Result<ws::Message, ws::result::Error>>(16);
    let (writer, server_rx) = fmpsc::channel::<ws::Message>(16);
    let agent = Agent::new(Arc::clone(&h.broker), Arc::clone(&h.store));
    let init: InitRequest = serde_json::from_value(init).unwrap();
    let task = tokio::spawn(async move {
        agent.handle(reader, writer, init).await;
    });
    (client_tx, server_rx, task)
}

async fn next_frame(rx: &mut ServerRx) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.next())
            .await
            .ok()??;
        match msg {
            ws::Message::Text(text) => return serde_json::from_str(&text).ok(),
            _ => continue,
        }
    }
}

async fn no_frame(rx: &mut ServerRx) -> bool {
    tokio::time::timeout(Duration::from_millis(300), rx.next())
        .await
        .is_err()
}

async fn wait_refs(h: &CoreHarness, channel: &str, want: usize) -> bool {
    for _ in 0..200 {
        if h.ingest.refs(channel).await == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn send_client(tx: &mut ClientTx, frame: Value) {
    tx.send(Ok(ws::Message::Text(frame.to_string())))
        .await
        .unwrap();
}

// --- Init validation ---

#[test]
fn test_bind_init_rejects_bad_fields() {
    let policy = Policy::default();
    let ok = InitRequest {
        channel: "general".to_string(),
        uid: "me".to_string(),
        secret: "s3cret".to_string(),
        last_seq: None,
    };
    assert!(bind_init(&ok, &policy).is_ok());

    let bad_channel = InitRequest {
        channel: "no-dashes".to_string(),
        ..ok_clone(&ok)
    };
    assert!(bind_init(&bad_channel, &policy).is_err());

    let bad_secret = InitRequest {
        secret: "spaces not allowed".to_string(),
        ..ok_clone(&ok)
    };
    assert!(bind_init(&bad_secret, &policy).is_err());

    let long_uid = InitRequest {
        uid: "u".repeat(33),
        ..ok_clone(&ok)
    };
    assert!(bind_init(&long_uid, &policy).is_err());
}

fn ok_clone(req: &InitRequest) -> InitRequest {
    InitRequest {
        channel: req.channel.clone(),
        uid: req.uid.clone(),
        secret: req.secret.clone(),
        last_seq: req.last_seq,
    }
}

// --- Join failures are fatal ---

#[tokio::test]
async fn test_unknown_channel_is_fatal() {
    let h = core_harness();
    let (_tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "nowhere", "uid": "me", "secret": "x"}),
    );

    let frame = next_frame(&mut rx).await.unwrap();
    assert_eq!(frame["type"], 2);
    assert!(
        frame["error"]
            .as_str()
            .unwrap()
            .contains("unable to find chat")
    );
    // Fatal: the socket is closed afterwards.
    assert!(rx.next().await.is_none());
    task.await.unwrap();
}

#[tokio::test]
async fn test_wrong_secret_is_fatal() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");
    let (_tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "wrong"}),
    );

    let frame = next_frame(&mut rx).await.unwrap();
    assert_eq!(frame["type"], 2);
    assert!(
        frame["error"]
            .as_str()
            .unwrap()
            .contains("unable to join chat")
    );
    assert!(rx.next().await.is_none());
    task.await.unwrap();
}

// --- Scenario S4: recent snapshot then live tail ---

#[tokio::test]
async fn test_push_recent_then_tail() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");
    seed_history(
        &h,
        "general",
        &[
            ("alice", "h1"),
            ("alice", "h2"),
            ("alice", "h3"),
            ("alice", "h4"),
            ("alice", "h5"),
        ],
    )
    .await;

    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret"}),
    );

    let history = next_frame(&mut rx).await.unwrap();
    assert_eq!(history["type"], 1);
    let batch = history["data"].as_array().unwrap();
    assert_eq!(batch.len(), 5);
    assert_eq!(batch[0]["seq"], 1);
    assert_eq!(batch[4]["seq"], 5);

    // The push advanced the last-seen marker past the snapshot.
    assert_eq!(h.store.get_unread_count("me", "general"), 0);

    // Tail picks up at the next sequence.
    crate::common::publish_message(&h.mq, "general", "alice", "live").await;
    let live = next_frame(&mut rx).await.unwrap();
    assert_eq!(live["type"], 0);
    assert_eq!(live["data"]["seq"], 6);
    assert_eq!(live["data"]["text"], "live");

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
    assert!(wait_refs(&h, "general", 0).await);
}

#[tokio::test]
async fn test_empty_channel_subscribes_from_origin() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");

    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret"}),
    );

    // No history frame; the first live message arrives as seq 1.
    crate::common::publish_message(&h.mq, "general", "alice", "first").await;
    let live = next_frame(&mut rx).await.unwrap();
    assert_eq!(live["type"], 0);
    assert_eq!(live["data"]["seq"], 1);

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
}

// --- Scenario S2 end to end: resume + echo suppression ---

#[tokio::test]
async fn test_resume_from_seq_suppresses_echoes() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");
    seed_history(
        &h,
        "general",
        &[
            ("alice", "a1"),
            ("me", "mine1"),
            ("alice", "a2"),
            ("alice", "a3"),
            ("me", "mine2"),
        ],
    )
    .await;

    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret", "last_seq": 1}),
    );

    let mut seqs = Vec::new();
    for _ in 0..3 {
        let frame = next_frame(&mut rx).await.unwrap();
        assert_eq!(frame["type"], 0);
        assert_eq!(frame["data"]["from_uid"], "alice");
        seqs.push(frame["data"]["seq"].as_u64().unwrap());
    }
    assert_eq!(seqs, vec![1, 3, 4]);
    assert!(no_frame(&mut rx).await);

    // Echoes advanced the marker to 5; everything is read.
    let store = Arc::clone(&h.store);
    assert!(wait_until(move || store.get_unread_count("me", "general") == 0).await);

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
}

// --- Scenario S6 and message validation ---

#[tokio::test]
async fn test_oversize_message_rejected() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");

    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret"}),
    );

    let oversize = "x".repeat(1025);
    send_client(&mut tx, json!({"type": 0, "data": {"text": oversize}})).await;

    let frame = next_frame(&mut rx).await.unwrap();
    assert_eq!(frame["type"], 2);
    assert!(frame["error"].as_str().unwrap().contains("max message length"));

    // Nothing was forwarded to the channel: the ingest (running for this
    // subscriber) materialised nothing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (msgs, _) = h.store.get_recent("general", 10).unwrap();
    assert!(msgs.is_empty());

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_empty_message_rejected() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");

    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret"}),
    );

    send_client(&mut tx, json!({"type": 0, "data": {"text": ""}})).await;
    let frame = next_frame(&mut rx).await.unwrap();
    assert_eq!(frame["type"], 2);
    assert_eq!(frame["error"], "sent empty message");

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_send_reaches_peers_without_echo() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");

    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret"}),
    );

    // A second subscriber watches the channel directly.
    let (peer_tx, mut peer_rx) = mpsc::channel(8);
    let peer = h.broker.subscribe("general", "bob", 0, peer_tx).await.unwrap();

    send_client(
        &mut tx,
        json!({"type": 0, "data": {"meta": {"k": "v"}, "text": "hello"}}),
    )
    .await;

    let got = tokio::time::timeout(Duration::from_secs(2), peer_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.text, "hello");
    assert_eq!(got.from_uid, "me");
    assert_eq!(got.from_name, "me display");
    assert_eq!(got.seq, 1);
    assert_eq!(got.meta.get("k").map(String::as_str), Some("v"));

    // The sender never sees its own message.
    assert!(no_frame(&mut rx).await);

    peer.close().await;
    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
}

// --- History requests ---

#[tokio::test]
async fn test_history_request_returns_window() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");
    seed_history(
        &h,
        "general",
        &[
            ("alice", "h1"),
            ("alice", "h2"),
            ("alice", "h3"),
            ("alice", "h4"),
            ("alice", "h5"),
        ],
    )
    .await;

    // Resume past the head so the tail stays quiet during the test.
    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret", "last_seq": 100}),
    );

    send_client(&mut tx, json!({"type": 4, "data": {"to": 4}})).await;
    let frame = next_frame(&mut rx).await.unwrap();
    assert_eq!(frame["type"], 1);
    let batch = frame["data"].as_array().unwrap();
    let seqs: Vec<u64> = batch
        .iter()
        .map(|m| m["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_history_request_to_zero_is_ignored() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");
    seed_history(&h, "general", &[("alice", "h1")]).await;

    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret", "last_seq": 100}),
    );

    send_client(&mut tx, json!({"type": 4, "data": {"to": 0}})).await;
    assert!(no_frame(&mut rx).await);

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unknown_frame_type_ignored() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");

    let (mut tx, mut rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret"}),
    );

    send_client(&mut tx, json!({"type": 3, "data": {"whatever": true}})).await;
    assert!(no_frame(&mut rx).await);

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_close_releases_subscription() {
    let h = core_harness();
    seed_member(&h.store, "general", "me", "s3cret");

    let (mut tx, _rx, task) = connect_agent(
        &h,
        json!({"channel": "general", "uid": "me", "secret": "s3cret"}),
    );

    // Let the subscription come up, then close from the client side.
    assert!(wait_refs(&h, "general", 1).await);

    tx.send(Ok(ws::Message::Close(None))).await.unwrap();
    task.await.unwrap();
    assert_eq!(h.ingest.refs("general").await, 0);
}
