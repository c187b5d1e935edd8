//! End-to-end smoke test: the real tungstenite connector against an axum
//! WebSocket backend standing in for the chat server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

use skiff_core::bridge::{Bridge, BridgeEvent, BridgeSettings, WsConnector};
use skiff_core::identity::{AuthMode, IdentityResolver, SessionStore};
use skiff_core::translate::RecordBody;

type Channels = (mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>);
type ServerState = Arc<Mutex<Option<Channels>>>;

async fn ws_handler(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: ServerState) {
    let Some((mut to_client, from_client)) = state.lock().unwrap().take() else {
        return;
    };
    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = from_client.send(text);
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            outbound = to_client.recv() => match outbound {
                Some(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn next_frame(from_client: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(5), from_client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("backend connection closed");
    serde_json::from_str(&text).expect("bridge sent invalid JSON")
}

#[tokio::test]
async fn bridge_speaks_the_protocol_over_a_real_socket() {
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (from_client_tx, mut from_client_rx) = mpsc::unbounded_channel();
    let state: ServerState = Arc::new(Mutex::new(Some((to_client_rx, from_client_tx))));

    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let resolver = IdentityResolver::new(
        AuthMode::StaticAdmin {
            account: "9000".to_string(),
            secret: "s3cret".to_string(),
        },
        SessionStore::at(dir.path().join("session.toml")),
    )
    .unwrap();
    let settings = BridgeSettings {
        bot_id: "10001".to_string(),
        bot_name: "Skiffy".to_string(),
        ws_url: Url::parse(&format!("ws://{addr}/ws")).unwrap(),
    };
    let (bridge, mut events) = Bridge::spawn(settings, resolver, Arc::new(WsConnector));
    bridge.connect();

    let handshake = next_frame(&mut from_client_rx).await;
    assert_eq!(handshake["meta_event_type"], "lifecycle");
    assert_eq!(handshake["self_id"], "10001");
    assert_eq!(handshake["version"]["app_name"], "skiff");

    // First heartbeat fires immediately after the handshake.
    let heartbeat = next_frame(&mut from_client_rx).await;
    assert_eq!(heartbeat["meta_event_type"], "heartbeat");

    to_client_tx
        .send(json!({ "echo": "e7", "action": "get_version_info" }).to_string())
        .unwrap();
    let response = next_frame(&mut from_client_rx).await;
    assert_eq!(response["status"], "ok");
    assert_eq!(response["echo"], "e7");
    assert_eq!(response["data"]["protocol_version"], "v11");

    to_client_tx
        .send(
            json!({
                "action": "send_msg",
                "params": { "message": [ { "type": "text", "data": { "text": "ahoy" } } ] }
            })
            .to_string(),
        )
        .unwrap();
    let record = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a record")
            .expect("bridge dropped its event channel");
        if let BridgeEvent::Record(record) = event {
            break record;
        }
    };
    assert_eq!(record.body, RecordBody::Text("ahoy".to_string()));

    bridge.shutdown().await;
}
