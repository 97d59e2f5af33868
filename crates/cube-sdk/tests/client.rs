//! SDK behaviour against a scripted relay.

use std::time::Duration;

use cube_sdk::{ConnectOptions, Cube, Event, EventKind, OpenContext, SdkError};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn listen() -> (TcpListener, ConnectOptions) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let options = ConnectOptions {
        host: "127.0.0.1".into(),
        port: listener.local_addr().unwrap().port(),
        secondary: false,
        reconnect_delay: Duration::from_millis(50),
    };
    (listener, options)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = timeout(TIMEOUT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn read_json(ws: &mut ServerWs) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn commands_are_correlated_by_id() {
    let (listener, options) = listen().await;
    let cube = Cube::connect(options);
    let mut relay = accept(&listener).await;
    timeout(TIMEOUT, cube.wait_connected()).await.unwrap().unwrap();

    let first = cube.open_lock("L1", OpenContext::default());
    let second = cube.restart_user_interface();
    let relay_side = async {
        let a = read_json(&mut relay).await;
        let b = read_json(&mut relay).await;
        assert_eq!(a["@type"], "openLock");
        assert_eq!(b["@type"], "restartUi");
        assert_ne!(a["@id"], b["@id"]);
        // Answer out of order.
        send_json(&mut relay, json!({"@type": "nak", "@id": b["@id"], "error": "busy"})).await;
        send_json(&mut relay, json!({"@type": "ack", "@id": a["@id"]})).await;
    };
    let (first, second, ()) = tokio::join!(first, second, relay_side);
    first.unwrap();
    assert!(matches!(second, Err(SdkError::Rejected(reason)) if reason == "busy"));

    cube.close().await;
}

#[tokio::test]
async fn pending_command_fails_when_connection_drops() {
    let (listener, options) = listen().await;
    let cube = Cube::connect(options);
    let mut relay = accept(&listener).await;
    timeout(TIMEOUT, cube.wait_connected()).await.unwrap().unwrap();

    let command = cube.restart_operating_system();
    let relay_side = async {
        let _ = read_json(&mut relay).await;
        drop(relay);
    };
    let (result, ()) = tokio::join!(command, relay_side);
    assert!(matches!(result, Err(SdkError::NotConnected)));

    // Reconnects by itself.
    let _relay = accept(&listener).await;
    timeout(TIMEOUT, cube.wait_connected()).await.unwrap().unwrap();
    cube.close().await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_ignored() {
    let (listener, options) = listen().await;
    let cube = Cube::connect(options);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = cube.add_event_listener(EventKind::Code, move |event| {
        let _ = tx.send(event.clone());
    });
    let mut relay = accept(&listener).await;
    timeout(TIMEOUT, cube.wait_connected()).await.unwrap().unwrap();

    relay.send(Message::text("garbage")).await.unwrap();
    send_json(&mut relay, json!({"@type": "somethingNew", "x": 1})).await;
    send_json(&mut relay, json!({"@type": "ack", "@id": "999"})).await;
    send_json(&mut relay, json!({"@type": "code", "code": "0815", "source": "KEYPAD"})).await;

    let event = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        Event::Code {
            code: "0815".into(),
            source: cube_sdk::CodeSource::Keypad,
        }
    );
    assert!(cube.connected());
    cube.close().await;
}

#[tokio::test]
async fn removed_listener_is_not_called() {
    let (listener, options) = listen().await;
    let cube = Cube::connect(options);
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
    let kept_tx = tx.clone();
    let removed = cube.add_event_listener(EventKind::Devices, move |_| {
        let _ = tx.send("removed");
    });
    let _ = cube.add_event_listener(EventKind::Devices, move |_| {
        let _ = kept_tx.send("kept");
    });
    assert!(cube.remove_event_listener(EventKind::Devices, removed));

    let mut relay = accept(&listener).await;
    send_json(&mut relay, json!({"@type": "devices", "devices": [{"id": "kiosk", "types": ["Kiosk"]}]})).await;
    assert_eq!(timeout(TIMEOUT, rx.recv()).await.unwrap(), Some("kept"));
    assert_eq!(cube.devices().len(), 1);
    assert!(rx.try_recv().is_err());
    cube.close().await;
}
