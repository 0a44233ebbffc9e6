//! Signaling endpoint integration: socket lifecycle, message routing, and
//! malformed-input tolerance.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use mirage_common::SignalMessage;
use mirage_server::signal::{SignalingEvent, SignalingServer};

#[tokio::test]
async fn lifecycle_and_message_round_trip() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let server = SignalingServer::bind("127.0.0.1:0".parse().unwrap(), events_tx)
        .await
        .unwrap();
    let url = format!("ws://{}/ws", server.local_addr());

    let (mut ws, _) = connect_async(&url).await.unwrap();

    let client_id = match events_rx.recv().await.unwrap() {
        SignalingEvent::ClientConnected(id) => id,
        other => panic!("unexpected event: {other:?}"),
    };

    // Server-to-client offer routing.
    assert!(
        server
            .handle()
            .send_offer(client_id, "v=0\r\n".to_owned())
            .await
    );
    match ws.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => match serde_json::from_str::<SignalMessage>(&text).unwrap() {
            SignalMessage::Offer { sdp } => assert_eq!(sdp, "v=0\r\n"),
            other => panic!("unexpected message: {other:?}"),
        },
        other => panic!("unexpected ws frame: {other:?}"),
    }

    // Client-to-server answer.
    let answer = serde_json::to_string(&SignalMessage::Answer {
        sdp: "v=0 answer".to_owned(),
    })
    .unwrap();
    ws.send(WsMessage::Text(answer)).await.unwrap();
    match events_rx.recv().await.unwrap() {
        SignalingEvent::Answer { client_id: id, sdp } => {
            assert_eq!(id, client_id);
            assert_eq!(sdp, "v=0 answer");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Malformed JSON is dropped without closing the socket.
    ws.send(WsMessage::Text("{not json".to_owned()))
        .await
        .unwrap();
    let candidate = serde_json::to_string(&SignalMessage::Candidate {
        mline_index: 0,
        candidate: "candidate:1 1 UDP 2122252543 192.168.1.5 50000 typ host".to_owned(),
    })
    .unwrap();
    ws.send(WsMessage::Text(candidate)).await.unwrap();
    match events_rx.recv().await.unwrap() {
        SignalingEvent::Candidate { mline_index, .. } => assert_eq!(mline_index, 0),
        other => panic!("unexpected event: {other:?}"),
    }

    // Socket close surfaces as a disconnect event.
    drop(ws);
    match events_rx.recv().await.unwrap() {
        SignalingEvent::ClientDisconnected(id) => assert_eq!(id, client_id),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn sends_to_unknown_clients_report_failure() {
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let server = SignalingServer::bind("127.0.0.1:0".parse().unwrap(), events_tx)
        .await
        .unwrap();
    assert!(!server.handle().send_offer(999, "v=0".to_owned()).await);
}
