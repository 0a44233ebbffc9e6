//! Embedded WebSocket signaling endpoint.
//!
//! Each accepted socket is one streaming client. The socket lifecycle and
//! inbound SDP/ICE messages surface as [`SignalingEvent`]s on a channel the
//! peer manager consumes; outbound offers and candidates are routed back by
//! client id through the [`SignalingHandle`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mirage_common::SignalMessage;

/// Opaque id of a connected signaling client, assigned per socket.
pub type ClientId = u64;

#[derive(Debug)]
pub enum SignalingEvent {
    ClientConnected(ClientId),
    ClientDisconnected(ClientId),
    Answer {
        client_id: ClientId,
        sdp: String,
    },
    Candidate {
        client_id: ClientId,
        mline_index: u32,
        candidate: String,
    },
}

type ConnectionMap = Arc<RwLock<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>;

/// Outbound half of the signaling server, cheap to clone.
#[derive(Clone, Default)]
pub struct SignalingHandle {
    clients: ConnectionMap,
}

impl SignalingHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub async fn send_offer(&self, id: ClientId, sdp: String) -> bool {
        self.send(id, SignalMessage::Offer { sdp }).await
    }

    pub async fn send_candidate(&self, id: ClientId, mline_index: u32, candidate: String) -> bool {
        self.send(
            id,
            SignalMessage::Candidate {
                mline_index,
                candidate,
            },
        )
        .await
    }

    async fn send(&self, id: ClientId, msg: SignalMessage) -> bool {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, "failed to serialize signaling message");
                return false;
            }
        };
        let clients = self.clients.read().await;
        match clients.get(&id) {
            Some(tx) => tx.send(Message::Text(text)).is_ok(),
            None => {
                debug!(client = id, "signaling send to unknown client");
                false
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    next_id: Arc<AtomicU64>,
    clients: ConnectionMap,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

pub struct SignalingServer {
    handle: SignalingHandle,
    local_addr: SocketAddr,
    _task: JoinHandle<()>,
}

impl SignalingServer {
    /// Bind the websocket endpoint and start serving in the background.
    pub async fn bind(
        addr: SocketAddr,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> std::io::Result<Self> {
        let handle = SignalingHandle::new();
        let state = AppState {
            next_id: Arc::new(AtomicU64::new(1)),
            clients: handle.clients.clone(),
            events,
        };

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(%err, "signaling server exited");
            }
        });

        Ok(Self {
            handle,
            local_addr,
            _task: task,
        })
    }

    pub fn handle(&self) -> SignalingHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(stream: WebSocket, state: AppState) {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    info!(client = id, "signaling client connected");

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.clients.write().await.insert(id, tx);

    // Forward routed messages out to the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    if state
        .events
        .send(SignalingEvent::ClientConnected(id))
        .is_err()
    {
        state.clients.write().await.remove(&id);
        writer.abort();
        return;
    }

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let signal: SignalMessage = match serde_json::from_str(&text) {
                    Ok(signal) => signal,
                    Err(err) => {
                        warn!(client = id, %err, "malformed signaling message dropped");
                        continue;
                    }
                };
                let event = match signal {
                    SignalMessage::Answer { sdp } => SignalingEvent::Answer { client_id: id, sdp },
                    SignalMessage::Candidate {
                        mline_index,
                        candidate,
                    } => SignalingEvent::Candidate {
                        client_id: id,
                        mline_index,
                        candidate,
                    },
                    SignalMessage::Offer { .. } => {
                        warn!(client = id, "unexpected offer from client, dropped");
                        continue;
                    }
                };
                if state.events.send(event).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(client = id, %err, "signaling socket error");
                break;
            }
        }
    }

    state.clients.write().await.remove(&id);
    writer.abort();
    let _ = state.events.send(SignalingEvent::ClientDisconnected(id));
    info!(client = id, "signaling client disconnected");
}
