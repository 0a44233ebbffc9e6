//! Connection to the streaming server: signaling WebSocket, the answering
//! WebRTC peer, and the data-channel send path.
//!
//! The connection is a state toggle: [`Connection::connect`] marks the
//! desired state and the transport task (driven on the stream client's
//! thread) builds a fresh session; [`Connection::disconnect`] tears it
//! down and is a no-op when already disconnected. Up-message sends are
//! best-effort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_remote::TrackRemote;

use mirage_common::SignalMessage;

/// Name of the reliable ordered channel the server opens.
pub const DATA_CHANNEL_LABEL: &str = "channel";

const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Sink for client-to-server records; implemented by [`Connection`].
pub trait MessageSink: Send {
    /// Best-effort send on the data channel. Returns false when the
    /// channel is not open.
    fn send_bytes(&self, payload: Bytes) -> bool;
}

pub(crate) struct ConnectionInner {
    uri: String,
    desired: watch::Sender<bool>,
    connected: watch::Sender<bool>,
    shutdown: AtomicBool,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    outbound_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    track_tx: mpsc::UnboundedSender<Arc<TrackRemote>>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection to the given signaling URI. The returned
    /// receiver yields the remote video track of each established session
    /// and is consumed by the stream client.
    pub fn new(uri: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Arc<TrackRemote>>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (track_tx, track_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            uri: uri.into(),
            desired: watch::Sender::new(false),
            connected: watch::Sender::new(false),
            shutdown: AtomicBool::new(false),
            outbound_tx,
            outbound_rx: AsyncMutex::new(Some(outbound_rx)),
            track_tx,
        });
        (Self { inner }, track_rx)
    }

    pub fn connect(&self) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.inner.desired.send_replace(true);
    }

    /// Idempotent; a subsequent [`connect`](Self::connect) builds a fresh
    /// session.
    pub fn disconnect(&self) {
        self.inner.desired.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Observable connection state.
    pub fn connected_signal(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Permanently stop the transport task (stream-client shutdown path).
    pub(crate) fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.desired.send_replace(false);
    }

    pub(crate) fn inner(&self) -> Arc<ConnectionInner> {
        Arc::clone(&self.inner)
    }
}

impl MessageSink for Connection {
    fn send_bytes(&self, payload: Bytes) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner.outbound_tx.send(payload).is_ok()
    }
}

/// Transport main loop: waits for the desired-connected state, runs one
/// session at a time, and rebuilds after disconnects.
pub(crate) async fn transport_main(inner: Arc<ConnectionInner>) {
    let mut desired_rx = inner.desired.subscribe();
    let mut outbound_rx = inner
        .outbound_rx
        .lock()
        .await
        .take()
        .expect("transport task started twice");

    loop {
        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            if *desired_rx.borrow_and_update() {
                break;
            }
            if desired_rx.changed().await.is_err() {
                return;
            }
        }

        match run_session(&inner, &mut desired_rx, &mut outbound_rx).await {
            Ok(()) => info!("session closed"),
            Err(err) => warn!(%err, "session ended"),
        }
        inner.connected.send_replace(false);

        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_session(
    inner: &Arc<ConnectionInner>,
    desired_rx: &mut watch::Receiver<bool>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Bytes>,
) -> anyhow::Result<()> {
    let (ws, _) = connect_async(&inner.uri).await?;
    info!(uri = %inner.uri, "signaling connected");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (sig_tx, mut sig_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let data_channel: Arc<AsyncMutex<Option<Arc<RTCDataChannel>>>> =
        Arc::new(AsyncMutex::new(None));
    let mut peer: Option<Arc<RTCPeerConnection>> = None;

    loop {
        tokio::select! {
            Some(signal) = sig_rx.recv() => {
                let text = serde_json::to_string(&signal)?;
                ws_tx.send(WsMessage::Text(text)).await?;
            }

            Some(payload) = outbound_rx.recv() => {
                let channel = data_channel.lock().await.clone();
                match channel {
                    Some(dc) => {
                        if let Err(err) = dc.send(&payload).await {
                            debug!(%err, "data channel send failed");
                        }
                    }
                    None => debug!("up message dropped, data channel not open"),
                }
            }

            maybe = ws_rx.next() => match maybe {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(SignalMessage::Offer { sdp }) => {
                            match answer_offer(inner, sdp, sig_tx.clone(), Arc::clone(&data_channel)).await {
                                Ok(pc) => peer = Some(pc),
                                Err(err) => warn!(%err, "failed to answer offer"),
                            }
                        }
                        Ok(SignalMessage::Candidate { mline_index, candidate }) => {
                            if candidate.is_empty() {
                                continue;
                            }
                            match peer.as_ref() {
                                Some(pc) => {
                                    let init = RTCIceCandidateInit {
                                        candidate,
                                        sdp_mline_index: Some(mline_index as u16),
                                        ..Default::default()
                                    };
                                    if let Err(err) = pc.add_ice_candidate(init).await {
                                        warn!(%err, "failed to add ICE candidate");
                                    }
                                }
                                None => debug!("candidate before offer, dropped"),
                            }
                        }
                        Ok(SignalMessage::Answer { .. }) => {
                            warn!("unexpected answer from server, dropped");
                        }
                        Err(err) => warn!(%err, "malformed signaling message dropped"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%err, "signaling socket error");
                    break;
                }
            },

            changed = desired_rx.changed() => {
                if changed.is_err() || !*desired_rx.borrow() {
                    info!("disconnect requested");
                    break;
                }
            }
        }
    }

    if let Some(pc) = peer {
        let _ = pc.close().await;
    }
    *data_channel.lock().await = None;
    Ok(())
}

fn build_media_engine() -> webrtc::error::Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    Ok(media_engine)
}

/// Build the answering peer for the server's offer and wire track,
/// data-channel and ICE callbacks.
async fn answer_offer(
    inner: &Arc<ConnectionInner>,
    offer_sdp: String,
    sig_tx: mpsc::UnboundedSender<SignalMessage>,
    data_channel: Arc<AsyncMutex<Option<Arc<RTCDataChannel>>>>,
) -> anyhow::Result<Arc<RTCPeerConnection>> {
    let api = APIBuilder::new()
        .with_media_engine(build_media_engine()?)
        .build();
    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

    let track_tx = inner.track_tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let track_tx = track_tx.clone();
        Box::pin(async move {
            info!(id = %track.id(), "remote video track");
            let _ = track_tx.send(track);
        })
    }));

    let candidate_tx = sig_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let candidate_tx = candidate_tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(SignalMessage::Candidate {
                            mline_index: u32::from(init.sdp_mline_index.unwrap_or(0)),
                            candidate: init.candidate,
                        });
                    }
                    Err(err) => warn!(%err, "candidate serialization failed"),
                }
            }
        })
    }));

    let dc_inner = Arc::clone(inner);
    pc.on_data_channel(Box::new(move |dc| {
        let inner = Arc::clone(&dc_inner);
        let data_channel = Arc::clone(&data_channel);
        Box::pin(async move {
            if dc.label() != DATA_CHANNEL_LABEL {
                debug!(label = dc.label(), "ignoring unexpected data channel");
                return;
            }

            let open_inner = Arc::clone(&inner);
            dc.on_open(Box::new(move || {
                info!("data channel open");
                open_inner.connected.send_replace(true);
                Box::pin(async {})
            }));

            let close_inner = Arc::clone(&inner);
            dc.on_close(Box::new(move || {
                info!("data channel closed");
                close_inner.connected.send_replace(false);
                Box::pin(async {})
            }));

            dc.on_error(Box::new(move |err| {
                warn!(%err, "data channel error");
                Box::pin(async {})
            }));

            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                Box::pin(async move {
                    if msg.is_string {
                        info!(
                            "data channel message: {}",
                            String::from_utf8_lossy(&msg.data)
                        );
                        return;
                    }
                    match mirage_proto::decode_down_framed(&msg.data) {
                        Ok(down) => debug!(
                            frame = down.frame.map(|f| f.frame_sequence_id),
                            "down message on data channel"
                        ),
                        Err(err) => warn!(%err, "undecodable down message dropped"),
                    }
                })
            }));

            *data_channel.lock().await = Some(dc);
        })
    }));

    pc.set_remote_description(RTCSessionDescription::offer(offer_sdp)?)
        .await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer.clone()).await?;
    sig_tx.send(SignalMessage::Answer { sdp: answer.sdp })?;

    Ok(pc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_is_idempotent() {
        let (connection, _tracks) = Connection::new("ws://127.0.0.1:1/ws");
        connection.disconnect();
        connection.disconnect();
        assert!(!connection.is_connected());
        connection.connect();
        assert!(*connection.inner.desired.borrow());
        connection.disconnect();
        assert!(!*connection.inner.desired.borrow());
    }

    #[test]
    fn send_bytes_fails_when_disconnected() {
        let (connection, _tracks) = Connection::new("ws://127.0.0.1:1/ws");
        assert!(!connection.send_bytes(Bytes::from_static(b"report")));
    }

    #[test]
    fn connect_after_shutdown_is_refused() {
        let (connection, _tracks) = Connection::new("ws://127.0.0.1:1/ws");
        connection.shutdown();
        connection.connect();
        assert!(!*connection.inner.desired.borrow());
    }
}
