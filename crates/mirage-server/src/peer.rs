//! Per-client WebRTC peer lifecycle.
//!
//! One peer per connected signaling client: a send-only H.264 transceiver
//! fed from the pipeline fan-out, plus a reliable ordered data channel
//! named `"channel"` carrying the client's pose and frame-timing reports
//! back to the tracking sink.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use mirage_proto::UpMessage;

use crate::pipeline::{FanOut, H264_CLOCK_RATE};
use crate::signal::{ClientId, SignalingEvent, SignalingHandle};

/// Name of the reliable ordered channel carrying UpMessages.
pub const DATA_CHANNEL_LABEL: &str = "channel";

const DATA_CHANNEL_GREETING: &str = "Hi! from the Mirage server";

/// H.264 capability both ends negotiate: payload 96, packetization-mode 1,
/// constrained baseline 3.1.
pub fn h264_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_owned(),
        rtcp_feedback: vec![],
    }
}

/// Media engine with exactly one video codec: H.264 at payload type 96.
pub fn build_media_engine() -> webrtc::error::Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: h264_codec_capability(),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    Ok(media_engine)
}

struct ClientPeer {
    pc: Arc<RTCPeerConnection>,
    _data_channel: Arc<RTCDataChannel>,
}

pub struct PeerManager {
    api: API,
    peers: HashMap<ClientId, ClientPeer>,
    signaling: SignalingHandle,
    fanout: Arc<FanOut>,
    tracking: mpsc::UnboundedSender<UpMessage>,
}

impl PeerManager {
    pub fn new(
        signaling: SignalingHandle,
        fanout: Arc<FanOut>,
        tracking: mpsc::UnboundedSender<UpMessage>,
    ) -> webrtc::error::Result<Self> {
        let api = APIBuilder::new()
            .with_media_engine(build_media_engine()?)
            .build();
        Ok(Self {
            api,
            peers: HashMap::new(),
            signaling,
            fanout,
            tracking,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub async fn handle_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::ClientConnected(id) => {
                if let Err(err) = self.add_client(id).await {
                    error!(client = id, %err, "failed to create peer");
                    self.remove_client(id).await;
                }
            }
            SignalingEvent::ClientDisconnected(id) => {
                self.remove_client(id).await;
            }
            SignalingEvent::Answer { client_id, sdp } => {
                self.apply_answer(client_id, sdp).await;
            }
            SignalingEvent::Candidate {
                client_id,
                mline_index,
                candidate,
            } => {
                self.apply_candidate(client_id, mline_index, candidate).await;
            }
        }
    }

    async fn add_client(&mut self, id: ClientId) -> webrtc::error::Result<()> {
        info!(client = id, "creating peer");

        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration::default())
                .await?,
        );

        // The data channel is created before media negotiation so it rides
        // the first offer.
        let data_channel = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        self.wire_data_channel(id, &data_channel);

        let track = Arc::new(TrackLocalStaticRTP::new(
            h264_codec_capability(),
            "video".to_owned(),
            "mirage".to_owned(),
        ));
        pc.add_transceiver_from_track(
            Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        let signaling = self.signaling.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let signaling = signaling.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let mline = u32::from(init.sdp_mline_index.unwrap_or(0));
                            if !signaling.send_candidate(id, mline, init.candidate).await {
                                debug!(client = id, "candidate not delivered");
                            }
                        }
                        Err(err) => warn!(client = id, %err, "candidate serialization failed"),
                    }
                }
            })
        }));

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        if !self.signaling.send_offer(id, offer.sdp).await {
            warn!(client = id, "offer not delivered");
        }

        // Link the fan-out branch only after the offer exists, so no packet
        // can reach a peer that has not started negotiating.
        self.fanout.add_branch(id, track).await;

        self.peers.insert(
            id,
            ClientPeer {
                pc,
                _data_channel: data_channel,
            },
        );
        Ok(())
    }

    fn wire_data_channel(&self, id: ClientId, data_channel: &Arc<RTCDataChannel>) {
        let dc = Arc::clone(data_channel);
        data_channel.on_open(Box::new(move || {
            info!(client = id, "data channel open");
            let dc = Arc::clone(&dc);
            Box::pin(async move {
                if let Err(err) = dc.send_text(DATA_CHANNEL_GREETING).await {
                    debug!(client = id, %err, "greeting not sent");
                }
            })
        }));

        data_channel.on_close(Box::new(move || {
            info!(client = id, "data channel closed");
            Box::pin(async {})
        }));

        data_channel.on_error(Box::new(move |err| {
            warn!(client = id, %err, "data channel error");
            Box::pin(async {})
        }));

        let tracking = self.tracking.clone();
        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let tracking = tracking.clone();
            Box::pin(async move {
                if msg.is_string {
                    info!(
                        client = id,
                        "data channel message: {}",
                        String::from_utf8_lossy(&msg.data)
                    );
                    return;
                }
                match mirage_proto::decode_up_framed(&msg.data) {
                    Ok(up) => {
                        let _ = tracking.send(up);
                    }
                    Err(err) => warn!(client = id, %err, "undecodable up message dropped"),
                }
            })
        }));
    }

    async fn apply_answer(&mut self, id: ClientId, sdp: String) {
        let Some(peer) = self.peers.get(&id) else {
            warn!(client = id, "answer for unknown peer");
            return;
        };
        let desc = match RTCSessionDescription::answer(sdp) {
            Ok(desc) => desc,
            Err(err) => {
                // The peer stays registered; a later disconnect still
                // removes it cleanly.
                error!(client = id, %err, "error parsing SDP answer");
                return;
            }
        };
        if let Err(err) = peer.pc.set_remote_description(desc).await {
            error!(client = id, %err, "failed to apply SDP answer");
        }
    }

    async fn apply_candidate(&mut self, id: ClientId, mline_index: u32, candidate: String) {
        if candidate.is_empty() {
            return;
        }
        let Some(peer) = self.peers.get(&id) else {
            warn!(client = id, "candidate for unknown peer");
            return;
        };
        debug!(client = id, %candidate, "remote candidate");
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mline_index: Some(mline_index as u16),
            ..Default::default()
        };
        if let Err(err) = peer.pc.add_ice_candidate(init).await {
            warn!(client = id, %err, "failed to add ICE candidate");
        }
    }

    async fn remove_client(&mut self, id: ClientId) {
        // Detach the fan-out branch first: once this returns, no in-flight
        // frame write can reach the peer being dismantled.
        self.fanout.remove_branch(id).await;
        if let Some(peer) = self.peers.remove(&id) {
            info!(client = id, "removing peer");
            if let Err(err) = peer.pc.close().await {
                warn!(client = id, %err, "error closing peer");
            }
        }
    }
}
