//! Encoded-video fan-out pipeline.
//!
//! One [`VideoPipeline`] per server. Each pushed frame:
//! 1. latches the next `frame_sequence_id` and publishes the frame's
//!    [`DownMessage`] snapshot for the stamper,
//! 2. optionally forks to the debug recorder,
//! 3. is payloaded into RTP packets (marker set on the access unit's last
//!    packet), stamped, and written to every connected peer branch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng as _;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use mirage_common::{Error, Result};
use mirage_proto::{DownMessage, EnvBlendMode, FrameMeta, Pose, RTP_EXTENSION_ID};

use crate::record::DebugRecorder;
use crate::signal::ClientId;
use crate::stamp::{DownMessageSlot, RtpStamper};

/// Conservative RTP MTU.
pub const RTP_MTU: usize = 1200;

/// H.264 RTP clock rate, always 90 kHz.
pub const H264_CLOCK_RATE: u32 = 90_000;

/// One encoded frame handed to the pipeline by the render side, together
/// with the metadata latched at render time.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    /// Annex-B access unit.
    pub access_unit: Bytes,
    /// Stereo view poses the frame was rendered for.
    pub poses: Vec<Pose>,
    pub env_blend_mode: EnvBlendMode,
    pub additive_black_threshold: Option<f32>,
    pub keyframe: bool,
}

/// Fan-out point duplicating the stamped RTP stream to one branch per
/// connected client peer.
#[derive(Default)]
pub struct FanOut {
    branches: RwLock<HashMap<ClientId, Arc<TrackLocalStaticRTP>>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_branch(&self, id: ClientId, track: Arc<TrackLocalStaticRTP>) {
        self.branches.write().await.insert(id, track);
    }

    /// Detach a branch. After this returns, no in-flight packet write can
    /// reach the branch's track, so the owning peer is safe to dismantle.
    pub async fn remove_branch(&self, id: ClientId) {
        self.branches.write().await.remove(&id);
    }

    pub async fn branch_count(&self) -> usize {
        self.branches.read().await.len()
    }

    async fn write(&self, packet: &Packet) {
        let branches = self.branches.read().await;
        for (id, track) in branches.iter() {
            if let Err(err) = track.write_rtp(packet).await {
                // A failing branch must never stall the pipeline; the peer
                // teardown path will reap it.
                debug!(client = id, %err, "branch write failed");
            }
        }
    }
}

pub struct VideoPipeline {
    payloader: H264Payloader,
    slot: Arc<DownMessageSlot>,
    stamper: RtpStamper,
    fanout: Arc<FanOut>,
    recorder: Option<DebugRecorder>,
    sequence_number: u16,
    ssrc: u32,
    epoch: Instant,
    frame_sequence_id: i64,
}

impl VideoPipeline {
    pub fn new(
        slot: Arc<DownMessageSlot>,
        fanout: Arc<FanOut>,
        recorder: Option<DebugRecorder>,
    ) -> Self {
        Self {
            payloader: H264Payloader::default(),
            slot,
            stamper: RtpStamper::new(RTP_EXTENSION_ID),
            fanout,
            recorder,
            sequence_number: rand::thread_rng().gen(),
            ssrc: rand::thread_rng().gen(),
            epoch: Instant::now(),
            frame_sequence_id: 0,
        }
    }

    /// Publish a DownMessage snapshot without pushing video. Exposed for
    /// render sides that author metadata off the frame path.
    pub fn set_down_msg(&self, msg: &DownMessage) {
        self.slot.publish_message(msg);
    }

    /// Push one rendered access unit through stamp and fan-out.
    pub async fn push_frame(&mut self, frame: RenderedFrame) -> Result<()> {
        self.frame_sequence_id += 1;

        let meta = FrameMeta {
            frame_sequence_id: self.frame_sequence_id,
            poses: frame.poses.clone(),
            env_blend_mode: frame.env_blend_mode as i32,
            additive_black_threshold: frame.additive_black_threshold,
        };
        self.slot.publish_message(&DownMessage { frame: Some(meta) });

        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(err) = recorder.write_frame(&frame.access_unit, frame.keyframe) {
                warn!(%err, "debug recorder write failed");
            }
        }

        let packets = self.packetize(&frame.access_unit)?;
        for packet in &packets {
            self.fanout.write(packet).await;
        }
        Ok(())
    }

    /// Payload one access unit and stamp the marker packet.
    fn packetize(&mut self, access_unit: &Bytes) -> Result<Vec<Packet>> {
        let payloads = self
            .payloader
            .payload(RTP_MTU, access_unit)
            .map_err(Error::pipeline)?;

        let timestamp = self.rtp_timestamp();
        let count = payloads.len();
        let mut packets = Vec::with_capacity(count);
        for (i, payload) in payloads.into_iter().enumerate() {
            let mut header = Header {
                version: 2,
                payload_type: 96,
                sequence_number: self.sequence_number,
                timestamp,
                ssrc: self.ssrc,
                marker: i + 1 == count,
                ..Default::default()
            };
            self.sequence_number = self.sequence_number.wrapping_add(1);
            self.stamper.stamp(&mut header, &self.slot);
            packets.push(Packet { header, payload });
        }
        Ok(packets)
    }

    fn rtp_timestamp(&self) -> u32 {
        let elapsed = self.epoch.elapsed().as_secs_f64();
        (elapsed * f64::from(H264_CLOCK_RATE)) as u32
    }
}
