//! Wire messages for the Mirage remote-rendering pipeline.
//!
//! This crate defines:
//! - [`DownMessage`] / [`FrameMeta`]: per-frame metadata the server attaches
//!   to the video stream (RTP header extension) and may also push on the
//!   data channel
//! - [`UpMessage`]: pose and frame-timing reports the client returns on the
//!   data channel
//! - the RTP header-extension constants both ends must agree on
//!
//! Everything is proto3-encoded via prost derive structs: unknown fields are
//! skipped on decode and absent fields take their defaults, which is what
//! gives the format its forward compatibility.

use bytes::Bytes;
use prost::Message;

/// Element id of the two-byte RTP header extension carrying a [`DownMessage`].
/// Must be in the [1,15] range allowed for locally-assigned ids.
pub const RTP_EXTENSION_ID: u8 = 1;

/// Maximum payload of a single two-byte header extension element.
pub const RTP_EXTENSION_MAX_LEN: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Vec3 {
    #[prost(float, tag = "1")]
    pub x: f32,
    #[prost(float, tag = "2")]
    pub y: f32,
    #[prost(float, tag = "3")]
    pub z: f32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Quat {
    #[prost(float, tag = "1")]
    pub w: f32,
    #[prost(float, tag = "2")]
    pub x: f32,
    #[prost(float, tag = "3")]
    pub y: f32,
    #[prost(float, tag = "4")]
    pub z: f32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Pose {
    #[prost(message, optional, tag = "1")]
    pub position: Option<Vec3>,
    #[prost(message, optional, tag = "2")]
    pub orientation: Option<Quat>,
}

/// Compositor blend mode hint. Values match the XR runtime's blend-mode
/// numbering so they can be forwarded without translation; `Unset` means
/// "client keeps its current mode".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EnvBlendMode {
    Unset = 0,
    Opaque = 1,
    Additive = 2,
    AlphaBlend = 3,
}

/// Per-frame record authored at the server where the render pose is latched.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrameMeta {
    /// Strictly monotonic per server session. Receivers must tolerate gaps.
    #[prost(int64, tag = "1")]
    pub frame_sequence_id: i64,
    /// Stereo view poses in the STAGE reference space the frame was
    /// rendered for. Zero or two entries.
    #[prost(message, repeated, tag = "2")]
    pub poses: Vec<Pose>,
    #[prost(enumeration = "EnvBlendMode", tag = "3")]
    pub env_blend_mode: i32,
    /// Only meaningful when `env_blend_mode == Additive`; in [0,1].
    #[prost(float, optional, tag = "4")]
    pub additive_black_threshold: Option<f32>,
}

impl FrameMeta {
    pub fn blend_mode(&self) -> EnvBlendMode {
        EnvBlendMode::try_from(self.env_blend_mode).unwrap_or(EnvBlendMode::Unset)
    }
}

/// Server-authored record injected into RTP extensions. Currently only
/// carries a [`FrameMeta`]; reserved for future per-frame control.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DownMessage {
    #[prost(message, optional, tag = "1")]
    pub frame: Option<FrameMeta>,
}

/// HMD viewSpace-in-worldSpace pose at the predicted display time.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackingReport {
    #[prost(message, optional, tag = "1")]
    pub pose: Option<Pose>,
}

/// Frame timing report. All times are in the XR time domain (nanoseconds).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrameTimingReport {
    #[prost(int64, tag = "1")]
    pub frame_sequence_id: i64,
    #[prost(int64, tag = "2")]
    pub decode_complete_time: i64,
    #[prost(int64, tag = "3")]
    pub begin_frame_time: i64,
    #[prost(int64, tag = "4")]
    pub display_time: i64,
}

/// Client-to-server record on the data channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpMessage {
    /// Monotonic, assigned at the client immediately before transmit.
    /// Independent of `frame_sequence_id`.
    #[prost(int64, tag = "1")]
    pub up_message_id: i64,
    #[prost(oneof = "up_message::Payload", tags = "2, 3")]
    pub payload: Option<up_message::Payload>,
}

pub mod up_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        Tracking(super::TrackingReport),
        #[prost(message, tag = "3")]
        Frame(super::FrameTimingReport),
    }
}

/// Raw encoding, used for the RTP header extension payload.
pub fn encode_down(msg: &DownMessage) -> Bytes {
    Bytes::from(msg.encode_to_vec())
}

pub fn decode_down(buf: &[u8]) -> Result<DownMessage, ProtoError> {
    Ok(DownMessage::decode(buf)?)
}

/// Length-delimited encoding, used on the data channel.
pub fn encode_up_framed(msg: &UpMessage) -> Bytes {
    Bytes::from(msg.encode_length_delimited_to_vec())
}

pub fn decode_up_framed(buf: &[u8]) -> Result<UpMessage, ProtoError> {
    Ok(UpMessage::decode_length_delimited(buf)?)
}

pub fn encode_down_framed(msg: &DownMessage) -> Bytes {
    Bytes::from(msg.encode_length_delimited_to_vec())
}

pub fn decode_down_framed(buf: &[u8]) -> Result<DownMessage, ProtoError> {
    Ok(DownMessage::decode_length_delimited(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_meta(seq: i64) -> FrameMeta {
        let pose = |x: f32| Pose {
            position: Some(Vec3 { x, y: 1.6, z: 0.0 }),
            orientation: Some(Quat {
                w: 1.0,
                x: 0.0,
                y: 0.0,
                z: 0.0,
            }),
        };
        FrameMeta {
            frame_sequence_id: seq,
            poses: vec![pose(-0.03), pose(0.03)],
            env_blend_mode: EnvBlendMode::Additive as i32,
            additive_black_threshold: Some(0.02),
        }
    }

    #[test]
    fn down_message_round_trips() {
        let msg = DownMessage {
            frame: Some(stereo_meta(42)),
        };
        let bytes = encode_down(&msg);
        let back = decode_down(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn frame_meta_fits_rtp_extension() {
        let msg = DownMessage {
            frame: Some(stereo_meta(i64::MAX)),
        };
        assert!(encode_down(&msg).len() <= RTP_EXTENSION_MAX_LEN);
    }

    #[test]
    fn unset_blend_mode_is_omitted_from_wire() {
        let msg = DownMessage {
            frame: Some(FrameMeta {
                frame_sequence_id: 1,
                poses: vec![],
                env_blend_mode: EnvBlendMode::Unset as i32,
                additive_black_threshold: None,
            }),
        };
        // Only the sequence id should hit the wire inside the nested frame.
        let bytes = encode_down(&msg);
        let back = decode_down(&bytes).unwrap();
        let frame = back.frame.unwrap();
        assert_eq!(frame.blend_mode(), EnvBlendMode::Unset);
        assert_eq!(frame.additive_black_threshold, None);
        assert!(bytes.len() < 8);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut bytes = encode_down(&DownMessage {
            frame: Some(stereo_meta(7)),
        })
        .to_vec();
        // Append an unknown varint field (tag 15) at the top level; a decoder
        // from a newer schema revision must ignore it.
        bytes.extend_from_slice(&[0x78, 0x2A]);
        let back = decode_down(&bytes).unwrap();
        assert_eq!(back.frame.unwrap().frame_sequence_id, 7);
    }

    #[test]
    fn up_message_oneof_round_trips() {
        let tracking = UpMessage {
            up_message_id: 1,
            payload: Some(up_message::Payload::Tracking(TrackingReport {
                pose: Some(Pose {
                    position: Some(Vec3 {
                        x: 0.0,
                        y: 1.6,
                        z: 0.0,
                    }),
                    orientation: Some(Quat {
                        w: 1.0,
                        x: 0.0,
                        y: 0.0,
                        z: 0.0,
                    }),
                }),
            })),
        };
        let frame = UpMessage {
            up_message_id: 2,
            payload: Some(up_message::Payload::Frame(FrameTimingReport {
                frame_sequence_id: 42,
                decode_complete_time: 111,
                begin_frame_time: 222,
                display_time: 333,
            })),
        };

        for msg in [tracking, frame] {
            let bytes = encode_up_framed(&msg);
            assert_eq!(decode_up_framed(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn framed_decode_rejects_truncation() {
        let bytes = encode_up_framed(&UpMessage {
            up_message_id: 9,
            payload: None,
        });
        assert!(decode_up_framed(&bytes[..bytes.len() - 1]).is_err());
    }
}
