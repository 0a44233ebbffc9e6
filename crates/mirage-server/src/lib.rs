//! Mirage streaming server.
//!
//! The server renders (or is fed) an encoded H.264 stream, stamps each
//! access unit with the pose metadata it was rendered for, and fans the
//! RTP stream out to one WebRTC peer per connected headset. Headsets
//! return pose and frame-timing telemetry on a data channel.

pub mod ingest;
pub mod peer;
pub mod pipeline;
pub mod record;
pub mod signal;
pub mod stamp;
