//! Per-packet stamping of the published [`DownMessage`] into an RTP
//! header extension.
//!
//! The render side publishes the encoded DownMessage through
//! [`DownMessageSlot::publish`]; the stamper consults the snapshot on the
//! packet path and appends it as a two-byte header extension to every
//! packet whose marker bit is set. The marker denotes the last packet of
//! an access unit, so a receiver that observes any complete frame observes
//! exactly one metadata record.

use std::sync::Mutex;

use bytes::Bytes;
use tracing::warn;
use webrtc::rtp::header::{Header, EXTENSION_PROFILE_TWO_BYTE};

use mirage_proto::{DownMessage, RTP_EXTENSION_MAX_LEN};

/// Published DownMessage bytes, swapped atomically by the render side.
///
/// Readers clone the refcounted buffer, so a buffer being replaced stays
/// alive until the last concurrent reader drops its clone.
#[derive(Default)]
pub struct DownMessageSlot {
    current: Mutex<Option<Bytes>>,
}

impl DownMessageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published bytes. May be called from any thread.
    pub fn publish(&self, bytes: Bytes) {
        *self.current.lock().expect("down-message slot poisoned") = Some(bytes);
    }

    /// Encode and publish a [`DownMessage`].
    pub fn publish_message(&self, msg: &DownMessage) {
        self.publish(mirage_proto::encode_down(msg));
    }

    pub fn snapshot(&self) -> Option<Bytes> {
        self.current.lock().expect("down-message slot poisoned").clone()
    }
}

/// Appends the current DownMessage snapshot to marker packets.
pub struct RtpStamper {
    extension_id: u8,
}

impl RtpStamper {
    pub fn new(extension_id: u8) -> Self {
        debug_assert!((1..=15).contains(&extension_id));
        Self { extension_id }
    }

    /// Stamp one outgoing packet header. Packets are never dropped: on a
    /// clear marker bit, an oversize snapshot, or an extension failure the
    /// header passes through unmodified.
    pub fn stamp(&self, header: &mut Header, slot: &DownMessageSlot) {
        if !header.marker {
            return;
        }

        let Some(bytes) = slot.snapshot() else {
            return;
        };

        if bytes.len() > RTP_EXTENSION_MAX_LEN {
            warn!(
                size = bytes.len(),
                max = RTP_EXTENSION_MAX_LEN,
                "down message too large for a single RTP extension element, \
                 passing packet through unstamped"
            );
            return;
        }

        // Force the two-byte form; the one-byte form caps elements at 16
        // bytes, which a stereo pose record exceeds.
        header.extension = true;
        header.extension_profile = EXTENSION_PROFILE_TWO_BYTE;
        if let Err(err) = header.set_extension(self.extension_id, bytes) {
            warn!(%err, "failed to add RTP header extension");
        }
    }
}
