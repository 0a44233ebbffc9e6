//! Signaling messages exchanged over the WebSocket between server and client.
//!
//! One WebSocket connection corresponds to one streaming client; the server
//! keys peers by the connection, so no addressing fields are needed on the
//! wire.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Server -> client: SDP offer for the send-only H.264 session.
    Offer { sdp: String },

    /// Client -> server: SDP answer.
    Answer { sdp: String },

    /// ICE candidate, either direction. An empty candidate string marks
    /// end-of-candidates and is ignored by receivers.
    Candidate { mline_index: u32, candidate: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_representation() {
        let msg = SignalMessage::Candidate {
            mline_index: 0,
            candidate: "candidate:1 1 UDP 2122252543 192.168.1.5 50000 typ host".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Candidate\""));
        let back: SignalMessage = serde_json::from_str(&json).unwrap();
        match back {
            SignalMessage::Candidate { mline_index, .. } => assert_eq!(mline_index, 0),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
