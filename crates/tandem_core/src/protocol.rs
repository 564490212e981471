//! Wire codec for the sync connection.
//!
//! One duplex connection carries two physical frame kinds:
//!
//! - **Binary** frames hold a raw yrs v1 update (a delta or a full
//!   snapshot). There is no envelope.
//! - **Text** frames hold a JSON object tagged by `type`:
//!
//! ```text
//! {"type":"awareness","participantId":"p1","state":{...}}
//! {"type":"presence","participants":[{"participantId":"p1","state":{...}}]}
//! {"type":"ping"}
//! {"type":"pong"}
//! ```
//!
//! Decoding dispatches on the physical kind first and never sniffs binary
//! content. Unknown `type` values decode to [`Frame::Unknown`] so newer
//! peers can add message kinds.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TandemError};
use crate::presence::{AwarenessState, PresenceEntry};

/// A frame as it arrives from, or is handed to, the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// JSON control messages carried in text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// A participant's full awareness state.
    #[serde(rename_all = "camelCase")]
    Awareness {
        participant_id: String,
        state: AwarenessState,
    },
    /// Full presence snapshot of a room. Receivers replace their view.
    Presence { participants: Vec<PresenceEntry> },
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// CRDT delta or snapshot bytes.
    Delta(Vec<u8>),
    Awareness {
        participant_id: String,
        state: AwarenessState,
    },
    Presence(Vec<PresenceEntry>),
    Ping,
    Pong,
    /// A control message of a type this build does not know.
    Unknown,
}

impl From<ControlMessage> for Frame {
    fn from(msg: ControlMessage) -> Self {
        match msg {
            ControlMessage::Awareness {
                participant_id,
                state,
            } => Frame::Awareness {
                participant_id,
                state,
            },
            ControlMessage::Presence { participants } => Frame::Presence(participants),
            ControlMessage::Ping => Frame::Ping,
            ControlMessage::Pong => Frame::Pong,
            ControlMessage::Unknown => Frame::Unknown,
        }
    }
}

impl Frame {
    /// Build an awareness frame from a participant's state.
    pub fn awareness(state: &AwarenessState) -> Self {
        Frame::Awareness {
            participant_id: state.participant_id.clone(),
            state: state.clone(),
        }
    }

    /// Encode for the transport.
    pub fn encode(&self) -> Result<RawFrame> {
        let msg = match self {
            Frame::Delta(bytes) => return Ok(RawFrame::Binary(bytes.clone())),
            Frame::Awareness {
                participant_id,
                state,
            } => ControlMessage::Awareness {
                participant_id: participant_id.clone(),
                state: state.clone(),
            },
            Frame::Presence(participants) => ControlMessage::Presence {
                participants: participants.clone(),
            },
            Frame::Ping => ControlMessage::Ping,
            Frame::Pong => ControlMessage::Pong,
            Frame::Unknown => {
                return Err(TandemError::InvalidOperation(
                    "cannot encode an unknown control message".to_string(),
                ));
            }
        };
        encode_control(&msg)
    }
}

/// Decode a frame by its physical kind.
///
/// # Errors
///
/// Returns [`TandemError::Decode`] for a text frame that is not a JSON
/// object with a `type` field. Binary frames are never inspected here.
pub fn decode_frame(raw: RawFrame) -> Result<Frame> {
    match raw {
        RawFrame::Binary(bytes) => Ok(Frame::Delta(bytes)),
        RawFrame::Text(text) => decode_control(&text).map(Frame::from),
    }
}

/// Decode the JSON body of a text frame.
pub fn decode_control(text: &str) -> Result<ControlMessage> {
    serde_json::from_str(text)
        .map_err(|e| TandemError::Decode(format!("Invalid control message: {}", e)))
}

/// Encode a control message as a text frame.
pub fn encode_control(msg: &ControlMessage) -> Result<RawFrame> {
    Ok(RawFrame::Text(serde_json::to_string(msg)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binary_frames_are_never_sniffed() {
        // Bytes that happen to spell a JSON ping are still a delta
        let bytes = br#"{"type":"ping"}"#.to_vec();
        let frame = decode_frame(RawFrame::Binary(bytes.clone())).unwrap();
        assert_eq!(frame, Frame::Delta(bytes));
    }

    #[test]
    fn test_decode_ping_and_pong() {
        let ping = decode_frame(RawFrame::Text(r#"{"type":"ping"}"#.into())).unwrap();
        assert_eq!(ping, Frame::Ping);
        let pong = decode_frame(RawFrame::Text(r#"{"type":"pong"}"#.into())).unwrap();
        assert_eq!(pong, Frame::Pong);
    }

    #[test]
    fn test_decode_awareness() {
        let text = json!({
            "type": "awareness",
            "participantId": "p1",
            "state": {
                "participantId": "p1",
                "displayName": "Pat",
                "color": "#ff0000",
                "cursor": {"index": 4}
            }
        })
        .to_string();
        let frame = decode_frame(RawFrame::Text(text)).unwrap();
        let Frame::Awareness {
            participant_id,
            state,
        } = frame
        else {
            panic!("expected awareness frame");
        };
        assert_eq!(participant_id, "p1");
        assert_eq!(state.display_name, "Pat");
        assert_eq!(state.cursor, Some(json!({"index": 4})));
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let frame =
            decode_frame(RawFrame::Text(r#"{"type":"drag_ghost","x":1}"#.into())).unwrap();
        assert_eq!(frame, Frame::Unknown);
    }

    #[test]
    fn test_malformed_text_is_decode_error() {
        for text in ["not json", r#"{"participantId":"p1"}"#, "[1,2]"] {
            let err = decode_frame(RawFrame::Text(text.into())).unwrap_err();
            assert!(matches!(err, TandemError::Decode(_)), "{text}: {err}");
        }
    }

    #[test]
    fn test_presence_wire_format() {
        let state = AwarenessState::new("p1", "Pat", "#fff");
        let frame = Frame::Presence(vec![PresenceEntry {
            participant_id: "p1".into(),
            state,
        }]);
        let RawFrame::Text(text) = frame.encode().unwrap() else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "presence");
        assert_eq!(value["participants"][0]["participantId"], "p1");
        assert_eq!(value["participants"][0]["state"]["displayName"], "Pat");
    }

    #[test]
    fn test_encode_ping() {
        assert_eq!(
            Frame::Ping.encode().unwrap(),
            RawFrame::Text(r#"{"type":"ping"}"#.into())
        );
        assert_eq!(
            Frame::Delta(vec![1, 2]).encode().unwrap(),
            RawFrame::Binary(vec![1, 2])
        );
        assert!(Frame::Unknown.encode().is_err());
    }
}
