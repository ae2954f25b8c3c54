//! Wire format between the client and the transport bridge.
//!
//! Server → client: `{type, data, echoedTimestamp?, echoedSequenceNumber?}`
//! with `type` one of `audio`, `transcript`, `control`, `error`.
//!
//! Client → server (text frames):
//! - `{"controlMessage": "start", "config": {...}}`
//! - `{"controlMessage": "stop" | "interrupt" | "pause" | "resume"}`
//! - `{"text": "...", "sequenceNumber"?: n, "timestamp"?: ms}`
//! - `{"audio": "<base64 PCM16>", "sequenceNumber"?: n, "timestamp"?: ms, "sampleRate"?: hz, "channels"?: n}`
//!
//! Binary frames carry raw PCM16 in the session's declared format.

use crate::audio::codec::{self, CodecError};
use crate::audio::EchoStamp;
use crate::session::model::{ControlEvent, ErrorInfo, SessionEvent, SessionOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Audio,
    Transcript,
    Control,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echoed_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echoed_sequence_number: Option<u64>,
}

impl WireEnvelope {
    fn new(kind: EnvelopeType, data: Value, echo: Option<EchoStamp>) -> Self {
        Self {
            kind,
            data,
            echoed_timestamp: echo.map(|e| e.timestamp),
            echoed_sequence_number: echo.map(|e| e.sequence_number),
        }
    }

    pub fn from_event(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Transcript { entry, echo } => Self::new(
                EnvelopeType::Transcript,
                serde_json::to_value(entry).unwrap_or(Value::Null),
                *echo,
            ),
            SessionEvent::Audio { chunk, echo } => Self::new(
                EnvelopeType::Audio,
                json!({
                    "audio": codec::to_base64(&chunk.payload),
                    "sampleRate": chunk.sample_rate,
                    "channels": chunk.channels,
                    "sequenceNumber": chunk.sequence_number,
                    "timestamp": chunk.capture_timestamp,
                }),
                *echo,
            ),
            SessionEvent::Control(ControlEvent::Error(info)) => Self::error(info, info.retryable),
            SessionEvent::Control(control) => Self::new(
                EnvelopeType::Control,
                serde_json::to_value(control).unwrap_or(Value::Null),
                None,
            ),
        }
    }

    /// An error envelope. `recoverable` marks errors that leave the channel open.
    pub fn error(info: &ErrorInfo, recoverable: bool) -> Self {
        let mut data = json!({
            "code": info.code,
            "message": info.message,
            "retryable": info.retryable,
        });
        if recoverable {
            data["recoverable"] = Value::Bool(true);
        }
        Self::new(EnvelopeType::Error, data, None)
    }
}

/// A decoded client text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Start(SessionOptions),
    Stop,
    Interrupt,
    Pause,
    Resume,
    Text {
        text: String,
        sequence_number: Option<u64>,
        timestamp: Option<i64>,
    },
    Audio {
        payload: Vec<u8>,
        sample_rate: Option<u32>,
        channels: Option<u16>,
        sequence_number: Option<u64>,
        timestamp: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message is not valid JSON: {0}")]
    Json(String),

    #[error("unknown control message '{0}'")]
    UnknownControl(String),

    #[error("message has no controlMessage, text or audio field")]
    UnknownShape,

    #[error(transparent)]
    Audio(#[from] CodecError),
}

impl EnvelopeError {
    pub fn code(&self) -> &'static str {
        match self {
            EnvelopeError::Json(_) | EnvelopeError::UnknownControl(_) | EnvelopeError::UnknownShape => "UNKNOWN_MESSAGE",
            EnvelopeError::Audio(_) => "INVALID_AUDIO",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClientMessage {
    control_message: Option<String>,
    config: Option<SessionOptions>,
    text: Option<String>,
    audio: Option<String>,
    sequence_number: Option<u64>,
    timestamp: Option<i64>,
    sample_rate: Option<u32>,
    channels: Option<u16>,
}

pub fn parse_client_message(raw: &str) -> Result<ClientMessage, EnvelopeError> {
    let message: RawClientMessage = serde_json::from_str(raw).map_err(|e| EnvelopeError::Json(e.to_string()))?;

    if let Some(control) = message.control_message {
        return match control.as_str() {
            "start" => Ok(ClientMessage::Start(message.config.unwrap_or_default())),
            "stop" => Ok(ClientMessage::Stop),
            "interrupt" => Ok(ClientMessage::Interrupt),
            "pause" => Ok(ClientMessage::Pause),
            "resume" => Ok(ClientMessage::Resume),
            _ => Err(EnvelopeError::UnknownControl(control)),
        };
    }

    if let Some(text) = message.text {
        return Ok(ClientMessage::Text {
            text,
            sequence_number: message.sequence_number,
            timestamp: message.timestamp,
        });
    }

    if let Some(audio) = message.audio {
        return Ok(ClientMessage::Audio {
            payload: codec::from_base64(&audio)?,
            sample_rate: message.sample_rate,
            channels: message.channels,
            sequence_number: message.sequence_number,
            timestamp: message.timestamp,
        });
    }

    Err(EnvelopeError::UnknownShape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioChunk;
    use crate::session::model::{Speaker, TranscriptEntry};

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(parse_client_message(r#"{"controlMessage": "stop"}"#), Ok(ClientMessage::Stop));
        assert_eq!(parse_client_message(r#"{"controlMessage": "interrupt"}"#), Ok(ClientMessage::Interrupt));
        assert_eq!(parse_client_message(r#"{"controlMessage": "pause"}"#), Ok(ClientMessage::Pause));

        let start = parse_client_message(r#"{"controlMessage": "start", "config": {"systemInstruction": "Ask about Rust", "sampleRate": 48000}}"#)
            .unwrap();
        match start {
            ClientMessage::Start(options) => {
                assert_eq!(options.system_instruction.as_deref(), Some("Ask about Rust"));
                assert_eq!(options.sample_rate, Some(48000));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            parse_client_message(r#"{"controlMessage": "start"}"#),
            Ok(ClientMessage::Start(SessionOptions::default()))
        );
    }

    #[test]
    fn test_parse_text_with_echo_fields() {
        let message = parse_client_message(r#"{"text": "hello", "sequenceNumber": 4, "timestamp": 1700000000000}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::Text {
                text: "hello".to_string(),
                sequence_number: Some(4),
                timestamp: Some(1_700_000_000_000),
            }
        );
    }

    #[test]
    fn test_parse_json_audio() {
        let pcm = codec::encode_pcm16(&[0.1, -0.1]);
        let raw = json!({ "audio": codec::to_base64(&pcm), "sampleRate": 44100 }).to_string();
        match parse_client_message(&raw).unwrap() {
            ClientMessage::Audio { payload, sample_rate, .. } => {
                assert_eq!(payload, pcm);
                assert_eq!(sample_rate, Some(44100));
            }
            other => panic!("unexpected {:?}", other),
        }

        let broken = parse_client_message(r#"{"audio": "%%%"}"#).unwrap_err();
        assert_eq!(broken.code(), "INVALID_AUDIO");
    }

    #[test]
    fn test_unknown_shapes_are_rejected() {
        assert_eq!(parse_client_message(r#"{"hello": 1}"#), Err(EnvelopeError::UnknownShape));
        assert!(matches!(
            parse_client_message(r#"{"controlMessage": "dance"}"#),
            Err(EnvelopeError::UnknownControl(_))
        ));
        assert!(matches!(parse_client_message("not json"), Err(EnvelopeError::Json(_))));
    }

    #[test]
    fn test_envelopes_from_events() {
        let echo = Some(EchoStamp { timestamp: 99, sequence_number: 5 });
        let transcript = WireEnvelope::from_event(&SessionEvent::Transcript {
            entry: TranscriptEntry::new(Speaker::User, "hi", true),
            echo,
        });
        let json = serde_json::to_value(&transcript).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["data"]["isFinal"], true);
        assert_eq!(json["echoedTimestamp"], 99);
        assert_eq!(json["echoedSequenceNumber"], 5);

        let audio = WireEnvelope::from_event(&SessionEvent::Audio {
            chunk: AudioChunk::new(vec![1, 0, 2, 0], 24000, 1, 3, 10),
            echo: None,
        });
        let json = serde_json::to_value(&audio).unwrap();
        assert_eq!(json["type"], "audio");
        assert_eq!(json["data"]["sampleRate"], 24000);
        assert!(json.get("echoedTimestamp").is_none());

        let ready = WireEnvelope::from_event(&SessionEvent::Control(ControlEvent::Ready));
        assert_eq!(ready.kind, EnvelopeType::Control);
        assert_eq!(ready.data["event"], "ready");

        let error = WireEnvelope::from_event(&SessionEvent::Control(ControlEvent::Error(ErrorInfo::new(
            "CONNECTION_TIMEOUT",
            "timed out",
            true,
        ))));
        assert_eq!(error.kind, EnvelopeType::Error);
        assert_eq!(error.data["retryable"], true);
        assert_eq!(error.data["recoverable"], true);

        let terminal = WireEnvelope::from_event(&SessionEvent::Control(ControlEvent::Error(ErrorInfo::new(
            "AUTH_REJECTED",
            "bad key",
            false,
        ))));
        assert_eq!(terminal.data["retryable"], false);
        assert!(terminal.data.get("recoverable").is_none());
    }
}
