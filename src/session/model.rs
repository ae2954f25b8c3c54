//! # Session Data Model
//!
//! Types shared by the orchestrator, the endpoint client and the transport
//! bridge: the session row, its status machine, transcript entries, control
//! events and the per-session event stream.
//!
//! ## Session Lifecycle:
//! 1. **Initializing**: row created, no resources yet
//! 2. **Connecting**: endpoint handshake in flight
//! 3. **Active**: audio and text flow both ways
//! 4. **Paused**: connection kept, inbound capture dropped
//! 5. **Ending**: teardown in progress
//! 6. **Closed**: resources released, row evicted
//! 7. **Failed**: terminal, reachable from any non-terminal state

use crate::audio::{AudioChunk, EchoStamp};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Connecting,
    Active,
    Paused,
    Ending,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ending => "ending",
            SessionStatus::Closed => "closed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Initializing, Connecting) => true,
            (Connecting, Active) => true,
            (Active, Paused) | (Paused, Active) => true,
            (Initializing | Connecting | Active | Paused, Ending) => true,
            (Ending, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator's row for one interview session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub owner_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, owner_id: String, ttl: ChronoDuration) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            status: SessionStatus::Initializing,
            created_at: now,
            expires_at: now + ttl,
            last_activity_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Whether the session outlived its TTL or sat idle longer than `idle`.
    pub fn is_stale(&self, now: DateTime<Utc>, idle: ChronoDuration) -> bool {
        now >= self.expires_at || now - self.last_activity_at >= idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// One line of the conversation. Partial entries may be superseded by later
/// ones; merging partials is left to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
    pub timestamp: i64,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, text: impl Into<String>, is_final: bool) -> Self {
        Self {
            speaker,
            text: text.into(),
            is_final,
            timestamp: crate::audio::now_millis(),
        }
    }
}

/// Error payload delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }
}

/// Control signals flowing from the orchestrator to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    Ready,
    Interrupt,
    Stop,
    TurnComplete,
    Status { status: SessionStatus },
    Error(ErrorInfo),
}

/// Everything a session emits toward its transport bridge, in production order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Transcript {
        entry: TranscriptEntry,
        echo: Option<EchoStamp>,
    },
    Audio {
        chunk: AudioChunk,
        echo: Option<EchoStamp>,
    },
    Control(ControlEvent),
}

/// Per-session overrides a client may send with its start request. Unset
/// fields fall back to the server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    pub model: Option<String>,
    pub system_instruction: Option<String>,
    pub generation_config: Option<serde_json::Value>,
    /// Rate of the PCM16 audio the client will send
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Rate the client wants to receive playback audio at
    pub playback_sample_rate: Option<u32>,
}

/// Read-only view returned by the session listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub transcript_entries: usize,
}

/// What the orchestrator hands to persistence when a session is torn down.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedSession {
    pub session: Session,
    pub ended_at: DateTime<Utc>,
    pub transcript: Vec<TranscriptEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;
        assert!(Initializing.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Ending));
        assert!(Ending.can_transition_to(Closed));
        assert!(Connecting.can_transition_to(Failed));

        assert!(!Initializing.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Ending));
        assert!(!Ending.can_transition_to(Active));
    }

    #[test]
    fn test_control_event_serialization() {
        let json = serde_json::to_value(ControlEvent::Ready).unwrap();
        assert_eq!(json, serde_json::json!({"event": "ready"}));

        let json = serde_json::to_value(ControlEvent::Error(ErrorInfo::new("CONNECTION_TIMEOUT", "timed out", true))).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["code"], "CONNECTION_TIMEOUT");
        assert_eq!(json["retryable"], true);

        let json = serde_json::to_value(ControlEvent::Status { status: SessionStatus::Paused }).unwrap();
        assert_eq!(json["status"], "paused");
    }

    #[test]
    fn test_session_staleness() {
        let session = Session::new("s1".into(), "u1".into(), ChronoDuration::minutes(30));
        let now = Utc::now();
        assert!(!session.is_stale(now, ChronoDuration::minutes(5)));
        assert!(session.is_stale(now + ChronoDuration::minutes(6), ChronoDuration::minutes(5)));
        assert!(session.is_stale(now + ChronoDuration::minutes(31), ChronoDuration::hours(1)));
    }

    #[test]
    fn test_session_options_accept_camel_case() {
        let options: SessionOptions =
            serde_json::from_str(r#"{"systemInstruction": "You are an interviewer", "sampleRate": 48000}"#).unwrap();
        assert_eq!(options.system_instruction.as_deref(), Some("You are an interviewer"));
        assert_eq!(options.sample_rate, Some(48000));
        assert!(options.model.is_none());
    }
}
