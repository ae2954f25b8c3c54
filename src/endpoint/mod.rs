//! # Conversational Endpoint
//!
//! The boundary to the external generative-AI streaming service. One
//! [`EndpointClient`] is one logical connection: audio and text go out,
//! transcripts, audio and control signals come back on a typed channel.
//!
//! ## Guarantees:
//! - `connect` returns once the transport is up and the setup message is sent;
//!   `EndpointEvent::Ready` follows on the event channel when the service
//!   acknowledges the setup
//! - inbound audio and transcript events echo the stamp of the most recent
//!   outbound message
//! - no event is delivered after `disconnect` returns
//! - a dropped connection is reported, never silently re-established

pub mod live;

use crate::audio::{AudioChunk, EchoStamp};
use crate::session::model::TranscriptEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub use live::LiveEndpoint;

/// Whether a failure is worth retrying from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, reset or server overload
    Transient,
    /// Rejected credentials, quota, protocol violation or bad configuration
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EndpointError {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl EndpointError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn terminal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Terminal,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Everything needed to open one endpoint connection.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub system_instruction: String,
    /// Passed through to the service untouched
    pub generation_config: serde_json::Value,
    pub voice: Option<String>,
    /// Rate of the PCM16 audio sent to the service
    pub input_sample_rate: u32,
    /// Rate assumed for service audio that does not declare one
    pub output_sample_rate: u32,
}

/// Events produced by an endpoint connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    Ready,
    Transcript {
        entry: TranscriptEntry,
        echo: Option<EchoStamp>,
    },
    Audio {
        /// Little-endian PCM16 mono
        pcm: Vec<u8>,
        sample_rate: u32,
        echo: Option<EchoStamp>,
    },
    Interrupted,
    TurnComplete,
    Error(EndpointError),
    Disconnected,
}

/// An open connection plus its event stream.
pub struct EndpointSession {
    pub client: Arc<dyn EndpointClient>,
    pub events: mpsc::Receiver<EndpointEvent>,
}

/// Opens connections to a conversational endpoint.
#[async_trait]
pub trait ConversationalEndpoint: Send + Sync {
    async fn connect(&self, config: &EndpointConfig) -> Result<EndpointSession, EndpointError>;
}

/// The outbound half of an open endpoint connection.
#[async_trait]
pub trait EndpointClient: Send + Sync {
    /// Queue one chunk of PCM16 audio. Awaits while the transport is backed up.
    async fn send_audio(&self, chunk: &AudioChunk) -> Result<(), EndpointError>;

    async fn send_text(&self, text: &str, echo: Option<EchoStamp>) -> Result<(), EndpointError>;

    /// Ask the service to stop its current response. The connection stays open.
    async fn interrupt(&self) -> Result<(), EndpointError>;

    /// Close the connection. Safe to call more than once.
    async fn disconnect(&self);
}

/// Remembers the stamp of the latest outbound message for echoing.
#[derive(Debug, Default)]
pub struct EchoTracker {
    last: Mutex<Option<EchoStamp>>,
}

impl EchoTracker {
    pub fn record(&self, stamp: Option<EchoStamp>) {
        if let Ok(mut last) = self.last.lock() {
            *last = stamp;
        }
    }

    pub fn current(&self) -> Option<EchoStamp> {
        self.last.lock().ok().and_then(|last| *last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let timeout = EndpointError::transient("CONNECTION_TIMEOUT", "no handshake");
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "CONNECTION_TIMEOUT: no handshake");

        let auth = EndpointError::terminal("AUTH_REJECTED", "401");
        assert!(!auth.is_retryable());
    }

    #[test]
    fn test_echo_tracker_keeps_latest_stamp() {
        let tracker = EchoTracker::default();
        assert_eq!(tracker.current(), None);

        tracker.record(Some(EchoStamp { timestamp: 10, sequence_number: 1 }));
        tracker.record(Some(EchoStamp { timestamp: 20, sequence_number: 2 }));
        assert_eq!(tracker.current().map(|s| s.sequence_number), Some(2));

        tracker.record(None);
        assert_eq!(tracker.current(), None);
    }
}
