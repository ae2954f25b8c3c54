//! # Transport Bridge
//!
//! Connects one client channel (a WebSocket, or an SSE stream plus POSTs) to
//! the session orchestrator. The bridge owns the client's current session id,
//! dispatches inbound frames one at a time and pumps the session's events out
//! as wire envelopes.
//!
//! ## Channels:
//! - **websocket**: actix actor at `/ws/live`
//! - **sse**: `GET /api/v1/live/events` + `POST /api/v1/live/messages`

pub mod envelope;
pub mod sse;
pub mod websocket;

use crate::audio::{now_millis, AudioChunk, AudioFormat, EchoStamp};
use crate::session::model::{ErrorInfo, SessionEvent, SessionId, SessionOptions};
use crate::session::{OrchestratorError, SessionOrchestrator};
use actix_web::HttpRequest;
use async_trait::async_trait;
use envelope::{parse_client_message, ClientMessage, WireEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// How long a replaced session's pump may take to flush its last events.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client channel closed")]
pub struct ChannelClosed;

/// The server → client half of a transport.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    async fn send(&self, envelope: WireEnvelope) -> Result<(), ChannelClosed>;

    async fn close(&self, code: u16, reason: &str);
}

/// A raw frame received from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

struct BridgeState {
    session: Option<SessionId>,
    format: AudioFormat,
    next_sequence: u64,
    pump: Option<JoinHandle<()>>,
}

pub struct TransportBridge {
    orchestrator: SessionOrchestrator,
    owner_id: String,
    channel: Arc<dyn ClientChannel>,
    state: Mutex<BridgeState>,
}

impl TransportBridge {
    pub fn new(orchestrator: SessionOrchestrator, owner_id: impl Into<String>, channel: Arc<dyn ClientChannel>) -> Self {
        let format = orchestrator.settings().client_format;
        Self {
            orchestrator,
            owner_id: owner_id.into(),
            channel,
            state: Mutex::new(BridgeState {
                session: None,
                format,
                next_sequence: 1,
                pump: None,
            }),
        }
    }

    pub async fn current_session(&self) -> Option<SessionId> {
        self.state.lock().await.session.clone()
    }

    /// Dispatch inbound frames in arrival order until the client goes away
    /// or asks to stop, then end the client's session.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundFrame>) {
        while let Some(frame) = inbound.recv().await {
            if self.handle_inbound(frame).await == Flow::Close {
                self.channel.close(CLOSE_NORMAL, "session ended").await;
                break;
            }
        }
        self.shutdown().await;
    }

    pub async fn handle_inbound(&self, frame: InboundFrame) -> Flow {
        let mut state = self.state.lock().await;
        match frame {
            InboundFrame::Binary(payload) => {
                let format = state.format;
                self.forward_audio(&mut state, payload, format, None).await;
                Flow::Continue
            }
            InboundFrame::Text(raw) => match parse_client_message(&raw) {
                Ok(message) => self.dispatch(&mut state, message).await,
                Err(e) => {
                    debug!(owner_id = %self.owner_id, "Rejected client message: {}", e);
                    self.send_error(ErrorInfo::new(e.code(), e.to_string(), false), true).await;
                    Flow::Continue
                }
            },
        }
    }

    async fn dispatch(&self, state: &mut BridgeState, message: ClientMessage) -> Flow {
        match message {
            ClientMessage::Start(options) => {
                self.start(state, options).await;
                Flow::Continue
            }
            ClientMessage::Stop => {
                if let Some(id) = state.session.take() {
                    let _ = self.orchestrator.end_session(&id).await;
                }
                Flow::Close
            }
            ClientMessage::Interrupt => {
                if let Some(id) = state.session.clone() {
                    self.absorb(self.orchestrator.interrupt(&id).await).await;
                }
                Flow::Continue
            }
            ClientMessage::Pause => {
                if let Some(id) = state.session.clone() {
                    self.absorb(self.orchestrator.pause_session(&id).await).await;
                }
                Flow::Continue
            }
            ClientMessage::Resume => {
                if let Some(id) = state.session.clone() {
                    self.absorb(self.orchestrator.resume_session(&id).await).await;
                }
                Flow::Continue
            }
            ClientMessage::Text {
                text,
                sequence_number,
                timestamp,
            } => {
                let echo = if sequence_number.is_some() || timestamp.is_some() {
                    Some(EchoStamp {
                        timestamp: timestamp.unwrap_or_else(now_millis),
                        sequence_number: sequence_number.unwrap_or(0),
                    })
                } else {
                    None
                };
                match state.session.clone() {
                    Some(id) => self.absorb(self.orchestrator.send_text(&id, &text, echo).await).await,
                    None => self.no_session().await,
                }
                Flow::Continue
            }
            ClientMessage::Audio {
                payload,
                sample_rate,
                channels,
                timestamp,
                ..
            } => {
                let format = AudioFormat::new(
                    sample_rate.unwrap_or(state.format.sample_rate),
                    channels.unwrap_or(state.format.channels),
                );
                self.forward_audio(state, payload, format, timestamp).await;
                Flow::Continue
            }
        }
    }

    async fn start(&self, state: &mut BridgeState, options: SessionOptions) {
        let settings = self.orchestrator.settings();
        let format = AudioFormat::new(
            options.sample_rate.unwrap_or(settings.client_format.sample_rate),
            options.channels.unwrap_or(settings.client_format.channels),
        );

        let id = match self.orchestrator.start_session(&self.owner_id, options).await {
            Ok(id) => id,
            Err(e) => {
                warn!(owner_id = %self.owner_id, "Session start rejected: {}", e);
                let info = match e {
                    // A conflict is the owner's own prior session; the client may retry.
                    OrchestratorError::Conflict(_) => ErrorInfo::new("START_REJECTED", "previous session is still closing", true),
                    other => other.to_error_info(),
                };
                self.send_error(info, true).await;
                return;
            }
        };

        // Let the replaced session's final events reach the client first.
        if let Some(previous) = state.pump.take() {
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, previous).await.is_err() {
                debug!(owner_id = %self.owner_id, "Previous event pump still draining");
            }
        }

        let events = match self.orchestrator.take_events(&id) {
            Ok(events) => events,
            Err(e) => {
                warn!(session_id = %id, "Session ended before its events were attached: {}", e);
                return;
            }
        };
        state.pump = Some(tokio::spawn(pump(
            self.orchestrator.clone(),
            self.channel.clone(),
            id.clone(),
            events,
        )));
        state.session = Some(id.clone());
        state.format = format;
        state.next_sequence = 1;

        info!(session_id = %id, owner_id = %self.owner_id, "Connecting session");
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            // Failures reach the client as error events from the orchestrator.
            if let Err(e) = orchestrator.connect(&id).await {
                debug!(session_id = %id, "Connect did not complete: {}", e);
            }
        });
    }

    async fn forward_audio(&self, state: &mut BridgeState, payload: Vec<u8>, format: AudioFormat, timestamp: Option<i64>) {
        let Some(id) = state.session.clone() else {
            self.no_session().await;
            return;
        };
        let chunk = AudioChunk::new(
            payload,
            format.sample_rate,
            format.channels,
            state.next_sequence,
            timestamp.unwrap_or_else(now_millis),
        );
        state.next_sequence += 1;
        self.absorb(self.orchestrator.send_audio_chunk(&id, chunk).await).await;
    }

    /// Invalid-state errors are logged only; other failures go to the client
    /// as recoverable errors.
    async fn absorb(&self, result: Result<(), OrchestratorError>) {
        match result {
            Ok(()) => {}
            Err(e @ OrchestratorError::InvalidState { .. }) | Err(e @ OrchestratorError::NotFound(_)) => {
                debug!(owner_id = %self.owner_id, "Ignoring client request: {}", e);
            }
            Err(e) => self.send_error(e.to_error_info(), true).await,
        }
    }

    async fn no_session(&self) {
        self.send_error(
            ErrorInfo::new("NO_SESSION", "send a start control message first", false),
            true,
        )
        .await;
    }

    async fn send_error(&self, info: ErrorInfo, recoverable: bool) {
        let _ = self.channel.send(WireEnvelope::error(&info, recoverable)).await;
    }

    /// End the client's session. Called once the transport is gone.
    pub async fn shutdown(&self) {
        let session = self.state.lock().await.session.take();
        if let Some(id) = session {
            info!(session_id = %id, owner_id = %self.owner_id, "Client channel closed, ending session");
            let _ = self.orchestrator.end_session(&id).await;
        }
    }
}

/// Forward one session's events to the client. A failed write ends the session.
async fn pump(
    orchestrator: SessionOrchestrator,
    channel: Arc<dyn ClientChannel>,
    session_id: SessionId,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        if channel.send(WireEnvelope::from_event(&event)).await.is_err() {
            warn!(session_id = %session_id, "Client write failed, ending session");
            let _ = orchestrator.end_session(&session_id).await;
            return;
        }
    }
}

/// Owner identity from the `X-Owner-Id` header or the `owner_id` query parameter.
pub fn owner_id_from_request(req: &HttpRequest) -> Option<String> {
    let header = req
        .headers()
        .get("x-owner-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(owner) = header {
        return Some(owner.to_string());
    }

    actix_web::web::Query::<std::collections::HashMap<String, String>>::from_query(req.query_string())
        .ok()
        .and_then(|query| query.get("owner_id").cloned())
        .map(|owner| owner.trim().to_string())
        .filter(|owner| !owner.is_empty())
}

#[cfg(test)]
mod tests {
    use super::envelope::EnvelopeType;
    use super::*;
    use crate::audio::codec;
    use crate::endpoint::EndpointEvent;
    use crate::session::model::{Speaker, TranscriptEntry};
    use crate::session::{OrchestratorSettings, SessionStatus};
    use crate::testing::{CountingCaptureFactory, ReadyMode, RecordingChannel, RecordingTranscriptSink, ScriptedEndpoint};
    use actix_web::test::TestRequest;

    struct Harness {
        bridge: Arc<TransportBridge>,
        orchestrator: SessionOrchestrator,
        endpoint: Arc<ScriptedEndpoint>,
        channel: Arc<RecordingChannel>,
    }

    fn harness() -> Harness {
        let endpoint = Arc::new(ScriptedEndpoint::new(ReadyMode::Immediate));
        let orchestrator = SessionOrchestrator::new(
            OrchestratorSettings::default(),
            endpoint.clone(),
            Arc::new(CountingCaptureFactory::default()),
            Arc::new(RecordingTranscriptSink::default()),
        );
        let channel = Arc::new(RecordingChannel::default());
        let bridge = Arc::new(TransportBridge::new(orchestrator.clone(), "owner-1", channel.clone()));
        Harness {
            bridge,
            orchestrator,
            endpoint,
            channel,
        }
    }

    async fn start(h: &Harness) -> SessionId {
        let flow = h
            .bridge
            .handle_inbound(InboundFrame::Text(r#"{"controlMessage": "start"}"#.to_string()))
            .await;
        assert_eq!(flow, Flow::Continue);
        let id = h.bridge.current_session().await.expect("session");
        for _ in 0..50 {
            if h.orchestrator.get_status(&id).ok() == Some(SessionStatus::Active) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        id
    }

    #[tokio::test]
    async fn test_start_delivers_ready_envelope() {
        let h = harness();
        start(&h).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = h.channel.envelopes();
        assert_eq!(sent[0].kind, EnvelopeType::Control);
        assert_eq!(sent[0].data["event"], "ready");
    }

    #[tokio::test]
    async fn test_events_reach_client_in_order() {
        let h = harness();
        start(&h).await;

        for text in ["A", "B", "C"] {
            h.endpoint.inject(EndpointEvent::Transcript {
                entry: TranscriptEntry::new(Speaker::Assistant, text, true),
                echo: None,
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let texts: Vec<String> = h
            .channel
            .envelopes()
            .into_iter()
            .filter(|e| e.kind == EnvelopeType::Transcript)
            .filter_map(|e| e.data["text"].as_str().map(str::to_string))
            .collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_text_echo_fields_round_trip() {
        let h = harness();
        start(&h).await;

        h.bridge
            .handle_inbound(InboundFrame::Text(
                r#"{"text": "What is ownership?", "sequenceNumber": 12, "timestamp": 1700000000123}"#.to_string(),
            ))
            .await;
        let echo = h.endpoint.last_text_echo();
        assert_eq!(echo, Some(EchoStamp { timestamp: 1_700_000_000_123, sequence_number: 12 }));

        h.endpoint.inject(EndpointEvent::Transcript {
            entry: TranscriptEntry::new(Speaker::Assistant, "Ownership is...", true),
            echo,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let transcript = h
            .channel
            .envelopes()
            .into_iter()
            .find(|e| e.kind == EnvelopeType::Transcript)
            .expect("transcript envelope");
        assert_eq!(transcript.echoed_sequence_number, Some(12));
        assert_eq!(transcript.echoed_timestamp, Some(1_700_000_000_123));
    }

    #[tokio::test]
    async fn test_unknown_message_keeps_channel_open() {
        let h = harness();
        let flow = h.bridge.handle_inbound(InboundFrame::Text(r#"{"foo": "bar"}"#.to_string())).await;
        assert_eq!(flow, Flow::Continue);

        let sent = h.channel.envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeType::Error);
        assert_eq!(sent[0].data["recoverable"], true);
        assert!(h.channel.closed_with().is_none());
    }

    #[tokio::test]
    async fn test_binary_audio_reaches_endpoint() {
        let h = harness();
        start(&h).await;

        let pcm = codec::encode_pcm16(&vec![0.2; 1600]);
        h.bridge.handle_inbound(InboundFrame::Binary(pcm)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.endpoint.sent_audio().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_ends_session_and_closes_normally() {
        let h = harness();
        let id = start(&h).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(h.bridge.clone().run(rx));
        tx.send(InboundFrame::Text(r#"{"controlMessage": "stop"}"#.to_string())).unwrap();
        runner.await.unwrap();

        assert_eq!(h.orchestrator.get_status(&id).unwrap(), SessionStatus::Closed);
        assert_eq!(h.channel.closed_with(), Some(CLOSE_NORMAL));
    }

    #[tokio::test]
    async fn test_write_failure_ends_session() {
        let h = harness();
        let id = start(&h).await;

        h.channel.fail_writes();
        h.endpoint.inject(EndpointEvent::TurnComplete);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.orchestrator.get_status(&id).unwrap(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_channel_drop_ends_session() {
        let h = harness();
        let id = start(&h).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(h.bridge.clone().run(rx));
        drop(tx);
        runner.await.unwrap();

        assert_eq!(h.orchestrator.get_status(&id).unwrap(), SessionStatus::Closed);
        assert!(h.channel.closed_with().is_none());
    }

    #[test]
    fn test_owner_id_from_header_or_query() {
        let req = TestRequest::default().insert_header(("X-Owner-Id", "user-42")).to_http_request();
        assert_eq!(owner_id_from_request(&req).as_deref(), Some("user-42"));

        let req = TestRequest::with_uri("/ws/live?owner_id=user-7").to_http_request();
        assert_eq!(owner_id_from_request(&req).as_deref(), Some("user-7"));

        let req = TestRequest::with_uri("/ws/live").to_http_request();
        assert!(owner_id_from_request(&req).is_none());
    }
}
