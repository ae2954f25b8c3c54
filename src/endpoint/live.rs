//! Live endpoint client: JSON over a WebSocket in the Gemini Live shape.
//!
//! Outbound: one `setup` message, then `realtimeInput` audio chunks and
//! `clientContent` text turns. Inbound: `setupComplete`, then `serverContent`
//! carrying model audio, transcriptions, `interrupted` and `turnComplete`.

use super::{
    ConversationalEndpoint, EchoTracker, EndpointClient, EndpointConfig, EndpointError, EndpointEvent, EndpointSession,
};
use crate::audio::codec;
use crate::audio::{AudioChunk, EchoStamp};
use crate::session::model::{Speaker, TranscriptEntry};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connector for the live endpoint.
#[derive(Debug, Clone)]
pub struct LiveEndpoint {
    event_buffer: usize,
}

impl LiveEndpoint {
    pub fn new(event_buffer: usize) -> Self {
        Self {
            event_buffer: event_buffer.max(1),
        }
    }
}

#[async_trait]
impl ConversationalEndpoint for LiveEndpoint {
    async fn connect(&self, config: &EndpointConfig) -> Result<EndpointSession, EndpointError> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| EndpointError::terminal("INVALID_URL", e.to_string()))?;
        if !config.api_key.is_empty() {
            let key = HeaderValue::from_str(&config.api_key)
                .map_err(|_| EndpointError::terminal("INVALID_CONFIG", "API key is not a valid header value"))?;
            request.headers_mut().insert("x-goog-api-key", key);
        }

        debug!(url = %config.url, model = %config.model, "Connecting to live endpoint");
        let (stream, _) = connect_async(request).await.map_err(classify_ws_error)?;
        let (mut sink, stream) = stream.split();

        sink.send(Message::Text(setup_message(config).to_string()))
            .await
            .map_err(classify_ws_error)?;

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let echo = Arc::new(EchoTracker::default());
        let parser = ServerMessageParser::new(echo.clone(), config.output_sample_rate);
        let reader = tokio::spawn(read_loop(stream, tx, parser));

        info!(model = %config.model, "Live endpoint connected, setup sent");
        let client = LiveClient {
            sink: AsyncMutex::new(sink),
            echo,
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        };
        Ok(EndpointSession {
            client: Arc::new(client),
            events: rx,
        })
    }
}

struct LiveClient {
    sink: AsyncMutex<WsSink>,
    echo: Arc<EchoTracker>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LiveClient {
    async fn send_json(&self, message: Value) -> Result<(), EndpointError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EndpointError::terminal("DISCONNECTED", "endpoint connection is closed"));
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(message.to_string()))
            .await
            .map_err(classify_ws_error)
    }
}

#[async_trait]
impl EndpointClient for LiveClient {
    async fn send_audio(&self, chunk: &AudioChunk) -> Result<(), EndpointError> {
        self.echo.record(Some(chunk.stamp()));
        self.send_json(json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": format!("audio/pcm;rate={}", chunk.sample_rate),
                    "data": codec::to_base64(&chunk.payload),
                }]
            }
        }))
        .await
    }

    async fn send_text(&self, text: &str, echo: Option<EchoStamp>) -> Result<(), EndpointError> {
        self.echo.record(echo);
        self.send_json(json!({
            "clientContent": {
                "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                "turnComplete": true,
            }
        }))
        .await
    }

    async fn interrupt(&self) -> Result<(), EndpointError> {
        self.send_json(interrupt_message()).await
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Stop reading first: the event channel closes before the close
        // handshake can produce anything.
        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }

        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("session ended"),
        }));
        let graceful = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(close).await;
            let _ = sink.close().await;
        })
        .await;
        if graceful.is_err() {
            warn!("Live endpoint did not accept close frame in time");
        }
        debug!("Live endpoint disconnected");
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::Sender<EndpointEvent>, mut parser: ServerMessageParser) {
    while let Some(message) = stream.next().await {
        let parsed = match message {
            Ok(Message::Text(text)) => parser.parse(text.as_bytes()),
            Ok(Message::Binary(bytes)) => parser.parse(&bytes),
            Ok(Message::Close(frame)) => {
                let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                let reason = frame.as_ref().map(|f| f.reason.to_string()).unwrap_or_default();
                debug!(code, reason = %reason, "Live endpoint closed the connection");
                if let Some(error) = classify_close(code, &reason) {
                    let _ = events.send(EndpointEvent::Error(error)).await;
                }
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = events.send(EndpointEvent::Error(classify_ws_error(e))).await;
                break;
            }
        };

        match parsed {
            Ok(batch) => {
                for event in batch {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("Ignoring malformed endpoint message: {}", e),
        }
    }

    let _ = events.send(EndpointEvent::Disconnected).await;
}

fn setup_message(config: &EndpointConfig) -> Value {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };

    let mut generation = match &config.generation_config {
        Value::Object(map) => Value::Object(map.clone()),
        _ => json!({}),
    };
    if let Value::Object(map) = &mut generation {
        map.entry("responseModalities").or_insert_with(|| json!(["AUDIO"]));
        if let Some(voice) = &config.voice {
            map.entry("speechConfig").or_insert_with(|| {
                json!({ "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } } })
            });
        }
    }

    // Server-side voice activity detection stays on, so the client never
    // brackets its audio with activityStart/activityEnd.
    let mut setup = json!({
        "model": model,
        "generationConfig": generation,
        "realtimeInputConfig": {
            "automaticActivityDetection": { "disabled": false },
            "activityHandling": "START_OF_ACTIVITY_INTERRUPTS",
        },
        "inputAudioTranscription": {},
        "outputAudioTranscription": {},
    });
    if !config.system_instruction.is_empty() {
        setup["systemInstruction"] = json!({ "parts": [{ "text": config.system_instruction }] });
    }
    json!({ "setup": setup })
}

/// An empty, open client turn. Any `clientContent` cuts the model's current
/// generation without closing the connection or committing a user turn.
fn interrupt_message() -> Value {
    json!({ "clientContent": { "turns": [], "turnComplete": false } })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    error: Option<ServerError>,
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finished: bool,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

/// Turns server messages into endpoint events.
///
/// Transcription deltas are forwarded as partial entries and accumulated per
/// speaker; the accumulated text is emitted as one final entry when the
/// speaker's transcription finishes, the turn completes or the model is
/// interrupted.
struct ServerMessageParser {
    echo: Arc<EchoTracker>,
    default_rate: u32,
    user_text: String,
    assistant_text: String,
}

impl ServerMessageParser {
    fn new(echo: Arc<EchoTracker>, default_rate: u32) -> Self {
        Self {
            echo,
            default_rate,
            user_text: String::new(),
            assistant_text: String::new(),
        }
    }

    fn parse(&mut self, raw: &[u8]) -> Result<Vec<EndpointEvent>, serde_json::Error> {
        let message: ServerMessage = serde_json::from_slice(raw)?;
        let mut events = Vec::new();

        if message.setup_complete.is_some() {
            events.push(EndpointEvent::Ready);
        }

        if let Some(error) = message.error {
            events.push(EndpointEvent::Error(classify_server_error(error.code, &error.message)));
        }

        if message.go_away.is_some() {
            warn!("Live endpoint announced it is going away");
        }

        let Some(content) = message.server_content else {
            return Ok(events);
        };

        if let Some(transcription) = content.input_transcription {
            self.transcription(Speaker::User, transcription, &mut events);
        }

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    match codec::from_base64(&inline.data) {
                        Ok(pcm) => events.push(EndpointEvent::Audio {
                            pcm,
                            sample_rate: rate_from_mime(&inline.mime_type).unwrap_or(self.default_rate),
                            echo: self.echo.current(),
                        }),
                        Err(e) => warn!("Dropping endpoint audio: {}", e),
                    }
                }
                if let Some(text) = part.text {
                    let delta = Transcription { text, finished: false };
                    self.transcription(Speaker::Assistant, delta, &mut events);
                }
            }
        }

        if let Some(transcription) = content.output_transcription {
            self.transcription(Speaker::Assistant, transcription, &mut events);
        }

        if content.interrupted {
            self.flush(Speaker::Assistant, &mut events);
            events.push(EndpointEvent::Interrupted);
        }

        if content.turn_complete {
            self.flush(Speaker::User, &mut events);
            self.flush(Speaker::Assistant, &mut events);
            events.push(EndpointEvent::TurnComplete);
        }

        Ok(events)
    }

    fn transcription(&mut self, speaker: Speaker, transcription: Transcription, events: &mut Vec<EndpointEvent>) {
        if !transcription.text.is_empty() {
            self.buffer(speaker).push_str(&transcription.text);
            events.push(EndpointEvent::Transcript {
                entry: TranscriptEntry::new(speaker, transcription.text, false),
                echo: self.echo.current(),
            });
        }
        if transcription.finished {
            self.flush(speaker, events);
        }
    }

    fn flush(&mut self, speaker: Speaker, events: &mut Vec<EndpointEvent>) {
        let text = std::mem::take(self.buffer(speaker));
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        events.push(EndpointEvent::Transcript {
            entry: TranscriptEntry::new(speaker, text, true),
            echo: self.echo.current(),
        });
    }

    fn buffer(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.user_text,
            Speaker::Assistant => &mut self.assistant_text,
        }
    }
}

/// Extract `N` from a mime type such as `audio/pcm;rate=N`.
fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .filter(|rate| *rate > 0)
}

fn classify_server_error(code: Option<u16>, message: &str) -> EndpointError {
    match code {
        Some(401) | Some(403) => EndpointError::terminal("AUTH_REJECTED", message),
        Some(429) => EndpointError::terminal("QUOTA_EXCEEDED", message),
        Some(code) if code >= 500 => EndpointError::transient("ENDPOINT_UNAVAILABLE", message),
        _ => EndpointError::terminal("ENDPOINT_ERROR", message),
    }
}

/// Map a close frame to an error. A normal closure is not an error.
fn classify_close(code: u16, reason: &str) -> Option<EndpointError> {
    let message = if reason.is_empty() {
        format!("connection closed with code {}", code)
    } else {
        format!("connection closed with code {}: {}", code, reason)
    };
    match code {
        1000 => None,
        1001 | 1006 => Some(EndpointError::transient("CONNECTION_LOST", message)),
        1011 | 1013 => Some(EndpointError::transient("SERVER_OVERLOADED", message)),
        1008 => Some(EndpointError::terminal("POLICY_VIOLATION", message)),
        1007 | 1002 | 1003 => Some(EndpointError::terminal("PROTOCOL_VIOLATION", message)),
        _ => Some(EndpointError::transient("CONNECTION_CLOSED", message)),
    }
}

fn classify_ws_error(error: tungstenite::Error) -> EndpointError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let message = format!("handshake rejected with HTTP {}", status);
            match status {
                401 | 403 => EndpointError::terminal("AUTH_REJECTED", message),
                429 => EndpointError::terminal("QUOTA_EXCEEDED", message),
                500..=599 => EndpointError::transient("ENDPOINT_UNAVAILABLE", message),
                _ => EndpointError::terminal("HANDSHAKE_REJECTED", message),
            }
        }
        tungstenite::Error::Io(e) => EndpointError::transient("NETWORK_ERROR", e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            EndpointError::transient("CONNECTION_LOST", "connection closed")
        }
        tungstenite::Error::Url(e) => EndpointError::terminal("INVALID_URL", e.to_string()),
        tungstenite::Error::Protocol(e) => EndpointError::terminal("PROTOCOL_VIOLATION", e.to_string()),
        other => EndpointError::terminal("ENDPOINT_ERROR", other.to_string()),
    }
}
