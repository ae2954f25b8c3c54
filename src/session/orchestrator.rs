//! # Session Orchestrator
//!
//! Owns every live session: its row, its endpoint connection and its audio
//! pipeline. All lifecycle changes go through here.
//!
//! ## Concurrency model:
//! - The session table (rows plus owner index) sits behind one mutex and is
//!   only held for map operations, never across an await
//! - `start_session` calls for one owner are serialized by a per-owner gate,
//!   so a prior session is fully released before its replacement exists
//! - Each session runs three loops (capture → endpoint, endpoint → playback,
//!   playback → client) that stop on the session's cancellation token
//! - Teardown runs once per session in its own task; every caller awaits the
//!   same shared outcome

use crate::audio::capture::{AudioCaptureSource, CaptureFactory, CaptureFeed, CaptureSpec};
use crate::audio::codec;
use crate::audio::playback::{AudioPlaybackSink, PlaybackBuffer, PlaybackFrame};
use crate::audio::{now_millis, AudioChunk, AudioFormat, EchoStamp};
use crate::config::AppConfig;
use crate::endpoint::{ConversationalEndpoint, EndpointClient, EndpointConfig, EndpointError, EndpointEvent};
use crate::session::model::{
    ControlEvent, ErrorInfo, FinalizedSession, Session, SessionEvent, SessionId, SessionOptions, SessionStatus,
    SessionSummary, Speaker, TranscriptEntry,
};
use crate::session::persistence::TranscriptSink;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CONNECTION_TIMEOUT: &str = "CONNECTION_TIMEOUT";

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("previous session {0} could not be released cleanly")]
    Conflict(SessionId),

    #[error("session limit of {0} reached")]
    Capacity(usize),

    #[error("cannot {operation} session {session_id} while it is {status}")]
    InvalidState {
        session_id: SessionId,
        status: SessionStatus,
        operation: &'static str,
    },

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("endpoint connection failed: {0}")]
    Connection(EndpointError),

    #[error("failed to release session resources: {0}")]
    ResourceRelease(String),
}

impl OrchestratorError {
    /// The `{code, message, retryable}` triple clients receive.
    pub fn to_error_info(&self) -> ErrorInfo {
        let (code, retryable) = match self {
            OrchestratorError::Conflict(_) => ("SESSION_CONFLICT".to_string(), true),
            OrchestratorError::Capacity(_) => ("CAPACITY_EXCEEDED".to_string(), true),
            OrchestratorError::InvalidState { .. } => ("INVALID_STATE".to_string(), false),
            OrchestratorError::NotFound(_) => ("SESSION_NOT_FOUND".to_string(), false),
            OrchestratorError::InvalidInput(_) => ("INVALID_INPUT".to_string(), false),
            OrchestratorError::Connection(e) => (e.code.clone(), e.is_retryable()),
            OrchestratorError::ResourceRelease(_) => ("RESOURCE_RELEASE".to_string(), true),
        };
        ErrorInfo::new(code, self.to_string(), retryable)
    }
}

/// Timeouts, limits and audio formats the orchestrator runs with.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub connect_timeout: Duration,
    pub teardown_timeout: Duration,
    pub idle_timeout: Duration,
    pub session_ttl: Duration,
    pub retired_capacity: usize,
    pub event_buffer: usize,
    pub max_sessions: usize,
    /// Format the client's microphone is assumed to deliver
    pub client_format: AudioFormat,
    pub capture_chunk_ms: u32,
    pub playback_sample_rate: u32,
    pub playback_frame_ms: u32,
    /// Connection template; per-session options override model and prompt
    pub endpoint: EndpointConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            teardown_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            session_ttl: Duration::from_secs(3600),
            retired_capacity: 256,
            event_buffer: 256,
            max_sessions: 100,
            client_format: AudioFormat::mono(16000),
            capture_chunk_ms: 100,
            playback_sample_rate: 24000,
            playback_frame_ms: 20,
            endpoint: EndpointConfig {
                url: String::new(),
                api_key: String::new(),
                model: "gemini-2.0-flash-live-001".to_string(),
                system_instruction: String::new(),
                generation_config: serde_json::json!({}),
                voice: None,
                input_sample_rate: 16000,
                output_sample_rate: 24000,
            },
        }
    }
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        let voice = Some(config.endpoint.voice.clone()).filter(|v| !v.is_empty());
        Self {
            connect_timeout: Duration::from_millis(config.session.connect_timeout_ms),
            teardown_timeout: Duration::from_millis(config.session.teardown_timeout_ms),
            idle_timeout: Duration::from_secs(config.session.idle_timeout_secs),
            session_ttl: Duration::from_secs(config.session.ttl_secs),
            retired_capacity: config.session.retired_capacity,
            event_buffer: config.session.event_buffer,
            max_sessions: config.performance.max_concurrent_sessions,
            client_format: AudioFormat::new(config.audio.client_sample_rate, config.audio.client_channels),
            capture_chunk_ms: config.audio.capture_chunk_ms,
            playback_sample_rate: config.audio.playback_sample_rate,
            playback_frame_ms: config.audio.playback_frame_ms,
            endpoint: EndpointConfig {
                url: config.endpoint.url.clone(),
                api_key: config.endpoint.api_key.clone(),
                model: config.endpoint.model.clone(),
                system_instruction: config.endpoint.system_instruction.clone(),
                generation_config: config.endpoint.generation_config_value(),
                voice,
                input_sample_rate: config.audio.endpoint_input_rate,
                output_sample_rate: config.audio.endpoint_output_rate,
            },
        }
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone)]
enum EndReason {
    /// Client stop, owner replaced, owner disconnect, shutdown or a clean
    /// endpoint close
    Requested,
    /// Fatal error; the client is told and the session ends `Failed`
    Failed(ErrorInfo),
    /// The connection dropped after an error the client already received
    Lost,
    /// Idle timeout or TTL passed
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownOutcome {
    pub status: SessionStatus,
    /// Whether the release had to be forced past the teardown timeout
    pub forced: bool,
}

type TeardownFuture = Shared<BoxFuture<'static, TeardownOutcome>>;

/// Handles the loops use without going through the resource lock.
struct SessionLinks {
    feed: CaptureFeed,
    playback: AudioPlaybackSink,
    client: Arc<dyn EndpointClient>,
}

/// Everything a connected session owns. Released exactly once.
struct SessionResources {
    capture: Box<dyn AudioCaptureSource>,
    client: Arc<dyn EndpointClient>,
    playback: AudioPlaybackSink,
    tasks: Vec<JoinHandle<()>>,
}

struct SessionHandle {
    id: SessionId,
    owner_id: String,
    options: SessionOptions,
    client_format: AudioFormat,
    playback_rate: u32,
    record: Mutex<Session>,
    cancel: CancellationToken,
    resources: AsyncMutex<Option<SessionResources>>,
    links: Mutex<Option<SessionLinks>>,
    events_tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    teardown: Mutex<Option<TeardownFuture>>,
}

impl SessionHandle {
    fn status(&self) -> SessionStatus {
        lock(&self.record).status
    }

    /// Move to `next` if the state machine allows it. Returns the current status otherwise.
    fn transition(&self, next: SessionStatus) -> Result<(), SessionStatus> {
        let mut record = lock(&self.record);
        if record.status == next {
            return Ok(());
        }
        if !record.status.can_transition_to(next) {
            return Err(record.status);
        }
        debug!(session_id = %self.id, from = %record.status, to = %next, "Session status changed");
        record.status = next;
        Ok(())
    }

    fn touch(&self) {
        lock(&self.record).touch();
    }

    fn snapshot(&self) -> Session {
        lock(&self.record).clone()
    }

    fn links<T>(&self, f: impl FnOnce(&SessionLinks) -> T) -> Option<T> {
        lock(&self.links).as_ref().map(f)
    }

    fn require(&self, allowed: &[SessionStatus], operation: &'static str) -> Result<SessionStatus, OrchestratorError> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(status)
        } else {
            Err(OrchestratorError::InvalidState {
                session_id: self.id.clone(),
                status,
                operation,
            })
        }
    }

    /// Deliver an event in order, waiting while the bridge is behind.
    async fn emit(&self, event: SessionEvent) {
        let tx = lock(&self.events_tx).clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Deliver an event without waiting. Used on teardown paths.
    fn emit_now(&self, event: SessionEvent) {
        if let Some(tx) = lock(&self.events_tx).as_ref() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
                warn!(session_id = %self.id, "Event buffer full, dropping teardown event");
            }
        }
    }

    fn record_final(&self, entry: &TranscriptEntry) {
        if entry.is_final {
            lock(&self.transcript).push(entry.clone());
        }
    }
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    owners: HashMap<String, SessionId>,
    retired: VecDeque<SessionId>,
    retired_status: HashMap<SessionId, SessionStatus>,
}

impl SessionTable {
    fn retire(&mut self, id: &SessionId, status: SessionStatus, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.retired_status.insert(id.clone(), status).is_none() {
            self.retired.push_back(id.clone());
        }
        while self.retired.len() > capacity {
            if let Some(oldest) = self.retired.pop_front() {
                self.retired_status.remove(&oldest);
            }
        }
    }
}

struct Inner {
    settings: OrchestratorSettings,
    endpoint: Arc<dyn ConversationalEndpoint>,
    capture: Arc<dyn CaptureFactory>,
    persistence: Arc<dyn TranscriptSink>,
    table: Mutex<SessionTable>,
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Cheap to clone; all clones share the same session table.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        endpoint: Arc<dyn ConversationalEndpoint>,
        capture: Arc<dyn CaptureFactory>,
        persistence: Arc<dyn TranscriptSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                endpoint,
                capture,
                persistence,
                table: Mutex::new(SessionTable::default()),
                gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Create a new session for `owner_id`, tearing down the owner's live
    /// session first.
    pub async fn start_session(&self, owner_id: &str, options: SessionOptions) -> Result<SessionId, OrchestratorError> {
        let settings = &self.inner.settings;
        let client_format = AudioFormat::new(
            options.sample_rate.unwrap_or(settings.client_format.sample_rate),
            options.channels.unwrap_or(settings.client_format.channels),
        );
        let playback_rate = options.playback_sample_rate.unwrap_or(settings.playback_sample_rate);
        if client_format.sample_rate == 0 || playback_rate == 0 {
            return Err(OrchestratorError::InvalidInput("sample rates must be greater than zero".to_string()));
        }
        if !(1..=8).contains(&client_format.channels) {
            return Err(OrchestratorError::InvalidInput(format!(
                "unsupported channel count {}",
                client_format.channels
            )));
        }

        let gate = self.owner_gate(owner_id);
        let guard = gate.lock().await;
        let result = self.start_locked(owner_id, options, client_format, playback_rate).await;
        drop(guard);
        self.release_gate(owner_id, gate);
        result
    }

    async fn start_locked(
        &self,
        owner_id: &str,
        options: SessionOptions,
        client_format: AudioFormat,
        playback_rate: u32,
    ) -> Result<SessionId, OrchestratorError> {
        let prior = {
            let table = lock(&self.inner.table);
            table.owners.get(owner_id).and_then(|id| table.sessions.get(id)).cloned()
        };
        if let Some(prior) = prior {
            info!(owner_id, session_id = %prior.id, "Replacing live session");
            let outcome = self.teardown(&prior, EndReason::Requested).await;
            if outcome.forced {
                warn!(owner_id, session_id = %prior.id, "Prior session release was forced");
                return Err(OrchestratorError::Conflict(prior.id.clone()));
            }
        }

        let settings = &self.inner.settings;
        let id = Uuid::new_v4().to_string();
        let ttl = ChronoDuration::from_std(settings.session_ttl).unwrap_or_else(|_| ChronoDuration::hours(1));
        let (tx, rx) = mpsc::channel(settings.event_buffer.max(1));
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            options,
            client_format,
            playback_rate,
            record: Mutex::new(Session::new(id.clone(), owner_id.to_string(), ttl)),
            cancel: CancellationToken::new(),
            resources: AsyncMutex::new(None),
            links: Mutex::new(None),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            transcript: Mutex::new(Vec::new()),
            teardown: Mutex::new(None),
        });

        {
            let mut table = lock(&self.inner.table);
            if table.sessions.len() >= settings.max_sessions {
                warn!(owner_id, limit = settings.max_sessions, "Session limit reached");
                return Err(OrchestratorError::Capacity(settings.max_sessions));
            }
            table.sessions.insert(id.clone(), handle);
            table.owners.insert(owner_id.to_string(), id.clone());
        }

        info!(session_id = %id, owner_id, "Session created");
        Ok(id)
    }

    /// Open the endpoint connection, wire the audio pipeline and wait for the
    /// endpoint to become ready.
    pub async fn connect(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let handle = self.lookup(session_id)?;
        let deadline = Instant::now() + self.inner.settings.connect_timeout;

        let mut slot = handle.resources.lock().await;
        if handle.cancel.is_cancelled() {
            return Err(self.ended_error(&handle, "connect"));
        }
        handle
            .transition(SessionStatus::Connecting)
            .map_err(|status| OrchestratorError::InvalidState {
                session_id: handle.id.clone(),
                status,
                operation: "connect",
            })?;

        let config = self.endpoint_config(&handle.options);
        let connected = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => None,
            result = timeout_at(deadline, self.inner.endpoint.connect(&config)) => Some(result),
        };
        let endpoint = match connected {
            None => return Err(self.ended_error(&handle, "connect")),
            Some(Err(_elapsed)) => {
                drop(slot);
                return Err(self.fail_connect(&handle, self.timeout_error()).await);
            }
            Some(Ok(Err(e))) => {
                drop(slot);
                return Err(self.fail_connect(&handle, e).await);
            }
            Some(Ok(Ok(endpoint))) => endpoint,
        };

        if handle.cancel.is_cancelled() {
            endpoint.client.disconnect().await;
            return Err(self.ended_error(&handle, "connect"));
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        match self.wire(&handle, endpoint.client.clone(), endpoint.events, ready_tx).await {
            Ok(resources) => *slot = Some(resources),
            Err(e) => {
                endpoint.client.disconnect().await;
                drop(slot);
                let info = e.to_error_info();
                self.teardown(&handle, EndReason::Failed(info)).await;
                return Err(e);
            }
        }
        drop(slot);

        let ready = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => None,
            result = timeout_at(deadline, ready_rx) => Some(result),
        };
        match ready {
            None => Err(self.ended_error(&handle, "connect")),
            Some(Err(_elapsed)) => Err(self.fail_connect(&handle, self.timeout_error()).await),
            Some(Ok(Ok(Ok(())))) => {
                info!(session_id = %handle.id, owner_id = %handle.owner_id, "Session active");
                Ok(())
            }
            Some(Ok(Ok(Err(e)))) => Err(self.fail_connect(&handle, e).await),
            Some(Ok(Err(_))) => Err(self.ended_error(&handle, "connect")),
        }
    }

    pub async fn send_text(&self, session_id: &str, text: &str, echo: Option<EchoStamp>) -> Result<(), OrchestratorError> {
        let handle = self.lookup(session_id)?;
        handle.require(&[SessionStatus::Active], "send text to")?;
        let text = text.trim();
        if text.is_empty() {
            return Err(OrchestratorError::InvalidInput("text must not be empty".to_string()));
        }
        let client = handle
            .links(|links| links.client.clone())
            .ok_or_else(|| self.ended_error(&handle, "send text to"))?;

        handle.touch();
        client.send_text(text, echo).await.map_err(|e| {
            warn!(session_id = %handle.id, "Failed to send text: {}", e);
            OrchestratorError::Connection(e)
        })?;
        handle.record_final(&TranscriptEntry::new(Speaker::User, text, true));
        Ok(())
    }

    /// Push one client audio chunk into the session's capture source.
    /// Chunks arriving while paused are dropped.
    pub async fn send_audio_chunk(&self, session_id: &str, chunk: AudioChunk) -> Result<(), OrchestratorError> {
        let handle = self.lookup(session_id)?;
        let status = handle.require(&[SessionStatus::Active, SessionStatus::Paused], "send audio to")?;
        if chunk.sample_rate == 0 || chunk.channels == 0 {
            return Err(OrchestratorError::InvalidInput("audio format must be non-zero".to_string()));
        }
        if chunk.payload.len() % 2 != 0 {
            return Err(OrchestratorError::InvalidInput(format!(
                "PCM16 payload has odd length {}",
                chunk.payload.len()
            )));
        }
        handle.touch();
        if status == SessionStatus::Paused {
            return Ok(());
        }

        let feed = handle
            .links(|links| links.feed.clone())
            .ok_or_else(|| self.ended_error(&handle, "send audio to"))?;
        feed.push(chunk).await.map_err(|_| self.ended_error(&handle, "send audio to"))
    }

    /// Silence playback now and ask the endpoint to stop its response.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let handle = self.lookup(session_id)?;
        handle.require(&[SessionStatus::Active], "interrupt")?;
        let (playback, client) = handle
            .links(|links| (links.playback.clone(), links.client.clone()))
            .ok_or_else(|| self.ended_error(&handle, "interrupt"))?;

        let dropped = playback.clear();
        debug!(session_id = %handle.id, dropped, "Playback cleared for interrupt");
        handle.emit(SessionEvent::Control(ControlEvent::Interrupt)).await;

        if let Err(e) = client.interrupt().await {
            warn!(session_id = %handle.id, "Endpoint interrupt not delivered: {}", e);
        }
        Ok(())
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        self.set_paused(session_id, true).await
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        self.set_paused(session_id, false).await
    }

    async fn set_paused(&self, session_id: &str, paused: bool) -> Result<(), OrchestratorError> {
        let handle = self.lookup(session_id)?;
        let (from, to, operation) = if paused {
            (SessionStatus::Active, SessionStatus::Paused, "pause")
        } else {
            (SessionStatus::Paused, SessionStatus::Active, "resume")
        };
        handle.require(&[from, to], operation)?;
        handle.transition(to).map_err(|status| OrchestratorError::InvalidState {
            session_id: handle.id.clone(),
            status,
            operation,
        })?;
        handle.touch();
        if paused {
            if let Some(playback) = handle.links(|links| links.playback.clone()) {
                playback.clear();
            }
        }
        info!(session_id = %handle.id, status = %to, "Session {}d", operation);
        handle.emit(SessionEvent::Control(ControlEvent::Status { status: to })).await;
        Ok(())
    }

    /// End a session. Idempotent: ending an already ended session reports its
    /// final status.
    pub async fn end_session(&self, session_id: &str) -> Result<SessionStatus, OrchestratorError> {
        match self.lookup(session_id) {
            Ok(handle) => Ok(self.teardown(&handle, EndReason::Requested).await.status),
            Err(e) => self.retired_status(session_id).ok_or(e),
        }
    }

    pub fn get_status(&self, session_id: &str) -> Result<SessionStatus, OrchestratorError> {
        match self.lookup(session_id) {
            Ok(handle) => Ok(handle.status()),
            Err(e) => self.retired_status(session_id).ok_or(e),
        }
    }

    /// Hand out the session's ordered event stream. Only one consumer may take it.
    pub fn take_events(&self, session_id: &str) -> Result<mpsc::Receiver<SessionEvent>, OrchestratorError> {
        let handle = self.lookup(session_id)?;
        let taken = lock(&handle.events_rx).take();
        taken.ok_or_else(|| OrchestratorError::InvalidState {
            session_id: handle.id.clone(),
            status: handle.status(),
            operation: "take events from",
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionSummary, OrchestratorError> {
        let handle = self.lookup(session_id)?;
        Ok(summarize(&handle))
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let handles: Vec<Arc<SessionHandle>> = lock(&self.inner.table).sessions.values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = handles.iter().map(|h| summarize(h)).collect();
        summaries.sort_by_key(|s| s.session.created_at);
        summaries
    }

    pub fn session_for_owner(&self, owner_id: &str) -> Option<SessionId> {
        lock(&self.inner.table).owners.get(owner_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.table).sessions.len()
    }

    /// Live sessions per status.
    pub fn status_counts(&self) -> HashMap<SessionStatus, usize> {
        let handles: Vec<Arc<SessionHandle>> = lock(&self.inner.table).sessions.values().cloned().collect();
        let mut counts = HashMap::new();
        for handle in handles {
            *counts.entry(handle.status()).or_insert(0) += 1;
        }
        counts
    }

    /// End every session whose TTL passed or that sat idle too long.
    pub async fn reap_stale(&self) -> Vec<SessionId> {
        let now = Utc::now();
        let idle = ChronoDuration::from_std(self.inner.settings.idle_timeout).unwrap_or_else(|_| ChronoDuration::minutes(5));
        let stale: Vec<Arc<SessionHandle>> = lock(&self.inner.table)
            .sessions
            .values()
            .filter(|handle| lock(&handle.record).is_stale(now, idle))
            .cloned()
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for handle in stale {
            info!(session_id = %handle.id, owner_id = %handle.owner_id, "Reaping stale session");
            self.teardown(&handle, EndReason::Expired).await;
            reaped.push(handle.id.clone());
        }
        reaped
    }

    /// Run `reap_stale` every `interval` until `shutdown` is cancelled.
    pub fn spawn_reaper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = orchestrator.reap_stale().await;
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "Reaped stale sessions");
                        }
                    }
                }
            }
        })
    }

    /// End every live session. Used on shutdown.
    pub async fn end_all(&self) {
        let handles: Vec<Arc<SessionHandle>> = lock(&self.inner.table).sessions.values().cloned().collect();
        let teardowns: Vec<_> = handles
            .iter()
            .map(|handle| self.teardown(handle, EndReason::Requested))
            .collect();
        futures_util::future::join_all(teardowns).await;
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<SessionHandle>, OrchestratorError> {
        lock(&self.inner.table)
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))
    }

    fn retired_status(&self, session_id: &str) -> Option<SessionStatus> {
        lock(&self.inner.table).retired_status.get(session_id).copied()
    }

    fn ended_error(&self, handle: &SessionHandle, operation: &'static str) -> OrchestratorError {
        OrchestratorError::InvalidState {
            session_id: handle.id.clone(),
            status: handle.status(),
            operation,
        }
    }

    fn timeout_error(&self) -> EndpointError {
        EndpointError::transient(
            CONNECTION_TIMEOUT,
            format!(
                "endpoint did not become ready within {} ms",
                self.inner.settings.connect_timeout.as_millis()
            ),
        )
    }

    async fn fail_connect(&self, handle: &Arc<SessionHandle>, error: EndpointError) -> OrchestratorError {
        warn!(session_id = %handle.id, code = %error.code, retryable = error.is_retryable(), "Connect failed: {}", error.message);
        let info = ErrorInfo::new(error.code.clone(), error.message.clone(), error.is_retryable());
        self.teardown(handle, EndReason::Failed(info)).await;
        OrchestratorError::Connection(error)
    }

    fn owner_gate(&self, owner_id: &str) -> Arc<AsyncMutex<()>> {
        lock(&self.inner.gates)
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release_gate(&self, owner_id: &str, gate: Arc<AsyncMutex<()>>) {
        let mut gates = lock(&self.inner.gates);
        // The map and this caller hold the only references: nobody is waiting.
        if Arc::strong_count(&gate) <= 2 {
            gates.remove(owner_id);
        }
    }

    fn endpoint_config(&self, options: &SessionOptions) -> EndpointConfig {
        let mut config = self.inner.settings.endpoint.clone();
        if let Some(model) = options.model.as_ref().filter(|m| !m.is_empty()) {
            config.model = model.clone();
        }
        if let Some(instruction) = &options.system_instruction {
            config.system_instruction = instruction.clone();
        }
        if let Some(generation) = &options.generation_config {
            config.generation_config = generation.clone();
        }
        config
    }

    /// Start capture, playback and the three session loops.
    async fn wire(
        &self,
        handle: &Arc<SessionHandle>,
        client: Arc<dyn EndpointClient>,
        events: mpsc::Receiver<EndpointEvent>,
        ready: oneshot::Sender<Result<(), EndpointError>>,
    ) -> Result<SessionResources, OrchestratorError> {
        let settings = &self.inner.settings;
        let buffer = settings.event_buffer.max(1);

        let spec = CaptureSpec {
            format: handle.client_format,
            chunk_ms: settings.capture_chunk_ms,
        };
        let (mut capture, feed) = self.inner.capture.create(spec);
        let (chunk_tx, chunk_rx) = mpsc::channel(buffer);
        capture
            .start(chunk_tx)
            .await
            .map_err(|e| OrchestratorError::InvalidInput(format!("capture failed to start: {}", e)))?;

        let (frame_tx, frame_rx) = mpsc::channel(buffer);
        let playback = AudioPlaybackSink::start(frame_tx, settings.playback_frame_ms);

        let tasks = vec![
            tokio::spawn(send_loop(
                handle.clone(),
                chunk_rx,
                client.clone(),
                settings.endpoint.input_sample_rate,
            )),
            tokio::spawn(receive_loop(self.clone(), handle.clone(), events, playback.clone(), ready)),
            tokio::spawn(forward_loop(handle.clone(), frame_rx)),
        ];

        *lock(&handle.links) = Some(SessionLinks {
            feed,
            playback: playback.clone(),
            client: client.clone(),
        });

        Ok(SessionResources {
            capture,
            client,
            playback,
            tasks,
        })
    }

    /// Start the session's teardown if nobody has, and wait for its outcome.
    async fn teardown(&self, handle: &Arc<SessionHandle>, reason: EndReason) -> TeardownOutcome {
        self.begin_teardown(handle, reason).await
    }

    fn begin_teardown(&self, handle: &Arc<SessionHandle>, reason: EndReason) -> TeardownFuture {
        let mut slot = lock(&handle.teardown);
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }

        let orchestrator = self.clone();
        let target = handle.clone();
        let task = tokio::spawn(async move { orchestrator.release(target, reason).await });
        let outcome = async move {
            task.await.unwrap_or(TeardownOutcome {
                status: SessionStatus::Failed,
                forced: true,
            })
        }
        .boxed()
        .shared();
        *slot = Some(outcome.clone());
        outcome
    }

    /// The one release sequence of a session.
    async fn release(&self, handle: Arc<SessionHandle>, reason: EndReason) -> TeardownOutcome {
        let started = Instant::now();
        let deadline = started + self.inner.settings.teardown_timeout;
        handle.cancel.cancel();

        match &reason {
            EndReason::Failed(info) => {
                let _ = handle.transition(SessionStatus::Failed);
                handle.emit_now(SessionEvent::Control(ControlEvent::Error(info.clone())));
            }
            EndReason::Lost => {
                let _ = handle.transition(SessionStatus::Failed);
            }
            EndReason::Expired => {
                let _ = handle.transition(SessionStatus::Ending);
                handle.emit_now(SessionEvent::Control(ControlEvent::Error(ErrorInfo::new(
                    "SESSION_EXPIRED",
                    "session expired after inactivity",
                    false,
                ))));
            }
            EndReason::Requested => {
                let _ = handle.transition(SessionStatus::Ending);
            }
        }

        lock(&handle.links).take();
        let mut forced = false;
        match timeout_at(deadline, handle.resources.lock()).await {
            Ok(mut slot) => {
                if let Some(resources) = slot.take() {
                    drop(slot);
                    forced = !release_resources(&handle.id, resources, deadline).await;
                }
            }
            Err(_) => {
                warn!(session_id = %handle.id, "Timed out waiting for in-flight connect");
                forced = true;
            }
        }

        let final_status = match handle.status() {
            SessionStatus::Failed => SessionStatus::Failed,
            _ => {
                let _ = handle.transition(SessionStatus::Closed);
                handle.status()
            }
        };

        {
            let mut table = lock(&self.inner.table);
            table.sessions.remove(&handle.id);
            if table.owners.get(&handle.owner_id) == Some(&handle.id) {
                table.owners.remove(&handle.owner_id);
            }
            table.retire(&handle.id, final_status, self.inner.settings.retired_capacity);
        }

        let finalized = FinalizedSession {
            session: handle.snapshot(),
            ended_at: Utc::now(),
            transcript: lock(&handle.transcript).clone(),
        };
        let persistence = self.inner.persistence.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.persist(&finalized).await {
                error!(session_id = %finalized.session.id, "Failed to persist transcript: {}", e);
            }
        });

        handle.emit_now(SessionEvent::Control(ControlEvent::Status { status: final_status }));
        handle.emit_now(SessionEvent::Control(ControlEvent::Stop));
        lock(&handle.events_tx).take();

        info!(
            session_id = %handle.id,
            owner_id = %handle.owner_id,
            status = %final_status,
            forced,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Session torn down"
        );
        TeardownOutcome {
            status: final_status,
            forced,
        }
    }
}

/// Stop capture, close the endpoint, stop playback, then abort the loops.
/// Returns false when the deadline forced the release.
async fn release_resources(session_id: &str, resources: SessionResources, deadline: Instant) -> bool {
    let SessionResources {
        mut capture,
        client,
        playback,
        tasks,
    } = resources;

    let devices = async {
        if let Err(e) = capture.stop().await {
            warn!(session_id, "{}", OrchestratorError::ResourceRelease(e.to_string()));
        }
        client.disconnect().await;
        playback.stop().await;
    };
    let clean = timeout_at(deadline, devices).await.is_ok();

    for task in &tasks {
        task.abort();
    }

    if !clean {
        warn!(session_id, "Teardown timed out, forcing release");
        playback.clear();
        tokio::spawn(async move {
            client.disconnect().await;
            playback.stop().await;
        });
    }
    drop(capture);
    clean
}

fn summarize(handle: &SessionHandle) -> SessionSummary {
    SessionSummary {
        session: handle.snapshot(),
        transcript_entries: lock(&handle.transcript).len(),
    }
}

/// Capture → codec → endpoint. Chunks captured while paused are dropped.
async fn send_loop(
    handle: Arc<SessionHandle>,
    mut chunks: mpsc::Receiver<AudioChunk>,
    client: Arc<dyn EndpointClient>,
    input_rate: u32,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break,
            next = chunks.recv() => match next {
                Some(chunk) => chunk,
                None => break,
            },
        };
        if handle.status() == SessionStatus::Paused {
            continue;
        }

        let chunk = match conform_for_endpoint(chunk, input_rate) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(session_id = %handle.id, "Dropping captured chunk: {}", e);
                continue;
            }
        };
        if let Err(e) = client.send_audio(&chunk).await {
            // The receive loop reports the dropped connection.
            debug!(session_id = %handle.id, "Audio send failed: {}", e);
            break;
        }
    }
}

/// Downmix and resample a captured chunk to the endpoint's mono input rate.
fn conform_for_endpoint(chunk: AudioChunk, input_rate: u32) -> Result<AudioChunk, codec::CodecError> {
    if chunk.channels == 1 && chunk.sample_rate == input_rate {
        return Ok(chunk);
    }
    let samples = codec::decode_pcm16(&chunk.payload)?;
    let mono = codec::downmix_to_mono(&samples, chunk.channels)?;
    let resampled = codec::resample(&mono, chunk.sample_rate, input_rate)?;
    Ok(AudioChunk::new(
        codec::encode_pcm16(&resampled),
        input_rate,
        1,
        chunk.sequence_number,
        chunk.capture_timestamp,
    ))
}

/// Endpoint events → client events and playback.
async fn receive_loop(
    orchestrator: SessionOrchestrator,
    handle: Arc<SessionHandle>,
    mut events: mpsc::Receiver<EndpointEvent>,
    playback: AudioPlaybackSink,
    ready: oneshot::Sender<Result<(), EndpointError>>,
) {
    let mut ready = Some(ready);
    let mut reported: Option<EndpointError> = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => return,
            next = events.recv() => next,
        };

        match event {
            Some(EndpointEvent::Ready) => {
                let Some(waiter) = ready.take() else { continue };
                if handle.transition(SessionStatus::Active).is_err() {
                    return;
                }
                handle.emit(SessionEvent::Control(ControlEvent::Ready)).await;
                if waiter.send(Ok(())).is_err() {
                    return;
                }
            }
            Some(EndpointEvent::Transcript { entry, echo }) => {
                if ready.is_some() {
                    continue;
                }
                handle.touch();
                handle.record_final(&entry);
                handle.emit(SessionEvent::Transcript { entry, echo }).await;
            }
            Some(EndpointEvent::Audio { pcm, sample_rate, echo }) => {
                if ready.is_some() {
                    continue;
                }
                handle.touch();
                let decoded = codec::decode_pcm16(&pcm)
                    .and_then(|samples| codec::resample(&samples, sample_rate, handle.playback_rate));
                match decoded {
                    Ok(samples) => {
                        let buffer = PlaybackBuffer::mono(samples, handle.playback_rate).with_echo(echo);
                        if playback.enqueue(buffer).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(session_id = %handle.id, "Dropping endpoint audio: {}", e),
                }
            }
            Some(EndpointEvent::Interrupted) => {
                let dropped = playback.clear();
                debug!(session_id = %handle.id, dropped, "Endpoint interrupted its response");
                handle.emit(SessionEvent::Control(ControlEvent::Interrupt)).await;
            }
            Some(EndpointEvent::TurnComplete) => {
                handle.emit(SessionEvent::Control(ControlEvent::TurnComplete)).await;
            }
            Some(EndpointEvent::Error(e)) => {
                if let Some(waiter) = ready.take() {
                    let _ = waiter.send(Err(e));
                    return;
                }
                if e.is_retryable() {
                    warn!(session_id = %handle.id, code = %e.code, "Transient endpoint error: {}", e.message);
                    let info = ErrorInfo::new(e.code.clone(), e.message.clone(), true);
                    handle.emit(SessionEvent::Control(ControlEvent::Error(info))).await;
                    reported = Some(e);
                } else {
                    error!(session_id = %handle.id, code = %e.code, "Terminal endpoint error: {}", e.message);
                    let info = ErrorInfo::new(e.code, e.message, false);
                    let _ = orchestrator.begin_teardown(&handle, EndReason::Failed(info));
                    return;
                }
            }
            Some(EndpointEvent::Disconnected) | None => {
                if let Some(waiter) = ready.take() {
                    let _ = waiter.send(Err(EndpointError::transient(
                        "CONNECTION_LOST",
                        "endpoint closed before it was ready",
                    )));
                    return;
                }
                // A transient error already told the client why; otherwise
                // the loss itself is the error.
                let reason = match reported {
                    Some(_) => EndReason::Lost,
                    None => EndReason::Failed(ErrorInfo::new(
                        "CONNECTION_LOST",
                        "endpoint closed the connection",
                        true,
                    )),
                };
                info!(session_id = %handle.id, "Endpoint disconnected");
                let _ = orchestrator.begin_teardown(&handle, reason);
                return;
            }
        }
    }
}

/// Paced playback frames → client audio events.
async fn forward_loop(handle: Arc<SessionHandle>, mut frames: mpsc::Receiver<PlaybackFrame>) {
    let mut sequence = 0u64;
    loop {
        let frame = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break,
            next = frames.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };
        sequence += 1;
        let chunk = AudioChunk::new(
            codec::encode_pcm16(&frame.samples),
            frame.sample_rate,
            frame.channels,
            sequence,
            now_millis(),
        );
        handle.emit(SessionEvent::Audio { chunk, echo: frame.echo }).await;
    }
}
