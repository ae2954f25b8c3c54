//! Scripted stand-ins for the endpoint, capture device, transcript store and
//! client channel, shared by the unit tests.

use crate::audio::capture::{AudioCaptureSource, CaptureError, CaptureFactory, CaptureFeed, CaptureSpec, RelayCaptureSource};
use crate::audio::{AudioChunk, EchoStamp};
use crate::endpoint::{ConversationalEndpoint, EndpointClient, EndpointConfig, EndpointError, EndpointEvent, EndpointSession};
use crate::session::model::FinalizedSession;
use crate::session::persistence::{PersistenceError, TranscriptSink};
use crate::transport::envelope::WireEnvelope;
use crate::transport::{ChannelClosed, ClientChannel};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How a [`ScriptedEndpoint`] answers a connect.
#[derive(Debug, Clone)]
pub enum ReadyMode {
    /// Connect succeeds and `Ready` is queued right away.
    Immediate,
    /// Connect succeeds but the endpoint never signals ready.
    Never,
    ConnectError(EndpointError),
}

#[derive(Default)]
struct EndpointLog {
    connects: usize,
    disconnects: usize,
    open: usize,
    max_open: usize,
    interrupts: usize,
    fail_sends: bool,
    audio: Vec<AudioChunk>,
    texts: Vec<(String, Option<EchoStamp>)>,
    latest: Option<mpsc::Sender<EndpointEvent>>,
}

pub struct ScriptedEndpoint {
    mode: ReadyMode,
    connect_delay: Duration,
    log: Arc<Mutex<EndpointLog>>,
}

impl ScriptedEndpoint {
    pub fn new(mode: ReadyMode) -> Self {
        Self {
            mode,
            connect_delay: Duration::ZERO,
            log: Arc::new(Mutex::new(EndpointLog::default())),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Deliver an event on the most recent connection.
    pub fn inject(&self, event: EndpointEvent) {
        let sender = self.log.lock().unwrap().latest.clone();
        if let Some(sender) = sender {
            let _ = sender.try_send(event);
        }
    }

    pub fn connects(&self) -> usize {
        self.log.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.log.lock().unwrap().disconnects
    }

    /// Highest number of connections that were open at the same time.
    pub fn max_open(&self) -> usize {
        self.log.lock().unwrap().max_open
    }

    pub fn interrupts(&self) -> usize {
        self.log.lock().unwrap().interrupts
    }

    /// Make every later text or audio send fail as a transient network error.
    pub fn fail_sends(&self) {
        self.log.lock().unwrap().fail_sends = true;
    }

    pub fn sent_audio(&self) -> Vec<AudioChunk> {
        self.log.lock().unwrap().audio.clone()
    }

    pub fn last_text_echo(&self) -> Option<EchoStamp> {
        self.log.lock().unwrap().texts.last().and_then(|(_, echo)| *echo)
    }
}

#[async_trait]
impl ConversationalEndpoint for ScriptedEndpoint {
    async fn connect(&self, _config: &EndpointConfig) -> Result<EndpointSession, EndpointError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let ReadyMode::ConnectError(e) = &self.mode {
            return Err(e.clone());
        }

        let (tx, rx) = mpsc::channel(256);
        if matches!(self.mode, ReadyMode::Immediate) {
            let _ = tx.try_send(EndpointEvent::Ready);
        }
        {
            let mut log = self.log.lock().unwrap();
            log.connects += 1;
            log.open += 1;
            log.max_open = log.max_open.max(log.open);
            log.latest = Some(tx.clone());
        }
        let client = ScriptedClient {
            log: self.log.clone(),
            events: Mutex::new(Some(tx)),
        };
        Ok(EndpointSession {
            client: Arc::new(client),
            events: rx,
        })
    }
}

struct ScriptedClient {
    log: Arc<Mutex<EndpointLog>>,
    events: Mutex<Option<mpsc::Sender<EndpointEvent>>>,
}

#[async_trait]
impl EndpointClient for ScriptedClient {
    async fn send_audio(&self, chunk: &AudioChunk) -> Result<(), EndpointError> {
        let mut log = self.log.lock().unwrap();
        if log.fail_sends {
            return Err(send_failure());
        }
        log.audio.push(chunk.clone());
        Ok(())
    }

    async fn send_text(&self, text: &str, echo: Option<EchoStamp>) -> Result<(), EndpointError> {
        let mut log = self.log.lock().unwrap();
        if log.fail_sends {
            return Err(send_failure());
        }
        log.texts.push((text.to_string(), echo));
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), EndpointError> {
        self.log.lock().unwrap().interrupts += 1;
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(events) = self.events.lock().unwrap().take() else {
            return;
        };
        let mut log = self.log.lock().unwrap();
        log.disconnects += 1;
        log.open -= 1;
        if log.latest.as_ref().is_some_and(|latest| latest.same_channel(&events)) {
            log.latest = None;
        }
    }
}

fn send_failure() -> EndpointError {
    EndpointError::transient("NETWORK_ERROR", "connection reset")
}

/// Relay capture that counts lifecycles and can be made slow to stop.
#[derive(Default)]
pub struct CountingCaptureFactory {
    stop_delay: Duration,
    created: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl CountingCaptureFactory {
    pub fn with_stop_delay(stop_delay: Duration) -> Self {
        Self {
            stop_delay,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl CaptureFactory for CountingCaptureFactory {
    fn create(&self, spec: CaptureSpec) -> (Box<dyn AudioCaptureSource>, CaptureFeed) {
        self.created.fetch_add(1, Ordering::SeqCst);
        let (inner, feed) = RelayCaptureSource::new(spec);
        let source = CountingCapture {
            inner,
            stop_delay: self.stop_delay,
            stops: self.stops.clone(),
        };
        (Box::new(source), feed)
    }
}

struct CountingCapture {
    inner: RelayCaptureSource,
    stop_delay: Duration,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl AudioCaptureSource for CountingCapture {
    fn spec(&self) -> CaptureSpec {
        self.inner.spec()
    }

    async fn start(&mut self, sink: mpsc::Sender<AudioChunk>) -> Result<(), CaptureError> {
        self.inner.start(sink).await
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        let stopped = self.inner.stop().await;
        self.stops.fetch_add(1, Ordering::SeqCst);
        stopped
    }
}

#[derive(Default)]
pub struct RecordingTranscriptSink {
    sessions: Mutex<Vec<FinalizedSession>>,
}

impl RecordingTranscriptSink {
    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn sessions(&self) -> Vec<FinalizedSession> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscriptSink for RecordingTranscriptSink {
    async fn persist(&self, session: &FinalizedSession) -> Result<(), PersistenceError> {
        self.sessions.lock().unwrap().push(session.clone());
        Ok(())
    }
}

/// Client channel that records what the bridge writes.
#[derive(Default)]
pub struct RecordingChannel {
    envelopes: Mutex<Vec<WireEnvelope>>,
    closed: Mutex<Option<u16>>,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn envelopes(&self) -> Vec<WireEnvelope> {
        self.envelopes.lock().unwrap().clone()
    }

    pub fn closed_with(&self) -> Option<u16> {
        *self.closed.lock().unwrap()
    }

    /// Make every later write fail as if the client vanished.
    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientChannel for RecordingChannel {
    async fn send(&self, envelope: WireEnvelope) -> Result<(), ChannelClosed> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelClosed);
        }
        self.envelopes.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn close(&self, code: u16, _reason: &str) {
        *self.closed.lock().unwrap() = Some(code);
    }
}
