//! # SSE Transport
//!
//! Fallback for clients that cannot hold a WebSocket open. The server → client
//! half is a `text/event-stream` response; the client → server half is a POST
//! per frame. Both halves are tied together by owner id: one open stream per
//! owner, and a newer stream replaces the older one.

use super::{ChannelClosed, ClientChannel, InboundFrame, TransportBridge};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transport::envelope::WireEnvelope;
use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const STREAM_BUFFER: usize = 256;

enum SseFrame {
    Data(Bytes),
    End,
}

struct SseConnection {
    id: Uuid,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    cancel: CancellationToken,
}

/// Open SSE streams by owner.
#[derive(Clone, Default)]
pub struct SseRegistry {
    connections: Arc<Mutex<HashMap<String, SseConnection>>>,
}

impl SseRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SseConnection>> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a stream for `owner_id`, replacing any older one.
    fn register(&self, owner_id: &str, inbound: mpsc::UnboundedSender<InboundFrame>, cancel: CancellationToken) -> Uuid {
        let id = Uuid::new_v4();
        let previous = self.lock().insert(
            owner_id.to_string(),
            SseConnection {
                id,
                inbound,
                cancel,
            },
        );
        if let Some(previous) = previous {
            debug!(owner_id, "Replacing open SSE stream");
            previous.cancel.cancel();
        }
        id
    }

    /// Drop the stream `id` if it is still the owner's current one.
    fn remove(&self, owner_id: &str, id: Uuid) {
        let mut connections = self.lock();
        if connections.get(owner_id).is_some_and(|conn| conn.id == id) {
            if let Some(conn) = connections.remove(owner_id) {
                conn.cancel.cancel();
            }
        }
    }

    fn deliver(&self, owner_id: &str, frame: InboundFrame) -> bool {
        self.lock()
            .get(owner_id)
            .is_some_and(|conn| conn.inbound.send(frame).is_ok())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

struct SseChannel {
    tx: mpsc::Sender<SseFrame>,
    cancel: CancellationToken,
}

#[async_trait]
impl ClientChannel for SseChannel {
    async fn send(&self, envelope: WireEnvelope) -> Result<(), ChannelClosed> {
        if self.cancel.is_cancelled() {
            return Err(ChannelClosed);
        }
        let bytes = format_event(&envelope).ok_or(ChannelClosed)?;
        self.tx.send(SseFrame::Data(bytes)).await.map_err(|_| ChannelClosed)
    }

    async fn close(&self, code: u16, reason: &str) {
        let data = serde_json::json!({ "code": code, "reason": reason });
        let _ = self
            .tx
            .send(SseFrame::Data(Bytes::from(format!("event: close\ndata: {}\n\n", data))))
            .await;
        let _ = self.tx.send(SseFrame::End).await;
        self.cancel.cancel();
    }
}

/// One SSE event named after the envelope type.
fn format_event(envelope: &WireEnvelope) -> Option<Bytes> {
    let kind = serde_json::to_value(envelope.kind).ok()?;
    let json = serde_json::to_string(envelope).ok()?;
    Some(Bytes::from(format!("event: {}\ndata: {}\n\n", kind.as_str()?, json)))
}

/// `GET /api/v1/live/events`
pub async fn open_stream(req: HttpRequest, app_state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let owner_id = super::owner_id_from_request(&req)
        .ok_or_else(|| AppError::BadRequest("owner id is required (X-Owner-Id header or owner_id query)".to_string()))?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let registry = app_state.sse.clone();
    let connection_id = registry.register(&owner_id, inbound_tx, cancel.clone());
    info!(owner_id = %owner_id, "SSE stream opened");

    let channel = Arc::new(SseChannel {
        tx: tx.clone(),
        cancel: cancel.clone(),
    });
    let bridge = Arc::new(TransportBridge::new(app_state.orchestrator.clone(), owner_id.clone(), channel));
    let state = app_state.clone();
    state.increment_open_channels();
    {
        let registry = registry.clone();
        let owner_id = owner_id.clone();
        tokio::spawn(async move {
            bridge.run(inbound_rx).await;
            registry.remove(&owner_id, connection_id);
            state.decrement_open_channels();
            info!(owner_id = %owner_id, "SSE stream closed");
        });
    }
    tokio::spawn(keepalive(tx, cancel, registry, owner_id, connection_id));

    let stream = ReceiverStream::new(rx)
        .take_while(|frame| matches!(frame, SseFrame::Data(_)))
        .map(|frame| match frame {
            SseFrame::Data(bytes) => Ok::<_, Infallible>(bytes),
            SseFrame::End => Ok(Bytes::new()),
        });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(stream))
}

/// Comment frames keep proxies from idling the stream out. A failed write
/// means the client left: dropping the registry entry ends the bridge.
async fn keepalive(
    tx: mpsc::Sender<SseFrame>,
    cancel: CancellationToken,
    registry: SseRegistry,
    owner_id: String,
    connection_id: Uuid,
) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if tx.send(SseFrame::Data(Bytes::from_static(b": keepalive\n\n"))).await.is_err() {
                    debug!(owner_id = %owner_id, "SSE client went away");
                    break;
                }
            }
        }
    }
    registry.remove(&owner_id, connection_id);
}

/// `POST /api/v1/live/messages`: one client frame for the owner's open stream.
/// JSON bodies are text frames; `application/octet-stream` bodies are raw PCM16.
pub async fn post_message(req: HttpRequest, body: Bytes, app_state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let owner_id = super::owner_id_from_request(&req)
        .ok_or_else(|| AppError::BadRequest("owner id is required (X-Owner-Id header or owner_id query)".to_string()))?;

    let binary = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/octet-stream"));
    let frame = if binary {
        InboundFrame::Binary(body.to_vec())
    } else {
        let text = String::from_utf8(body.to_vec())
            .map_err(|_| AppError::BadRequest("message body must be UTF-8 JSON".to_string()))?;
        InboundFrame::Text(text)
    };

    if !app_state.sse.deliver(&owner_id, frame) {
        return Err(AppError::NotFound(format!("no open event stream for owner {}", owner_id)));
    }
    Ok(HttpResponse::Accepted().finish())
}
