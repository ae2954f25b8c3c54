//! # WebSocket Transport
//!
//! One actix actor per client socket. The actor only moves frames: inbound
//! frames go to the [`TransportBridge`] task in arrival order, outbound
//! envelopes come back as actor messages and are written with `ctx.text`.
//!
//! ## Connection lifecycle:
//! 1. `GET /ws/live?owner_id=...` upgrades and starts a [`ClientSocket`]
//! 2. `started()` spawns the bridge and the heartbeat timer
//! 3. Client frames are forwarded until close, protocol error or heartbeat timeout
//! 4. `stopped()` drops the inbound sender; the bridge then ends the session

use super::{ChannelClosed, ClientChannel, InboundFrame, TransportBridge};
use crate::error::AppError;
use crate::state::AppState;
use crate::transport::envelope::WireEnvelope;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Actor owning one client WebSocket.
pub struct ClientSocket {
    app_state: web::Data<AppState>,
    owner_id: String,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    /// Last time the client proved it is alive
    last_heartbeat: Instant,
    inbound: Option<mpsc::UnboundedSender<InboundFrame>>,
}

impl ClientSocket {
    pub fn new(app_state: web::Data<AppState>, owner_id: String) -> Self {
        let config = app_state.get_config();
        Self {
            app_state,
            owner_id,
            heartbeat_interval: Duration::from_secs(config.server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.server.client_timeout_secs),
            last_heartbeat: Instant::now(),
            inbound: None,
        }
    }

    fn forward(&mut self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self.inbound.as_ref().is_some_and(|tx| tx.send(frame).is_ok());
        if !delivered {
            debug!(owner_id = %self.owner_id, "Bridge gone, closing socket");
            ctx.stop();
        }
    }
}

/// An envelope for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(String);

#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket {
    code: u16,
    reason: String,
}

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(owner_id = %self.owner_id, "WebSocket connection started");
        self.app_state.increment_open_channels();

        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound = Some(tx);
        let channel = Arc::new(SocketChannel { addr: ctx.address() });
        let bridge = Arc::new(TransportBridge::new(
            self.app_state.orchestrator.clone(),
            self.owner_id.clone(),
            channel,
        ));
        tokio::spawn(bridge.run(rx));

        let timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(owner_id = %act.owner_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(owner_id = %self.owner_id, "WebSocket connection stopped");
        self.app_state.decrement_open_channels();
        // Closing the inbound queue lets the bridge end the session.
        self.inbound.take();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(InboundFrame::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(InboundFrame::Binary(data.to_vec()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(owner_id = %self.owner_id, "WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(owner_id = %self.owner_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(owner_id = %self.owner_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSocket> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::from(msg.code),
            description: Some(msg.reason),
        }));
        ctx.stop();
    }
}

/// Bridge-facing handle that writes through the actor's mailbox.
struct SocketChannel {
    addr: Addr<ClientSocket>,
}

#[async_trait]
impl ClientChannel for SocketChannel {
    async fn send(&self, envelope: WireEnvelope) -> Result<(), ChannelClosed> {
        let json = serde_json::to_string(&envelope).map_err(|e| {
            error!("Failed to serialize envelope: {}", e);
            ChannelClosed
        })?;
        self.addr.send(Outbound(json)).await.map_err(|_| ChannelClosed)
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .addr
            .send(CloseSocket {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Resolves the owner from the `X-Owner-Id` header or `owner_id` query
/// parameter, then hands the connection to a [`ClientSocket`] actor.
pub async fn live_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let owner_id = super::owner_id_from_request(&req)
        .ok_or_else(|| AppError::BadRequest("owner id is required (X-Owner-Id header or owner_id query)".to_string()))?;
    info!(
        owner_id = %owner_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    ws::start(ClientSocket::new(app_state, owner_id), &req, stream)
}
