//! WebSocket gateway
//!
//! One listener serves two client populations, told apart by request path:
//! stations connect at `ws://<host>:<port>/ocpp/{charge_point_id}` (or
//! `/{charge_point_id}`) with the `ocpp1.6` subprotocol, observers
//! (dashboard, SCADA bridge) at `/dashboard` or `/scada`. A path that fits
//! neither is treated as a station with a port-derived fallback id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandRelay, RemoteCommand};
use crate::config::AppConfig;
use crate::domain::{ChargePointStatus, ChargeSpeed, ElectricalParams};
use crate::events::{Direction, ObserverEvent, SharedObserverHub};
use crate::forwarder::Forwarder;
use crate::handlers::OcppHandler;
use crate::session::{DetachOutcome, SharedSessionRegistry};
use crate::storage::Storage;
use crate::support::ShutdownSignal;
use crate::tags::{SharedTagBridge, Tag, TagBridge, TagValue};

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Who is on the other end of an accepted socket.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientKind {
    Station(String),
    Observer,
}

pub struct CsmsServer {
    config: AppConfig,
    registry: SharedSessionRegistry,
    storage: Arc<dyn Storage>,
    hub: SharedObserverHub,
    tags: SharedTagBridge,
    relay: Arc<CommandRelay>,
    shutdown: ShutdownSignal,
}

impl CsmsServer {
    pub fn new(
        config: AppConfig,
        registry: SharedSessionRegistry,
        storage: Arc<dyn Storage>,
        hub: SharedObserverHub,
        tags: SharedTagBridge,
        relay: Arc<CommandRelay>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            registry,
            storage,
            hub,
            tags,
            relay,
            shutdown,
        }
    }

    /// Bind and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let addr = self.config.server.address();
        let listener = TcpListener::bind(&addr).await?;
        info!("OCPP 1.6 central system listening on ws://{}", addr);
        info!(
            "Charge points connect to ws://{}/ocpp/{{charge_point_id}}, observers to /dashboard",
            addr
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = server.handle_connection(stream, peer).await {
                                    error!(%peer, error = %err, "Connection error");
                                }
                            });
                        }
                        Err(err) => error!(error = %err, "Failed to accept connection"),
                    }
                }
                _ = self.shutdown.wait() => {
                    info!("Gateway received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut kind: Option<ClientKind> = None;

        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, mut response: Response| {
                let path = req.uri().path();
                debug!(%peer, path, "WebSocket handshake");
                kind = Some(classify_path(path, peer.port()));

                let requested = req
                    .headers()
                    .get("Sec-WebSocket-Protocol")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                let supports_ocpp16 = requested
                    .split(',')
                    .map(str::trim)
                    .any(|p| p == OCPP_SUBPROTOCOL);
                if supports_ocpp16 {
                    if let Ok(value) = OCPP_SUBPROTOCOL.parse() {
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", value);
                    }
                }
                Ok(response)
            },
        )
        .await?;

        match kind.unwrap_or(ClientKind::Observer) {
            ClientKind::Station(id) => self.handle_station(ws_stream, id, peer).await,
            ClientKind::Observer => self.handle_observer(ws_stream, peer).await,
        }
        Ok(())
    }

    // ── Stations ───────────────────────────────────────────────

    async fn handle_station(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        station_id: String,
        peer: SocketAddr,
    ) {
        if self.registry.is_provisioning(&station_id) {
            warn!(station_id, %peer, "Rejecting connection while station is provisioning");
            return;
        }
        let fresh = !self.registry.contains(&station_id);
        if fresh && !self.registry.begin_provisioning(&station_id) {
            warn!(station_id, %peer, "Rejecting duplicate provisioning attempt");
            return;
        }

        info!(station_id, %peer, "Station connected");
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let responder = tx.clone();

        let outcome = self.registry.attach(&station_id, tx).await;
        let session = outcome.session.clone();

        if fresh {
            self.tags.create_tags_for(&station_id).await;
            self.spawn_forwarder(&station_id, &session).await;
            self.registry.end_provisioning(&station_id);
        }
        if outcome.reattached {
            if let Err(err) = self.storage.record_heartbeat(&station_id).await {
                debug!(station_id, error = %err, "Reattached station not yet persisted");
            }
        }

        {
            let inner = session.lock().await;
            self.hub.broadcast(&ObserverEvent::Connect {
                id: station_id.clone(),
                state: inner.state.snapshot(&station_id),
            });
        }

        let handler = OcppHandler::new(
            session.clone(),
            self.storage.clone(),
            self.hub.clone(),
            self.tags.clone(),
            Duration::from_millis(self.config.simulation.settle_delay_ms),
            self.config.server.heartbeat_interval,
        );

        // writer: drains the session's outbound queue
        let writer_id = station_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(err) = ws_sender.send(Message::Text(text)).await {
                    debug!(station_id = %writer_id, error = %err, "Station write failed");
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = outcome.superseded.notified() => {
                    info!(station_id, "Connection superseded by a newer one");
                    break;
                }
                _ = self.shutdown.wait() => {
                    info!(station_id, "Closing station connection on shutdown");
                    break;
                }
                message = ws_receiver.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(conn) = session.lock().await.connection.as_mut() {
                            conn.touch();
                        }
                        if let Some(response) = handler.handle(&text).await {
                            if responder.send(response).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(data))) => {
                        warn!(station_id, bytes = data.len(), "Ignoring binary message");
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => {
                        debug!(station_id, error = %err, "Station socket error");
                        break;
                    }
                },
            }
        }
        writer.abort();

        match self.registry.detach(&station_id, outcome.connection_id).await {
            DetachOutcome::Stale => {}
            DetachOutcome::Kept => {
                // transaction still open: the session idles soft-offline
                self.hub.broadcast(&ObserverEvent::Status {
                    id: station_id.clone(),
                    status: ChargePointStatus::Unavailable.as_str().to_string(),
                    electrical_params: ElectricalParams::zero().to_value(),
                });
                self.tags
                    .set_value(&station_id, Tag::Status, TagValue::Text("Offline".into()))
                    .await;
                info!(station_id, "Station offline with open transaction, session kept");
            }
            DetachOutcome::Removed => {
                if let Err(err) = self
                    .storage
                    .update_status(&station_id, ChargePointStatus::Unavailable)
                    .await
                {
                    debug!(station_id, error = %err, "Disconnected station not persisted");
                }
                self.hub.broadcast(&ObserverEvent::Disconnect {
                    id: station_id.clone(),
                    hard_delete: None,
                });
                self.tags
                    .set_value(&station_id, Tag::Status, TagValue::Text("Offline".into()))
                    .await;
                info!(station_id, "Station disconnected");
            }
        }
    }

    /// Attach the configured forwarding process to a fresh session. Its
    /// stdout lines are injected toward the station as server frames.
    async fn spawn_forwarder(&self, station_id: &str, session: &Arc<crate::session::Session>) {
        let Some(command) = &self.config.forwarder.command else {
            return;
        };
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
        let forwarder = match Forwarder::spawn(command, station_id, frames_tx) {
            Ok(fw) => fw,
            Err(err) => {
                warn!(station_id, error = %err, "Failed to spawn forwarder process");
                return;
            }
        };
        session.lock().await.forwarder = Some(forwarder);

        let session = session.clone();
        let hub = self.hub.clone();
        let id = station_id.to_string();
        tokio::spawn(async move {
            while let Some(line) = frames_rx.recv().await {
                let inner = session.lock().await;
                if let Ok(value) = serde_json::from_str(&line) {
                    hub.log_traffic(&id, Direction::Outgoing, &value);
                }
                if !inner.send_raw(line) {
                    debug!(station_id = %id, "Dropping forwarder frame, station offline");
                }
            }
        });
    }

    // ── Observers ──────────────────────────────────────────────

    async fn handle_observer(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        peer: SocketAddr,
    ) {
        info!(%peer, "Observer connected");
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let observer_id = self.hub.add(tx);

        self.hub.send_to(
            observer_id,
            &ObserverEvent::FullStatus {
                charge_points: self.full_status().await,
            },
        );

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                message = ws_receiver.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_observer_command(observer_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%peer, error = %err, "Observer socket error");
                        break;
                    }
                },
            }
        }

        writer.abort();
        self.hub.remove(observer_id);
        info!(%peer, "Observer disconnected");
    }

    async fn handle_observer_command(&self, observer_id: u64, text: &str) {
        let command: RemoteCommand = match serde_json::from_str(text) {
            Ok(command) => command,
            Err(err) => {
                self.hub.send_to(
                    observer_id,
                    &command_error_event("-", format!("invalid command: {err}")),
                );
                return;
            }
        };
        let station_id = command.charge_point_id.clone();
        if let Err(err) = self.relay.dispatch(command).await {
            self.hub
                .send_to(observer_id, &command_error_event(&station_id, err.to_string()));
        }
    }

    /// Persisted stations merged with live session state. A session that is
    /// soft-offline shows as `Unavailable` regardless of its internal
    /// status.
    async fn full_status(&self) -> Vec<serde_json::Value> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        let stations = self.storage.list_stations().await.unwrap_or_default();
        for station in stations {
            seen.insert(station.id.clone());
            out.push(self.station_view(&station.id, Some(&station)).await);
        }
        for session in self.registry.snapshot() {
            if seen.insert(session.id.clone()) {
                out.push(self.station_view(&session.id, None).await);
            }
        }
        out
    }

    async fn station_view(
        &self,
        id: &str,
        persisted: Option<&crate::domain::ChargePoint>,
    ) -> serde_json::Value {
        if let Some(session) = self.registry.get(id) {
            let inner = session.lock().await;
            let mut view = inner.state.snapshot(id);
            let connected = inner.is_connected();
            let status = inner.state.status;
            let speed = inner.state.charge_speed.unwrap_or(ChargeSpeed::Normal);
            drop(inner);

            if !connected {
                view["status"] =
                    serde_json::json!(ChargePointStatus::Unavailable);
            }
            let params = if connected {
                ElectricalParams::compute(status, speed)
            } else {
                ElectricalParams::zero()
            };
            view["connected"] = serde_json::json!(connected);
            view["electricalParams"] = params.to_value();
            return view;
        }

        let (vendor, model) = persisted
            .map(|p| (p.vendor.clone(), p.model.clone()))
            .unwrap_or_default();
        serde_json::json!({
            "id": id,
            "vendor": vendor,
            "model": model,
            "status": ChargePointStatus::Offline,
            "connected": false,
            "transactionId": null,
            "electricalParams": ElectricalParams::zero().to_value(),
        })
    }
}

/// A rejected observer command, reported only to its issuer as an entry for
/// the log pane.
fn command_error_event(station_id: &str, message: String) -> ObserverEvent {
    ObserverEvent::Log {
        charge_point_id: station_id.to_string(),
        direction: Direction::Outgoing,
        message: serde_json::json!({ "error": message }),
        timestamp: chrono::Utc::now(),
    }
}

/// Classify a request path: observers on the named endpoints, everything
/// else a station id, with a port-derived fallback for an empty path.
fn classify_path(path: &str, port: u16) -> ClientKind {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    match trimmed {
        "dashboard" | "scada" => return ClientKind::Observer,
        _ => {}
    }
    ClientKind::Station(extract_station_id(path).unwrap_or_else(|| format!("CP_{port}")))
}

/// Extract the station id from `/ocpp/{id}` or `/{id}`.
fn extract_station_id(path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');

    if let Some(id) = path.strip_prefix("ocpp/") {
        let id = id.trim_start_matches('/').trim_end_matches('/');
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }

    let path = path.trim_end_matches('/');
    if !path.is_empty() && !path.contains('/') {
        return Some(path.to_string());
    }
    None
}
