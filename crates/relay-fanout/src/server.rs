use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, trace, warn};

use relay_core::{ConnectionId, NotificationPacket};
use relay_settings::RelaySettings;
use relay_store::SessionStore;
use relay_transport::{Channel, Listener};

use crate::error::{FanoutError, Result};
use crate::service::{FanoutService, Outbound};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FanoutService>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/websocket", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params.token, state))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.service.session_count(),
        "connections": state.service.connection_count(),
    }))
}

async fn handle_socket(socket: WebSocket, token: Option<String>, state: AppState) {
    let service = state.service;
    let (connection, rx) = service.connect();
    info!(connection_id = %connection, "websocket client connected");

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        let _ = service.authenticate(&connection, &token).await;
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, connection.clone()));

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = &mut writer => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    service.handle_client_text(&connection, text.as_str()).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %connection, error = %e, "websocket read failed");
                    break;
                }
            },
        }
    }

    service.disconnect(&connection);
    if !writer.is_finished() {
        writer.abort();
    }
    info!(connection_id = %connection, "websocket client disconnected");
}

/// Forward queued packets to the socket with a periodic ping. Ends on `Close`
/// or when the service drops the connection's sender.
async fn write_loop<S>(mut ws_tx: S, mut rx: mpsc::Receiver<Outbound>, connection: ConnectionId)
where
    S: futures::Sink<WsMessage> + Unpin,
{
    let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(Outbound::Text(text)) => {
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                    break;
                }
                trace!(connection_id = %connection, "sent ping");
            }
        }
    }
}

/// Deliver every packet arriving on the notification channel until `cancel` fires.
pub async fn relay_notifications(
    service: Arc<FanoutService>,
    mut listener: Listener,
    cancel: CancellationToken,
) {
    info!(addr = %listener.local_addr(), "relaying notifications");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            packet = listener.recv::<NotificationPacket>() => match packet {
                Some(packet) => {
                    service.deliver(packet);
                }
                None => break,
            },
        }
    }
    listener.close();
}

/// Bind the notification channel and the websocket server, and serve until `cancel` fires.
pub async fn run_fanout(
    settings: &RelaySettings,
    store: Arc<dyn SessionStore>,
    cancel: CancellationToken,
) -> Result<()> {
    let service = Arc::new(FanoutService::new(
        store,
        settings.fanout.max_sessions,
        settings.fanout.send_queue,
    ));

    let listener = Listener::bind(
        Channel::Notifications,
        Channel::Notifications.endpoint(&settings.endpoints),
    )
    .await?;
    let addr = settings.fanout.listen_addr.clone();
    let tcp = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| FanoutError::Bind { addr: addr.clone(), source })?;
    info!(addr = %tcp.local_addr()?, "fan-out server started");

    let relay_cancel = cancel.child_token();
    let relay = tokio::spawn(relay_notifications(Arc::clone(&service), listener, relay_cancel.clone()));

    let router = build_router(AppState {
        service,
        shutdown: cancel.clone(),
    });
    let shutdown = cancel.clone();
    let served = axum::serve(tcp, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    relay_cancel.cancel();
    if let Err(e) = relay.await {
        warn!(error = %e, "notification relay task failed");
    }
    info!("fan-out server stopped");
    served.map_err(FanoutError::from)
}
