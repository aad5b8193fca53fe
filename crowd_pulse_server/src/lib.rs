use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use crowd_pulse::{Channel, Monitor, Subscriber};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

/// A running server: the address it actually bound and its task.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub task: tokio::task::JoinHandle<()>,
}

type AppState = Arc<Monitor>;

/// Routes:
/// - `/ws/alerts`, `/ws/frames/:camera_id`, `/ws/instructions`, `/ws/live-map`
/// - `/healthz`, `/status`, `/zones`
pub fn router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/zones", get(zones))
        .route("/ws/alerts", get(|ws: WebSocketUpgrade, State(m): State<AppState>| async move {
            upgrade(ws, m, Channel::Alerts)
        }))
        .route("/ws/instructions", get(|ws: WebSocketUpgrade, State(m): State<AppState>| async move {
            upgrade(ws, m, Channel::Instructions)
        }))
        .route("/ws/live-map", get(|ws: WebSocketUpgrade, State(m): State<AppState>| async move {
            upgrade(ws, m, Channel::LiveMap)
        }))
        .route(
            "/ws/frames/:camera_id",
            get(|ws: WebSocketUpgrade, State(m): State<AppState>, Path(camera_id): Path<String>| async move {
                upgrade(ws, m, Channel::Frames(camera_id))
            }),
        )
        .with_state(monitor)
}

async fn status(State(monitor): State<AppState>) -> impl IntoResponse {
    Json(monitor.status())
}

async fn zones(State(monitor): State<AppState>) -> impl IntoResponse {
    Json(monitor.zones())
}

fn upgrade(ws: WebSocketUpgrade, monitor: AppState, channel: Channel) -> axum::response::Response {
    ws.on_upgrade(move |socket| ws_conn(socket, monitor, channel))
}

/// Pumps hub payloads into one socket until either side goes away.
async fn ws_conn(mut socket: WebSocket, monitor: AppState, channel: Channel) {
    let hub = Arc::clone(monitor.hub());
    let (subscriber, mut rx) = Subscriber::new(hub.subscriber_buffer());
    let id = subscriber.id();
    hub.subscribe(channel.clone(), subscriber);
    tracing::info!(channel = %channel.name(), subscriber = id, "websocket connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(payload) => {
                    if socket.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
                // pruned by the hub after a failed or slow send
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unsubscribe(&channel, id);
    tracing::info!(channel = %channel.name(), subscriber = id, "websocket disconnected");
}

pub async fn start_server(monitor: Arc<Monitor>, cfg: ServerConfig) -> anyhow::Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    let local_addr = listener.local_addr().context("listener has no local address")?;
    let app = router(monitor);

    let task = tokio::spawn(async move {
        tracing::info!("crowd_pulse server listening on http://{}", local_addr);
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "server stopped");
        }
    });
    Ok(ServerHandle { local_addr, task })
}
