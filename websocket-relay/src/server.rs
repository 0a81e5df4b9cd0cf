use std::{
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Serialize;
use tokio::{net::TcpListener, select};
use tower::ServiceExt;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::relay::{Payload, PeerId, PeerReceiver, Relay, RelayHandle};

/// HTTP front end: WebSocket upgrades on any path, a `/status` probe and the
/// static directory for every other request.
pub struct Server {
    listener: TcpListener,
    static_dir: PathBuf,
    relay: Relay,
    handle: RelayHandle,
}

impl Server {
    pub fn new(listener: TcpListener, static_dir: impl Into<PathBuf>) -> Self {
        let (relay, handle) = Relay::new();
        Self {
            listener,
            static_dir: static_dir.into(),
            relay,
            handle,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            static_dir,
            relay,
            handle,
        } = self;

        let relay_task = tokio::spawn(relay.run());
        let app = router(handle, &static_dir);

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("relay shutting down");
        })
        .await
        .context("relay server failed");

        // Upgraded sockets outlive the HTTP server. Stopping the relay drops
        // every peer queue, which closes their writers and sockets.
        relay_task.abort();
        served
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Clone)]
struct AppState {
    relay: RelayHandle,
    assets: ServeDir,
}

/// Upgrade requests are accepted on any path; `/ws` only exists for clients
/// that want a dedicated endpoint. Plain requests fall through to the static
/// directory.
pub fn router(relay: RelayHandle, static_dir: impl AsRef<Path>) -> Router {
    let state = AppState {
        relay,
        assets: ServeDir::new(static_dir),
    };

    Router::new()
        .route("/ws", get(upgrade))
        .route("/status", get(status))
        .fallback(upgrade_or_serve)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Status {
    peers: usize,
}

async fn status(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        peers: state.relay.peer_count(),
    })
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_peer(socket, remote, state.relay))
}

async fn upgrade_or_serve(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    request: Request,
) -> Response {
    if let Some(ws) = ws {
        return ws.on_upgrade(move |socket| serve_peer(socket, remote, state.relay));
    }

    match state.assets.oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

async fn serve_peer(socket: WebSocket, remote: SocketAddr, relay: RelayHandle) {
    let peer = match relay.connect() {
        Ok(peer) => peer,
        Err(err) => {
            warn!(%remote, error = %err, "dropping connection");
            return;
        }
    };
    let id = peer.id;
    info!(peer = id, %remote, "peer connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(forward_outbound(id, peer.inbox, sink));

    select! {
        result = relay_inbound(id, stream, &relay) => {
            if let Err(err) = result {
                debug!(peer = id, error = ?err, "peer read loop ended with error");
            }
        }
        _ = &mut writer => {
            debug!(peer = id, "peer writer stopped");
        }
    }

    writer.abort();
    // Nothing left to tell if the relay has already stopped.
    let _ = relay.disconnect(id);
    info!(peer = id, %remote, "peer disconnected");
}

async fn relay_inbound(
    id: PeerId,
    mut stream: SplitStream<WebSocket>,
    relay: &RelayHandle,
) -> Result<()> {
    while let Some(message) = stream.next().await {
        let payload = match message.context("failed to read from peer")? {
            Message::Text(text) => Payload::Text(text),
            Message::Binary(bytes) => Payload::Binary(bytes),
            // Pongs are queued by the transport itself.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                debug!(peer = id, ?frame, "peer sent close frame");
                break;
            }
        };

        info!(
            peer = id,
            kind = payload.kind(),
            bytes = payload.len(),
            "message received"
        );
        relay.publish(id, payload)?;
    }

    Ok(())
}

async fn forward_outbound(
    id: PeerId,
    mut inbox: PeerReceiver,
    mut sink: SplitSink<WebSocket, Message>,
) {
    while let Some(payload) = inbox.recv().await {
        if let Err(err) = sink.send(payload.into()).await {
            debug!(peer = id, error = ?err, "failed to deliver message to peer");
            return;
        }
    }

    let _ = sink.close().await;
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(bytes) => Message::Binary(bytes),
        }
    }
}
