// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket gateway: the two listeners, per-connection frame handling,
//! request dispatch, and the per-job event registry.

pub mod handlers;
pub mod registry;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::state::BridgeState;

/// Queue of serialized frames bound for one connection's writer task.
pub type Outbound = mpsc::UnboundedSender<String>;

/// Per-listener context handed to the WS handler.
#[derive(Clone)]
pub struct GatewayCtx {
    pub state: Arc<BridgeState>,
    pub tls: bool,
}

/// Build the single-route router both listeners serve.
pub fn build_router(state: Arc<BridgeState>, tls: bool) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(GatewayCtx { state, tls })
}

/// Serve the plaintext listener until shutdown.
pub async fn serve_ws(state: Arc<BridgeState>, listener: TcpListener) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let router = build_router(state, false);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Serve the TLS listener: a manual accept loop feeding the same router
/// through hyper's connection builder (WebSocket upgrades included).
pub async fn serve_wss(
    state: Arc<BridgeState>,
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);
    let shutdown = state.shutdown.clone();
    let app = build_router(state, true);

    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(err = %e, "TLS accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tcp.set_nodelay(true);
            let tls_stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(peer = %peer, err = %e, "TLS handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(app);
            let builder = ConnBuilder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(io, service);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = conn => {
                    if let Err(e) = result {
                        debug!(peer = %peer, err = %e, "TLS connection ended with error");
                    }
                }
            }
        });
    }
    Ok(())
}
