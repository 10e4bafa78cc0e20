// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection WebSocket lifecycle.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ErrorCode;
use crate::gateway::{handlers, GatewayCtx, Outbound};
use crate::protocol::{decode_frame, Decoded, Frame};
use crate::session::ConnectionId;
use crate::state::{BridgeState, UiEvent};

/// `GET /` — WebSocket upgrade on either listener.
pub async fn ws_handler(
    State(ctx): State<GatewayCtx>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(ctx, socket))
}

async fn handle_socket(ctx: GatewayCtx, socket: WebSocket) {
    let GatewayCtx { state, tls } = ctx;
    let connection = state.next_connection_id();
    info!(connection, tls, "client connected");
    state.notify_ui(UiEvent::Connected { tls });

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // Writer half: everything bound for this client funnels through one
    // queue, which fixes the per-session ordering of responses and pages.
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let shutdown = state.shutdown.clone();
    let mut read_errors = 0u32;
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                read_errors = 0;
                handle_frame(&state, connection, &out_tx, text.as_str()).await;
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(connection, "binary frame discarded (text-only protocol)");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // ping/pong, handled by the stack
            Some(Err(e)) => {
                // Transport-level hiccup: keep the connection unless the
                // stream keeps failing.
                read_errors += 1;
                debug!(connection, err = %e, "read error");
                if read_errors >= 3 {
                    break;
                }
            }
        }
    }

    writer.abort();
    if let Some(session) = state.sessions.remove_by_connection(connection) {
        // A job orphaned by the disconnect stops delivering immediately and
        // releases the device if it still holds the seat.
        if let Some(ref request_id) = session.active_request {
            state.registry.unregister(request_id);
            if state.router.active_job().as_deref() == Some(request_id.as_str()) {
                state.router.stop().await;
            }
            debug!(connection, request_id = %request_id, "orphaned job released");
        }
        debug!(connection, "session removed on disconnect");
    }
    info!(connection, "client disconnected");
}

async fn handle_frame(
    state: &Arc<BridgeState>,
    connection: ConnectionId,
    outbound: &Outbound,
    text: &str,
) {
    match decode_frame(text) {
        Decoded::WakeUp => {
            debug!(connection, "legacy wake-up frame");
            state.notify_ui(UiEvent::WakeUp);
        }
        Decoded::Invalid { request_id, reason } => {
            debug!(connection, reason = %reason, "invalid frame");
            let frame = Frame::error(
                "unknown",
                request_id.as_deref().unwrap_or_default(),
                ErrorCode::InvalidRequest,
                format!("invalid request: {reason}"),
            );
            let _ = outbound.send(frame.to_json());
        }
        Decoded::Request(request) => {
            if let Some(frame) = handlers::dispatch(state, connection, outbound, *request).await {
                let _ = outbound.send(frame.to_json());
            }
        }
    }
}
