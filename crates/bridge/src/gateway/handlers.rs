// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One handler per protocol action.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::gateway::Outbound;
use crate::protocol::{DeviceSettingsPatch, Frame, Request};
use crate::scanner::router::StartError;
use crate::scanner::settings::ScanSettings;
use crate::session::{BeginScan, ConnectionId, Session};
use crate::state::BridgeState;

/// Dispatch one parsed request. A `Some` frame is the immediate response;
/// `scan` answers `None` on success because its frames stream in later.
pub async fn dispatch(
    state: &Arc<BridgeState>,
    connection: ConnectionId,
    outbound: &Outbound,
    request: Request,
) -> Option<Frame> {
    let action = request.action();
    let request_id = request.request_id().to_owned();

    // Everything past authenticate/ping requires a live session.
    let session = match request {
        Request::Authenticate { .. } | Request::Ping { .. } => None,
        _ => match authorize(state, action, &request_id, request.token()) {
            Ok(session) => Some(session),
            Err(frame) => return Some(frame),
        },
    };

    match (request, session) {
        (Request::Authenticate { client_id, .. }, _) => {
            Some(authenticate(state, connection, &request_id, client_id))
        }
        (Request::Ping { token, .. }, _) => {
            // Unauthenticated, but a valid token still counts as activity.
            if let Some(token) = token {
                let _ = state.sessions.validate(&token);
            }
            Some(Frame::success("pong", &request_id).with_message("pong"))
        }
        (Request::ListScanners { settings, .. }, _) => {
            Some(list_scanners(state, &request_id, settings).await)
        }
        (Request::SelectScanner { settings, .. }, Some(session)) => {
            Some(select_scanner(state, &session, &request_id, settings).await)
        }
        (Request::GetCapabilities { .. }, _) => Some(get_capabilities(state, &request_id).await),
        (Request::GetDeviceCapabilities { .. }, _) => {
            Some(get_device_capabilities(state, &request_id).await)
        }
        (Request::ApplyDeviceSettings { patch, advanced, .. }, _) => {
            Some(apply_device_settings(state, &request_id, patch, advanced).await)
        }
        (Request::Scan { settings, .. }, Some(session)) => {
            scan(state, &session, outbound, &request_id, settings).await
        }
        (Request::StopScan { .. }, Some(session)) => {
            Some(stop_scan(state, &session, &request_id).await)
        }
        // The auth gate above produced a session for every remaining action.
        _ => Some(Frame::error(
            action,
            &request_id,
            ErrorCode::InternalError,
            "request routing failed",
        )),
    }
}

/// Resolve the session for an authenticated action, or the error frame to
/// answer with.
fn authorize(
    state: &BridgeState,
    action: &str,
    request_id: &str,
    token: Option<&str>,
) -> Result<Session, Frame> {
    let Some(token) = token else {
        return Err(Frame::error(action, request_id, ErrorCode::Unauthorized, "missing token"));
    };
    match state.sessions.validate(token) {
        Some(session) => Ok(session),
        None => Err(Frame::error(
            action,
            request_id,
            ErrorCode::InvalidToken,
            "invalid or expired token",
        )),
    }
}

fn authenticate(
    state: &BridgeState,
    connection: ConnectionId,
    request_id: &str,
    client_id: Option<String>,
) -> Frame {
    match state.sessions.create(connection, client_id) {
        Some(session) => {
            info!(connection, "session authenticated");
            let expires_at = (Utc::now() + state.sessions.ttl())
                .to_rfc3339_opts(SecondsFormat::Millis, true);
            let mut frame = Frame::success("authenticate", request_id);
            frame.token = Some(session.token);
            frame.expires_at = Some(expires_at);
            frame
        }
        None => {
            warn!(connection, "session cap reached, authentication refused");
            Frame::error(
                "authenticate",
                request_id,
                ErrorCode::InternalError,
                "maximum concurrent sessions reached",
            )
        }
    }
}

async fn list_scanners(
    state: &BridgeState,
    request_id: &str,
    settings: Option<ScanSettings>,
) -> Frame {
    let filter = settings.and_then(|s| s.protocols);
    let default_id = state.prefs.lock().default_device_id.clone();
    let devices = state.router.enumerate(filter.as_deref(), default_id.as_deref()).await;
    if devices.is_empty() {
        return Frame::error(
            "list_scanners",
            request_id,
            ErrorCode::NoScannersAvailable,
            "no scanners available",
        );
    }
    let mut frame = Frame::success("list_scanners", request_id);
    frame.scanners = Some(devices);
    frame
}

async fn select_scanner(
    state: &BridgeState,
    session: &Session,
    request_id: &str,
    settings: Option<ScanSettings>,
) -> Frame {
    let Some(device_id) = settings.and_then(|s| s.source) else {
        return Frame::error(
            "select_scanner",
            request_id,
            ErrorCode::InvalidRequest,
            "settings.source must name a scanner",
        );
    };
    match state.router.select(&device_id).await {
        Ok(active) => {
            let namespaced = active.namespaced_id();
            state.sessions.set_selected(&session.token, &namespaced);
            {
                let mut prefs = state.prefs.lock();
                prefs.default_device_id = Some(namespaced.clone());
                prefs.default_protocol = Some(active.protocol.to_owned());
                prefs.save(&state.state_dir);
            }
            info!(device = %namespaced, "scanner selected");
            let mut frame = Frame::success("select_scanner", request_id);
            frame.scanner_id = Some(namespaced);
            frame.protocol = Some(active.protocol.to_owned());
            frame
        }
        Err(e) => {
            debug!(device = %device_id, err = %e, "select failed");
            Frame::error(
                "select_scanner",
                request_id,
                ErrorCode::ScannerNotFound,
                format!("scanner not found: {device_id}"),
            )
        }
    }
}

async fn get_capabilities(state: &BridgeState, request_id: &str) -> Frame {
    let Some(active) = state.router.active() else {
        return Frame::error(
            "get_capabilities",
            request_id,
            ErrorCode::ScannerNotFound,
            "no scanner selected",
        );
    };
    let namespaced = active.namespaced_id();
    match state.router.capabilities_for(&namespaced).await {
        Some((id, snapshot)) => {
            let is_default =
                state.prefs.lock().default_device_id.as_deref() == Some(id.as_str());
            let mut frame = Frame::success("get_capabilities", request_id);
            frame.scanners = Some(vec![crate::scanner::router::DeviceInfo {
                name: active.local_id.clone(),
                id,
                is_default,
                protocol: active.protocol.to_owned(),
                capabilities: Some(snapshot),
            }]);
            frame
        }
        None => Frame::error(
            "get_capabilities",
            request_id,
            ErrorCode::ScannerNotFound,
            format!("device went away: {namespaced}"),
        ),
    }
}

async fn get_device_capabilities(state: &BridgeState, request_id: &str) -> Frame {
    match state.router.device_capabilities().await {
        Ok((active, capabilities)) => {
            let mut frame = Frame::success("get_device_capabilities", request_id);
            frame.scanner_id = Some(active.namespaced_id());
            frame.protocol = Some(active.protocol.to_owned());
            frame.capabilities = Some(capabilities);
            frame
        }
        Err(e) => Frame::error(
            "get_device_capabilities",
            request_id,
            ErrorCode::ScannerNotFound,
            e.to_string(),
        ),
    }
}

async fn apply_device_settings(
    state: &BridgeState,
    request_id: &str,
    patch: Option<DeviceSettingsPatch>,
    advanced: Option<serde_json::Map<String, serde_json::Value>>,
) -> Frame {
    let patch = patch.unwrap_or_default();
    if patch.is_empty() && advanced.as_ref().map_or(true, |a| a.is_empty()) {
        return Frame::error(
            "apply_device_settings",
            request_id,
            ErrorCode::InvalidRequest,
            "nothing to apply",
        );
    }
    match state.router.apply_patch(&patch, advanced.as_ref()).await {
        Ok((active, results)) => {
            let busy = results.len() == 1 && results[0].key == "scan";
            let mut frame = if busy {
                Frame::error(
                    "apply_device_settings",
                    request_id,
                    ErrorCode::ScannerBusy,
                    "scan in progress",
                )
            } else {
                Frame::success("apply_device_settings", request_id)
            };
            frame.scanner_id = Some(active.namespaced_id());
            frame.protocol = Some(active.protocol.to_owned());
            frame.results = Some(results);
            frame
        }
        Err(e) => Frame::error(
            "apply_device_settings",
            request_id,
            ErrorCode::ScannerNotFound,
            e.to_string(),
        ),
    }
}

async fn scan(
    state: &Arc<BridgeState>,
    session: &Session,
    outbound: &Outbound,
    request_id: &str,
    settings: Option<ScanSettings>,
) -> Option<Frame> {
    // One live job per session.
    match state.sessions.begin_scan(&session.token, request_id) {
        BeginScan::Started => {}
        BeginScan::Busy(holder) => {
            return Some(Frame::error(
                "scan",
                request_id,
                ErrorCode::ScannerBusy,
                format!("session already scanning (request {holder})"),
            ));
        }
        BeginScan::UnknownSession => {
            return Some(Frame::error(
                "scan",
                request_id,
                ErrorCode::InvalidToken,
                "session disappeared",
            ));
        }
    }

    let mut settings = settings.unwrap_or_default();
    settings.canonicalize();
    if let Err(reason) = settings.validate() {
        state.sessions.end_scan(&session.token, request_id);
        return Some(Frame::error("scan", request_id, ErrorCode::InvalidRequest, reason));
    }

    // The seat is global; fall back to the session's own selection when no
    // device is open yet.
    if state.router.active().is_none() {
        if let Some(ref selected) = session.selected_scanner {
            if let Err(e) = state.router.select(selected).await {
                debug!(device = %selected, err = %e, "reselect before scan failed");
            }
        }
    }
    if state.router.active().is_none() {
        state.sessions.end_scan(&session.token, request_id);
        return Some(Frame::error(
            "scan",
            request_id,
            ErrorCode::ScannerNotFound,
            "no scanner selected",
        ));
    }

    if let Err(e) = state.router.apply_settings(&settings).await {
        state.sessions.end_scan(&session.token, request_id);
        return Some(Frame::scan_error(
            request_id,
            ErrorCode::ScanFailed,
            "could not apply scan settings",
            Some(e.to_string()),
        ));
    }

    // Bind the job before starting so the first page cannot outrun the
    // registration.
    state.registry.register(request_id, session.token.clone(), outbound.clone());

    match state.router.start(request_id).await {
        Ok(()) => {
            info!(request_id = %request_id, "scan started");
            None
        }
        Err(e) => {
            state.registry.unregister(request_id);
            state.sessions.end_scan(&session.token, request_id);
            match e {
                StartError::Busy { holder } => Some(Frame::error(
                    "scan",
                    request_id,
                    ErrorCode::ScannerBusy,
                    format!("scanner busy with request {holder}"),
                )),
                StartError::NoDevice => Some(Frame::error(
                    "scan",
                    request_id,
                    ErrorCode::ScannerNotFound,
                    "no scanner selected",
                )),
                StartError::Backend(err) => Some(Frame::scan_error(
                    request_id,
                    ErrorCode::ScanFailed,
                    err.to_string(),
                    None,
                )),
            }
        }
    }
}

async fn stop_scan(state: &BridgeState, session: &Session, request_id: &str) -> Frame {
    if let Some(ref active) = session.active_request {
        // Unregister first: a terminal event racing the stop must not reach
        // the client after the cancellation acknowledgment.
        state.registry.unregister(active);
        state.router.stop().await;
        state.sessions.end_scan(&session.token, active);
        info!(request_id = %active, "scan cancelled");
    } else {
        debug!("stop_scan with no active job");
    }
    Frame::cancelled("stop_scan", request_id)
}
