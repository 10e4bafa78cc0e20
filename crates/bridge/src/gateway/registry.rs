// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-job handler registry and the router-event dispatcher.
//!
//! A scan registers its `request_id` here before the router starts the
//! backend; the dispatcher task routes every page and terminal event to the
//! originating session only. Unregistering first is what lets `stop_scan`
//! suppress a late terminal event racing the cancellation acknowledgment.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::gateway::Outbound;
use crate::protocol::Frame;
use crate::scanner::{BackendEvent, ScanEvent};
use crate::state::BridgeState;

/// The binding between a running job and the session that asked for it.
pub struct JobBinding {
    pub token: String,
    pub outbound: Outbound,
    /// Pages delivered so far; ordinals must continue the sequence.
    pub pages: u32,
}

/// Registry of live jobs keyed by `request_id`. Registration and removal
/// are idempotent.
#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<HashMap<String, JobBinding>>,
}

impl JobRegistry {
    /// Bind a job. A second registration under the same id is ignored.
    pub fn register(&self, request_id: &str, token: String, outbound: Outbound) {
        self.inner
            .lock()
            .entry(request_id.to_owned())
            .or_insert(JobBinding { token, outbound, pages: 0 });
    }

    /// Release a job binding. Idempotent; returns the binding if it existed.
    pub fn unregister(&self, request_id: &str) -> Option<JobBinding> {
        self.inner.lock().remove(request_id)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn the task that fans router events out to the owning sessions.
pub fn spawn_dispatcher(state: Arc<BridgeState>, mut events: mpsc::Receiver<ScanEvent>) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            dispatch_event(&state, event);
        }
    });
}

fn dispatch_event(state: &BridgeState, event: ScanEvent) {
    let ScanEvent { protocol, event } = event;
    match event {
        BackendEvent::Page { request_id, bytes, mut meta, ordinal } => {
            let outbound = {
                let mut inner = state.registry.inner.lock();
                let Some(binding) = inner.get_mut(&request_id) else {
                    debug!(request_id = %request_id, "page for unregistered job dropped");
                    return;
                };
                if ordinal != binding.pages + 1 {
                    warn!(
                        request_id = %request_id,
                        expected = binding.pages + 1,
                        got = ordinal,
                        "page ordinal out of sequence"
                    );
                }
                binding.pages = ordinal;
                binding.outbound.clone()
            };

            let (bytes, format) = state.recompressor.process(bytes, &meta.format);
            meta.format = format;
            meta.size = bytes.len();
            let data = BASE64.encode(&bytes);
            debug!(
                request_id = %request_id,
                backend = protocol,
                page = ordinal,
                bytes = meta.size,
                "page delivered"
            );
            let frame = Frame::page("scan", &request_id, meta, data, ordinal);
            let _ = outbound.send(frame.to_json());
        }
        BackendEvent::Completed { request_id, total_pages } => {
            let Some(binding) = state.registry.unregister(&request_id) else {
                debug!(request_id = %request_id, "terminal for unregistered job suppressed");
                return;
            };
            state.sessions.end_scan(&binding.token, &request_id);
            debug!(request_id = %request_id, backend = protocol, total_pages, "scan completed");
            let _ = binding.outbound.send(Frame::completed("scan", &request_id, total_pages).to_json());
        }
        BackendEvent::Error { request_id, message } => {
            let Some(binding) = state.registry.unregister(&request_id) else {
                debug!(request_id = %request_id, "terminal for unregistered job suppressed");
                return;
            };
            state.sessions.end_scan(&binding.token, &request_id);
            warn!(request_id = %request_id, backend = protocol, err = %message, "scan failed");
            let frame = Frame::scan_error(
                &request_id,
                ErrorCode::ScanFailed,
                "scan failed",
                Some(message),
            );
            let _ = binding.outbound.send(frame.to_json());
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
