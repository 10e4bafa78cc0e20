// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::gateway::registry::JobRegistry;
use crate::prefs::UserPrefs;
use crate::recompress::Recompressor;
use crate::scanner::router::ScannerRouter;
use crate::session::{ConnectionId, SessionStore};

/// Events surfaced to the desktop collaborator (tray UI), when one is
/// attached. The daemon itself only publishes.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// A client sent the legacy wake-up frame.
    WakeUp,
    /// A connection was opened (plain or TLS).
    Connected { tls: bool },
    /// An unrecoverable error worth telling the user about.
    Fatal { message: String },
}

/// Shared daemon state.
pub struct BridgeState {
    pub config: BridgeConfig,
    pub sessions: Arc<SessionStore>,
    pub router: ScannerRouter,
    pub registry: JobRegistry,
    pub recompressor: Recompressor,
    pub prefs: Mutex<UserPrefs>,
    pub state_dir: PathBuf,
    pub ui_events: broadcast::Sender<UiEvent>,
    pub shutdown: CancellationToken,
    next_connection_id: AtomicU64,
}

impl BridgeState {
    pub fn new(
        config: BridgeConfig,
        router: ScannerRouter,
        state_dir: PathBuf,
        shutdown: CancellationToken,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(config.token_ttl(), config.max_sessions));
        let recompressor =
            Recompressor::new(config.recompress_threshold_bytes, config.jpeg_quality);
        let prefs = Mutex::new(UserPrefs::load(&state_dir));
        let (ui_events, _) = broadcast::channel(16);
        Self {
            config,
            sessions,
            router,
            registry: JobRegistry::default(),
            recompressor,
            prefs,
            state_dir,
            ui_events,
            shutdown,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to UI-bound events.
    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_events.subscribe()
    }

    /// Publish a UI-bound event; silently dropped with no subscriber.
    pub fn notify_ui(&self, event: UiEvent) {
        let _ = self.ui_events.send(event);
    }
}
