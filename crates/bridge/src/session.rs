// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session store: token issuance, validation, renewal, and expiry.
//!
//! Tokens are 256-bit random values in URL-safe base64. The store keeps two
//! indexes (`token -> session`, `connection -> token`) behind one lock, so
//! after any mutation either both entries exist or both are gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identifies one WebSocket connection for the lifetime of the process.
pub type ConnectionId = u64;

/// Generate a session token: 32 random bytes, URL-safe, no padding.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// One authenticated client.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub connection: ConnectionId,
    pub client_id: Option<String>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub expires_at: Instant,
    /// Namespaced id of the scanner this session selected, if any.
    pub selected_scanner: Option<String>,
    /// Request id of the session's running scan job, if any.
    pub active_request: Option<String>,
    pub scanning: bool,
}

#[derive(Default)]
struct Inner {
    by_token: HashMap<String, Session>,
    by_connection: HashMap<ConnectionId, String>,
}

impl Inner {
    fn remove_token(&mut self, token: &str) -> Option<Session> {
        let session = self.by_token.remove(token)?;
        self.by_connection.remove(&session.connection);
        Some(session)
    }
}

/// Outcome of trying to mark a session as scanning.
#[derive(Debug, PartialEq, Eq)]
pub enum BeginScan {
    Started,
    /// The session already has a live job (its request id).
    Busy(String),
    UnknownSession,
}

/// Thread-safe owner of all session records.
pub struct SessionStore {
    ttl: Duration,
    max_sessions: usize,
    inner: Mutex<Inner>,
}

impl SessionStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self { ttl, max_sessions, inner: Mutex::new(Inner::default()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a session bound to `connection`. Returns `None` once the live
    /// session count has reached the configured maximum.
    pub fn create(&self, connection: ConnectionId, client_id: Option<String>) -> Option<Session> {
        let mut inner = self.inner.lock();
        if inner.by_token.len() >= self.max_sessions {
            return None;
        }
        // A reconnecting socket replaces its previous session.
        if let Some(token) = inner.by_connection.get(&connection).cloned() {
            inner.remove_token(&token);
        }
        let now = Instant::now();
        let session = Session {
            token: generate_token(),
            connection,
            client_id,
            created_at: now,
            last_activity: now,
            expires_at: now + self.ttl,
            selected_scanner: None,
            active_request: None,
            scanning: false,
        };
        inner.by_connection.insert(connection, session.token.clone());
        inner.by_token.insert(session.token.clone(), session.clone());
        Some(session)
    }

    /// Return the live session for `token`, refreshing its last-activity
    /// stamp. An expired entry is removed and reported as absent.
    pub fn validate(&self, token: &str) -> Option<Session> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired = match inner.by_token.get_mut(token) {
            Some(session) if now <= session.expires_at => {
                session.last_activity = now;
                return Some(session.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.remove_token(token);
            debug!("expired session removed on validation");
        }
        None
    }

    /// Extend a session's expiry to now + TTL.
    pub fn renew(&self, token: &str) -> Option<Session> {
        let mut inner = self.inner.lock();
        let session = inner.by_token.get_mut(token)?;
        let now = Instant::now();
        session.last_activity = now;
        session.expires_at = now + self.ttl;
        Some(session.clone())
    }

    pub fn by_connection(&self, connection: ConnectionId) -> Option<Session> {
        let inner = self.inner.lock();
        let token = inner.by_connection.get(&connection)?;
        inner.by_token.get(token).cloned()
    }

    /// Idempotent removal by token.
    pub fn remove(&self, token: &str) {
        self.inner.lock().remove_token(token);
    }

    /// Idempotent removal by connection; returns the removed session.
    pub fn remove_by_connection(&self, connection: ConnectionId) -> Option<Session> {
        let mut inner = self.inner.lock();
        let token = inner.by_connection.get(&connection).cloned()?;
        inner.remove_token(&token)
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .by_token
            .values()
            .filter(|s| now > s.expires_at)
            .map(|s| s.token.clone())
            .collect();
        for token in &expired {
            inner.remove_token(token);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the scanner a session selected.
    pub fn set_selected(&self, token: &str, scanner_id: &str) {
        if let Some(session) = self.inner.lock().by_token.get_mut(token) {
            session.selected_scanner = Some(scanner_id.to_owned());
        }
    }

    /// Atomically mark a session as scanning under `request_id`. A session
    /// holds at most one live job.
    pub fn begin_scan(&self, token: &str, request_id: &str) -> BeginScan {
        let mut inner = self.inner.lock();
        let Some(session) = inner.by_token.get_mut(token) else {
            return BeginScan::UnknownSession;
        };
        if session.scanning {
            return BeginScan::Busy(session.active_request.clone().unwrap_or_default());
        }
        session.scanning = true;
        session.active_request = Some(request_id.to_owned());
        BeginScan::Started
    }

    /// Clear a session's scan state, but only while it still belongs to
    /// `request_id`. Idempotent.
    pub fn end_scan(&self, token: &str, request_id: &str) {
        if let Some(session) = self.inner.lock().by_token.get_mut(token) {
            if session.active_request.as_deref() == Some(request_id) {
                session.scanning = false;
                session.active_request = None;
            }
        }
    }
}

/// Spawn the periodic sweep that evicts expired sessions.
pub fn spawn_sweeper(store: Arc<SessionStore>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let removed = store.sweep();
            if removed > 0 {
                info!(removed, "swept expired sessions");
            }
        }
    });
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
