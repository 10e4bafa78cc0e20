// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unified facade over the registered backends.
//!
//! The router owns the single-seat active device cell, namespaces device ids
//! as `<backend>:<local-id>`, and fans each backend's event channel into one
//! outbound stream tagged with the backend name.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::scanner::capability::{
    Capability, CapabilitySnapshot, FieldResult, CAP_DPI, CAP_DUPLEX, CAP_MAX_PAGES,
    CAP_PAPER_SIZE, CAP_PIXEL_TYPE, CAP_SHOW_UI, CAP_USE_ADF,
};
use crate::protocol::DeviceSettingsPatch;
use crate::scanner::settings::{PixelType, ScanSettings};
use crate::scanner::{
    BackendEvent, EventSink, ScanEvent, ScannerBackend, EVENT_CHANNEL_DEPTH, VENDOR_TAG,
};

/// A device as clients see it: namespaced id plus the owning backend tag.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub id: String,
    pub is_default: bool,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitySnapshot>,
}

/// Why an acquisition could not start.
#[derive(Debug)]
pub enum StartError {
    /// No device is selected.
    NoDevice,
    /// Another job holds the device seat.
    Busy { holder: String },
    /// The selected backend refused to start.
    Backend(anyhow::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevice => f.write_str("no scanner selected"),
            Self::Busy { holder } => write!(f, "scanner busy with request {holder}"),
            Self::Backend(e) => write!(f, "{e}"),
        }
    }
}

/// The currently open device. Both halves are set and cleared together.
#[derive(Debug, Clone)]
pub struct ActiveDevice {
    pub protocol: &'static str,
    pub local_id: String,
}

impl ActiveDevice {
    pub fn namespaced_id(&self) -> String {
        format!("{}:{}", self.protocol, self.local_id)
    }
}

#[derive(Default)]
struct RouterShared {
    active: Mutex<Option<ActiveDevice>>,
    /// Request id of the job currently holding the device seat.
    active_job: Mutex<Option<String>>,
    /// Last settings pushed through `apply`, source of `currentValue`s.
    applied: Mutex<ScanSettings>,
}

struct RegisteredBackend {
    tag: &'static str,
    backend: Box<dyn ScannerBackend>,
}

/// Aggregates the device families behind one id-namespaced facade.
pub struct ScannerRouter {
    backends: Vec<RegisteredBackend>,
    shared: Arc<RouterShared>,
    out_tx: mpsc::Sender<ScanEvent>,
}

impl ScannerRouter {
    /// Create an empty router emitting fanned-in events on the returned
    /// receiver.
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<ScanEvent>) {
        let (out_tx, out_rx) = mpsc::channel(depth);
        let router =
            Self { backends: Vec::new(), shared: Arc::new(RouterShared::default()), out_tx };
        (router, out_rx)
    }

    /// Create the event sink for a backend about to be registered under
    /// `tag`, spawning the fan-in task that tags and re-emits its events.
    ///
    /// Terminal events release the device seat before they are forwarded.
    pub fn attach(&self, tag: &'static str) -> EventSink {
        let (tx, mut rx) = mpsc::channel::<BackendEvent>(EVENT_CHANNEL_DEPTH);
        let out = self.out_tx.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.is_terminal() {
                    let mut job = shared.active_job.lock();
                    if job.as_deref() == Some(event.request_id()) {
                        *job = None;
                    }
                }
                if out.send(ScanEvent { protocol: tag, event }).await.is_err() {
                    break;
                }
            }
        });
        tx
    }

    /// Register a backend. Registration order fixes enumeration order;
    /// shutdown runs in reverse.
    pub fn register(&mut self, backend: Box<dyn ScannerBackend>) {
        self.backends.push(RegisteredBackend { tag: backend.name(), backend });
    }

    pub fn backend_tags(&self) -> Vec<&'static str> {
        self.backends.iter().map(|r| r.tag).collect()
    }

    fn backend(&self, tag: &str) -> Option<&dyn ScannerBackend> {
        self.backends.iter().find(|r| r.tag == tag).map(|r| r.backend.as_ref())
    }

    /// Initialize every backend; a family that fails to initialize is logged
    /// and enumerates no devices.
    pub async fn initialize_all(&self) {
        for reg in &self.backends {
            if let Err(e) = reg.backend.initialize().await {
                tracing::warn!(backend = reg.tag, err = %e, "backend initialization failed");
            }
        }
    }

    /// Shut backends down in reverse registration order.
    pub async fn shutdown_all(&self) {
        for reg in self.backends.iter().rev() {
            reg.backend.shutdown().await;
        }
    }

    /// Split a client-supplied id into `(backend tag, local id)`. A bare id
    /// with no registered prefix belongs to the default family.
    pub fn parse_id<'a>(&self, id: &'a str) -> (&'static str, &'a str) {
        if let Some((prefix, rest)) = id.split_once(':') {
            if let Some(reg) = self.backends.iter().find(|r| r.tag == prefix) {
                return (reg.tag, rest);
            }
        }
        (VENDOR_TAG, id)
    }

    /// Enumerate all families, optionally filtered by backend tag. Ids come
    /// back namespaced; `default_id` (a namespaced id) overrides the default
    /// flag when it matches.
    pub async fn enumerate(
        &self,
        filter: Option<&[String]>,
        default_id: Option<&str>,
    ) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for reg in &self.backends {
            if let Some(tags) = filter {
                if !tags.is_empty() && !tags.iter().any(|t| t == reg.tag) {
                    continue;
                }
            }
            for device in reg.backend.enumerate().await {
                let id = format!("{}:{}", reg.tag, device.id);
                devices.push(DeviceInfo {
                    name: device.name,
                    id,
                    is_default: device.is_default,
                    protocol: reg.tag.to_owned(),
                    capabilities: device.capabilities,
                });
            }
        }
        if let Some(default_id) = default_id {
            if devices.iter().any(|d| d.id == default_id) {
                for d in &mut devices {
                    d.is_default = d.id == default_id;
                }
            }
        }
        devices
    }

    /// Open a device. On success the active cell points at it and the
    /// applied-settings snapshot resets to defaults.
    pub async fn select(&self, id: &str) -> anyhow::Result<ActiveDevice> {
        let (tag, local_id) = self.parse_id(id);
        let backend =
            self.backend(tag).ok_or_else(|| anyhow!("unknown backend: {tag}"))?;
        backend
            .select(local_id)
            .await
            .with_context(|| format!("opening {tag}:{local_id}"))?;
        let active = ActiveDevice { protocol: tag, local_id: local_id.to_owned() };
        *self.shared.active.lock() = Some(active.clone());
        *self.shared.applied.lock() = ScanSettings::default();
        Ok(active)
    }

    pub fn active(&self) -> Option<ActiveDevice> {
        self.shared.active.lock().clone()
    }

    pub fn active_job(&self) -> Option<String> {
        self.shared.active_job.lock().clone()
    }

    /// Capability snapshot for an explicit (namespaced) id.
    pub async fn capabilities_for(&self, id: &str) -> Option<(String, CapabilitySnapshot)> {
        let (tag, local_id) = self.parse_id(id);
        let backend = self.backend(tag)?;
        let snap = backend.capabilities(local_id).await?;
        Some((format!("{tag}:{local_id}"), snap))
    }

    /// Dynamic capability list for the active device: the backend snapshot
    /// with `currentValue`s filled from the last-applied settings.
    pub async fn device_capabilities(
        &self,
    ) -> anyhow::Result<(ActiveDevice, Vec<Capability>)> {
        let active = self.active().ok_or_else(|| anyhow!("no scanner selected"))?;
        let backend = self
            .backend(active.protocol)
            .ok_or_else(|| anyhow!("unknown backend: {}", active.protocol))?;
        let snap = backend
            .capabilities(&active.local_id)
            .await
            .ok_or_else(|| anyhow!("device went away: {}", active.namespaced_id()))?;
        let applied = self.shared.applied.lock().clone();
        let mut caps: Vec<Capability> = snap.entries().cloned().collect();
        for cap in &mut caps {
            let current = match cap.key.as_str() {
                CAP_DPI => Some(applied.dpi.into()),
                CAP_PIXEL_TYPE => Some(applied.pixel_type.as_str().into()),
                CAP_PAPER_SIZE => Some(applied.paper_size.clone().into()),
                CAP_USE_ADF => Some(applied.use_adf.into()),
                CAP_DUPLEX => Some(applied.duplex.into()),
                CAP_MAX_PAGES => Some(applied.max_pages.into()),
                CAP_SHOW_UI => Some(applied.show_ui.into()),
                _ => None,
            };
            if let Some(value) = current {
                cap.current_value = Some(value);
            }
        }
        Ok((active, caps))
    }

    /// Push full canonical settings to the active backend and remember them.
    pub async fn apply_settings(&self, settings: &ScanSettings) -> anyhow::Result<()> {
        let active = self.active().ok_or_else(|| anyhow!("no scanner selected"))?;
        let backend = self
            .backend(active.protocol)
            .ok_or_else(|| anyhow!("unknown backend: {}", active.protocol))?;
        let mut canonical = settings.clone();
        canonical.canonicalize();
        canonical.validate().map_err(|reason| anyhow!(reason))?;
        backend.apply(&canonical).await?;
        *self.shared.applied.lock() = canonical;
        Ok(())
    }

    /// Patch-apply settings field by field. Each present field yields an
    /// independent result; the merged settings reach the backend only when at
    /// least one field was accepted. A scan in progress fails the whole call.
    pub async fn apply_patch(
        &self,
        patch: &DeviceSettingsPatch,
        advanced: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> anyhow::Result<(ActiveDevice, Vec<FieldResult>)> {
        let active = self.active().ok_or_else(|| anyhow!("no scanner selected"))?;
        if self.active_job().is_some() {
            return Ok((active, vec![FieldResult::rejected("scan", "scan in progress")]));
        }
        let backend = self
            .backend(active.protocol)
            .ok_or_else(|| anyhow!("unknown backend: {}", active.protocol))?;
        let snap = backend
            .capabilities(&active.local_id)
            .await
            .ok_or_else(|| anyhow!("device went away: {}", active.namespaced_id()))?;

        let mut merged = self.shared.applied.lock().clone();
        let mut results = Vec::new();

        let mut check = |key: &str,
                         value: serde_json::Value,
                         apply: &mut dyn FnMut(&mut ScanSettings) -> Result<(), String>|
         -> FieldResult {
            let Some(cap) = snap.get(key) else {
                return FieldResult::rejected(key, "not supported by this device");
            };
            if let Err(reason) = cap.accepts(&value) {
                return FieldResult::rejected(key, reason);
            }
            match apply(&mut merged) {
                Ok(()) => FieldResult::applied(key, value),
                Err(reason) => FieldResult::rejected(key, reason),
            }
        };

        if let Some(dpi) = patch.dpi {
            results.push(check(CAP_DPI, dpi.into(), &mut |s| {
                if dpi == 0 {
                    return Err("dpi must be positive".to_owned());
                }
                s.dpi = dpi;
                Ok(())
            }));
        }
        if let Some(ref pixel) = patch.pixel_type {
            let raw = pixel.clone();
            results.push(check(CAP_PIXEL_TYPE, raw.clone().into(), &mut |s| {
                let parsed = PixelType::parse(&raw)
                    .ok_or_else(|| format!("unknown pixel type: {raw}"))?;
                s.pixel_type = parsed;
                Ok(())
            }));
        }
        if let Some(ref size) = patch.paper_size {
            let raw = size.clone();
            results.push(check(CAP_PAPER_SIZE, raw.clone().into(), &mut |s| {
                s.paper_size = raw.to_ascii_uppercase();
                Ok(())
            }));
        }
        if let Some(use_adf) = patch.use_adf {
            results.push(check(CAP_USE_ADF, use_adf.into(), &mut |s| {
                s.use_adf = use_adf;
                Ok(())
            }));
        }
        if let Some(duplex) = patch.duplex {
            results.push(check(CAP_DUPLEX, duplex.into(), &mut |s| {
                s.duplex = duplex;
                Ok(())
            }));
        }
        if let Some(max_pages) = patch.max_pages {
            results.push(check(CAP_MAX_PAGES, max_pages.into(), &mut |s| {
                if max_pages == 0 {
                    return Err("maxPages must be -1 or positive".to_owned());
                }
                s.max_pages = max_pages;
                Ok(())
            }));
        }
        if let Some(show_ui) = patch.show_ui {
            results.push(check(CAP_SHOW_UI, show_ui.into(), &mut |s| {
                s.show_ui = show_ui;
                Ok(())
            }));
        }

        let accepted = results.iter().filter(|r| r.applied_value.is_some()).count();
        if accepted > 0 {
            if let Err(e) = backend.apply(&merged).await {
                // The device refused the merged push; nothing was applied.
                let message = format!("device rejected settings: {e}");
                for r in &mut results {
                    if r.applied_value.is_some() {
                        let key = r.key.clone();
                        *r = FieldResult::rejected(&key, message.clone());
                    }
                }
            } else {
                *self.shared.applied.lock() = merged;
            }
        }

        if let Some(advanced) = advanced {
            for (key, value) in advanced {
                results.push(backend.apply_advanced(key, value).await);
            }
        }

        Ok((active, results))
    }

    /// Begin an acquisition on the active device. The device seat is
    /// released by the fan-in task when the terminal event passes through.
    pub async fn start(&self, request_id: &str) -> Result<(), StartError> {
        let active = self.active().ok_or(StartError::NoDevice)?;
        {
            let mut job = self.shared.active_job.lock();
            if let Some(ref holder) = *job {
                return Err(StartError::Busy { holder: holder.clone() });
            }
            *job = Some(request_id.to_owned());
        }
        let backend = match self.backend(active.protocol) {
            Some(b) => b,
            None => {
                *self.shared.active_job.lock() = None;
                return Err(StartError::NoDevice);
            }
        };
        if let Err(e) = backend.start(request_id).await {
            *self.shared.active_job.lock() = None;
            return Err(StartError::Backend(e));
        }
        Ok(())
    }

    /// Request abort on the active backend. Safe with no job running.
    pub async fn stop(&self) {
        let Some(active) = self.active() else { return };
        if let Some(backend) = self.backend(active.protocol) {
            backend.stop().await;
        }
    }

    /// Settings snapshot last pushed through `apply`.
    pub fn applied_settings(&self) -> ScanSettings {
        self.shared.applied.lock().clone()
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
