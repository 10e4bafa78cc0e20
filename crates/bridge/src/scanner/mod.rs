// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scanner backends and the router that aggregates them.
//!
//! A backend adapts one device-access family to the shared capability set:
//! enumerate, select, apply, start, stop, plus the three acquisition events.
//! The router namespaces device ids by backend tag and fans backend events
//! into a single stream the gateway consumes.

pub mod capability;
pub mod escl;
pub mod imaging;
pub mod router;
pub mod settings;
pub mod vendor;
pub mod virtualdev;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::scanner::capability::{CapabilitySnapshot, FieldResult};
use crate::scanner::settings::ScanSettings;

/// Backend family tags, used as the device id namespace prefix.
pub const VENDOR_TAG: &str = "a";
pub const IMAGING_TAG: &str = "b";
pub const ESCL_TAG: &str = "e";

/// Depth of the per-backend event channel.
pub const EVENT_CHANNEL_DEPTH: usize = 32;

/// A device as exposed by a single backend. The id is backend-local; the
/// router prefixes it with the backend tag before it reaches clients.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub capabilities: Option<CapabilitySnapshot>,
}

/// A page as it comes off a native transfer, before metadata is attached.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Metadata describing one transferred page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size: usize,
    pub dpi: u32,
}

/// Events emitted by a backend during an acquisition, keyed by the request
/// that started it. Every job ends with exactly one `Completed` or `Error`.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Page { request_id: String, bytes: Bytes, meta: PageMetadata, ordinal: u32 },
    Completed { request_id: String, total_pages: u32 },
    Error { request_id: String, message: String },
}

impl BackendEvent {
    /// Return the request identifier for this event.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Page { request_id, .. }
            | Self::Completed { request_id, .. }
            | Self::Error { request_id, .. } => request_id,
        }
    }

    /// Whether this event terminates its job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

/// A backend event tagged with the family that emitted it.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub protocol: &'static str,
    pub event: BackendEvent,
}

/// Sender half handed to each backend for its acquisition events.
pub type EventSink = mpsc::Sender<BackendEvent>;

/// The capability set every device family implements.
///
/// Implementations must not block the caller across page transfers: `start`
/// returns once the acquisition is underway and pages arrive on the event
/// sink from whatever thread the native library uses internally.
#[async_trait]
pub trait ScannerBackend: Send + Sync {
    /// Backend tag used as the device id prefix.
    fn name(&self) -> &'static str;

    /// Prepare the device library. Init failures are captured and reported
    /// here; a failed backend stays registered but enumerates no devices.
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Release all device handles.
    async fn shutdown(&self);

    /// List devices currently reachable through this family.
    async fn enumerate(&self) -> Vec<Device>;

    /// Open a device, invalidating any prior selection.
    async fn select(&self, local_id: &str) -> anyhow::Result<()>;

    /// Capability snapshot for a device, baseline plus family extras.
    async fn capabilities(&self, local_id: &str) -> Option<CapabilitySnapshot>;

    /// Push canonical settings onto the selected device. Fields the device
    /// does not support are ignored.
    async fn apply(&self, settings: &ScanSettings) -> anyhow::Result<()>;

    /// Apply one backend-qualified advanced key.
    async fn apply_advanced(&self, key: &str, value: &serde_json::Value) -> FieldResult;

    /// Begin an acquisition for `request_id`.
    async fn start(&self, request_id: &str) -> anyhow::Result<()>;

    /// Request abort. Safe to call at any time, including with no job active.
    async fn stop(&self);
}
