// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OS imaging service backend (device id prefix `b`).
//!
//! Adapts the pull-style imaging API: properties are pushed onto an open
//! unit, then pages are drained one blocking call at a time. There is no
//! vendor window in this family, so acquisition is always headless and the
//! pull loop runs on the blocking thread pool.
//!
//! Platform glue plugs in through [`ImagingService`]/[`ImagingUnit`]; the
//! crate ships a virtual implementation for tests and hardware-free
//! development.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::scanner::capability::{BaselineCaps, CapabilitySnapshot, FieldResult};
use crate::scanner::settings::{PixelType, ScanSettings};
use crate::scanner::{BackendEvent, Device, EventSink, PageMetadata, RawPage, ScannerBackend,
    IMAGING_TAG};

/// Errors surfaced by the imaging service layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagingError {
    /// The unit does not understand the property; callers ignore this.
    Unsupported,
    /// The blocking pull observed the cancel flag.
    Cancelled,
    Offline(String),
    Failed(String),
}

impl std::fmt::Display for ImagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported => f.write_str("property not supported"),
            Self::Cancelled => f.write_str("transfer cancelled"),
            Self::Offline(m) => write!(f, "device offline: {m}"),
            Self::Failed(m) => f.write_str(m),
        }
    }
}

/// Descriptor and static feature set of an imaging unit.
#[derive(Debug, Clone)]
pub struct ImagingDeviceDesc {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub feeder: bool,
    pub duplex: bool,
    pub resolutions: Vec<u32>,
    pub pixel_kinds: Vec<PixelType>,
    pub paper_sizes: Vec<String>,
}

/// One property pushed onto an open unit.
#[derive(Debug, Clone)]
pub enum ImagingProp {
    Dpi(u32),
    PixelKind(PixelType),
    PaperSize(String),
    UseFeeder(bool),
    Duplex(bool),
}

/// The imaging service entry point.
pub trait ImagingService: Send + Sync {
    fn enumerate(&self) -> Result<Vec<ImagingDeviceDesc>, ImagingError>;
    fn open(&self, id: &str) -> Result<Box<dyn ImagingUnit>, ImagingError>;
}

/// One open imaging unit. `next_page` blocks until a page is ready, the
/// source is empty (`Ok(None)`), or `stop` was raised.
pub trait ImagingUnit: Send {
    fn descriptor(&self) -> ImagingDeviceDesc;
    fn set_property(&mut self, prop: ImagingProp) -> Result<(), ImagingError>;
    fn next_page(&mut self, stop: &AtomicBool) -> Result<Option<RawPage>, ImagingError>;
    fn close(&mut self);
}

struct ImagingJob {
    request_id: String,
    stop: Arc<AtomicBool>,
}

struct ImagingState {
    initialized: bool,
    init_error: Option<String>,
    selected: Option<String>,
    /// Present while a device is open and idle; the pull loop owns the unit
    /// for the duration of a scan and returns it afterwards.
    unit: Option<Box<dyn ImagingUnit>>,
    applied: ScanSettings,
    job: Option<ImagingJob>,
}

/// The imaging service family behind the shared backend capability set.
pub struct ImagingBackend {
    service: Arc<dyn ImagingService>,
    state: Arc<Mutex<ImagingState>>,
    events: EventSink,
}

impl ImagingBackend {
    pub fn new(service: Arc<dyn ImagingService>, events: EventSink) -> Self {
        Self {
            service,
            state: Arc::new(Mutex::new(ImagingState {
                initialized: false,
                init_error: None,
                selected: None,
                unit: None,
                applied: ScanSettings::default(),
                job: None,
            })),
            events,
        }
    }

    fn snapshot_from(desc: &ImagingDeviceDesc) -> CapabilitySnapshot {
        let mut snap = BaselineCaps {
            dpi_values: desc.resolutions.clone(),
            pixel_types: Vec::new(),
            paper_sizes: Vec::new(),
            has_adf: desc.feeder,
            has_duplex: desc.duplex,
            // No vendor window exists in this family.
            has_ui: false,
        }
        .snapshot();
        if let Some(cap) = snap.0.get_mut(crate::scanner::capability::CAP_PIXEL_TYPE) {
            cap.supported_values =
                Some(desc.pixel_kinds.iter().map(|p| p.as_str().into()).collect());
        }
        if let Some(cap) = snap.0.get_mut(crate::scanner::capability::CAP_PAPER_SIZE) {
            cap.supported_values =
                Some(desc.paper_sizes.iter().map(|p| p.as_str().into()).collect());
        }
        snap
    }

    fn descriptor(&self, local_id: &str) -> Option<ImagingDeviceDesc> {
        self.service.enumerate().ok()?.into_iter().find(|d| d.id == local_id)
    }

    /// The captured initialization failure, if the service was unreachable.
    pub fn init_error(&self) -> Option<String> {
        self.state.lock().init_error.clone()
    }
}

/// Drain pages from a unit until the source is empty, the cap is reached,
/// or the job is stopped. Emits exactly one terminal event by construction.
fn run_pull_loop(
    mut unit: Box<dyn ImagingUnit>,
    settings: ScanSettings,
    request_id: String,
    stop: Arc<AtomicBool>,
    events: EventSink,
    state: Arc<Mutex<ImagingState>>,
) {
    let device_id = unit.descriptor().id;
    let mut pages = 0u32;

    let terminal = loop {
        if stop.load(Ordering::Acquire) {
            break BackendEvent::Completed { request_id: request_id.clone(), total_pages: pages };
        }
        if !settings.wants_more_pages(pages) {
            break BackendEvent::Completed { request_id: request_id.clone(), total_pages: pages };
        }
        // A flatbed exposes one page per pass unless the client asked for
        // batch mode.
        if !settings.use_adf && !settings.continuous_scan && pages >= 1 {
            break BackendEvent::Completed { request_id: request_id.clone(), total_pages: pages };
        }

        match unit.next_page(&stop) {
            Ok(Some(raw)) => {
                pages += 1;
                let meta = PageMetadata {
                    width: raw.width,
                    height: raw.height,
                    format: raw.format.clone(),
                    size: raw.bytes.len(),
                    dpi: settings.dpi,
                };
                let page = BackendEvent::Page {
                    request_id: request_id.clone(),
                    bytes: raw.bytes,
                    meta,
                    ordinal: pages,
                };
                if events.blocking_send(page).is_err() {
                    // Receiver gone (daemon shutting down); still unwind
                    // through the normal cleanup path.
                    break BackendEvent::Completed {
                        request_id: request_id.clone(),
                        total_pages: pages,
                    };
                }
            }
            Ok(None) => {
                // Source empty. After real pages this is the normal end of
                // the batch; on an untouched feeder it is an error.
                if pages > 0 || stop.load(Ordering::Acquire) {
                    break BackendEvent::Completed {
                        request_id: request_id.clone(),
                        total_pages: pages,
                    };
                }
                break BackendEvent::Error {
                    request_id: request_id.clone(),
                    message: "no media in the selected source".to_owned(),
                };
            }
            Err(ImagingError::Cancelled) => {
                break BackendEvent::Completed {
                    request_id: request_id.clone(),
                    total_pages: pages,
                };
            }
            Err(e) => {
                break BackendEvent::Error { request_id: request_id.clone(), message: e.to_string() };
            }
        }
    };

    // Hand the unit back and release the job before the terminal event is
    // visible, so a back-to-back start finds the device idle. The unit is
    // discarded when the selection moved on mid-job.
    {
        let mut guard = state.lock();
        guard.job = None;
        if guard.selected.as_deref() == Some(device_id.as_str()) && guard.unit.is_none() {
            guard.unit = Some(unit);
        } else {
            unit.close();
        }
    }
    let _ = events.blocking_send(terminal);
}

#[async_trait]
impl ScannerBackend for ImagingBackend {
    fn name(&self) -> &'static str {
        IMAGING_TAG
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        match self.service.enumerate() {
            Ok(devices) => {
                let mut state = self.state.lock();
                state.initialized = true;
                state.init_error = None;
                debug!(count = devices.len(), "imaging service initialized");
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.initialized = false;
                state.init_error = Some(e.to_string());
                bail!("imaging service init failed: {e}")
            }
        }
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Some(ref job) = state.job {
            job.stop.store(true, Ordering::Release);
        }
        if let Some(mut unit) = state.unit.take() {
            unit.close();
        }
        state.selected = None;
        state.initialized = false;
    }

    async fn enumerate(&self) -> Vec<Device> {
        if !self.state.lock().initialized {
            return Vec::new();
        }
        match self.service.enumerate() {
            Ok(descs) => descs
                .into_iter()
                .map(|d| Device {
                    id: d.id,
                    name: d.name,
                    is_default: d.is_default,
                    capabilities: None,
                })
                .collect(),
            Err(e) => {
                warn!(err = %e, "imaging enumeration failed");
                Vec::new()
            }
        }
    }

    async fn select(&self, local_id: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if !state.initialized {
                bail!("imaging service not initialized");
            }
            // Invalidate any prior selection; a running pull loop notices the
            // stop flag and discards its unit on return.
            if let Some(ref job) = state.job {
                job.stop.store(true, Ordering::Release);
            }
            if let Some(mut old) = state.unit.take() {
                old.close();
            }
            state.selected = None;
        }
        let unit = self
            .service
            .open(local_id)
            .map_err(|e| anyhow!("opening {local_id}: {e}"))?;
        let mut state = self.state.lock();
        state.selected = Some(local_id.to_owned());
        state.unit = Some(unit);
        state.applied = ScanSettings::default();
        Ok(())
    }

    async fn capabilities(&self, local_id: &str) -> Option<CapabilitySnapshot> {
        let desc = self.descriptor(local_id)?;
        Some(Self::snapshot_from(&desc))
    }

    async fn apply(&self, settings: &ScanSettings) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.job.is_some() {
            bail!("scan in progress");
        }
        let Some(unit) = state.unit.as_mut() else {
            bail!("no device selected");
        };
        let props = [
            ImagingProp::Dpi(settings.dpi),
            ImagingProp::PixelKind(settings.pixel_type),
            ImagingProp::PaperSize(settings.paper_size.clone()),
            ImagingProp::UseFeeder(settings.use_adf),
            ImagingProp::Duplex(settings.duplex),
        ];
        for prop in props {
            match unit.set_property(prop) {
                // showUI has no meaning here either; unsupported fields are
                // dropped silently across the family.
                Ok(()) | Err(ImagingError::Unsupported) => {}
                Err(e) => bail!("{e}"),
            }
        }
        state.applied = settings.clone();
        Ok(())
    }

    async fn apply_advanced(&self, key: &str, _value: &serde_json::Value) -> FieldResult {
        FieldResult::rejected(key, "unknown advanced key")
    }

    async fn start(&self, request_id: &str) -> anyhow::Result<()> {
        let (unit, settings, stop) = {
            let mut state = self.state.lock();
            if state.job.is_some() {
                bail!("scan in progress");
            }
            let Some(unit) = state.unit.take() else {
                bail!("no device selected");
            };
            let stop = Arc::new(AtomicBool::new(false));
            state.job = Some(ImagingJob {
                request_id: request_id.to_owned(),
                stop: Arc::clone(&stop),
            });
            (unit, state.applied.clone(), stop)
        };

        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let request_id = request_id.to_owned();
        tokio::task::spawn_blocking(move || {
            run_pull_loop(unit, settings, request_id, stop, events, state);
        });
        Ok(())
    }

    async fn stop(&self) {
        let state = self.state.lock();
        if let Some(ref job) = state.job {
            debug!(request_id = %job.request_id, "imaging stop requested");
            job.stop.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
#[path = "imaging_tests.rs"]
mod tests;
