// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Vendor driver backend (device id prefix `a`).
//!
//! Adapts the callback-style desktop driver stack: a single host library,
//! devices opened one at a time, pages delivered by the driver from its own
//! thread, and optional vendor UI windows. The host library requires thread
//! affinity, so the backend owns a dedicated worker thread and bridges
//! commands in and acquisition events out over channels.
//!
//! Driver glue plugs in through [`VendorHost`]/[`VendorDevice`]; the crate
//! ships a virtual implementation for tests and hardware-free development.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::scanner::capability::{
    BaselineCaps, Capability, CapabilitySnapshot, CapabilityType, FieldResult,
};
use crate::scanner::settings::{PixelType, ScanSettings};
use crate::scanner::{BackendEvent, Device, EventSink, PageMetadata, RawPage, ScannerBackend,
    VENDOR_TAG};

/// Fault classification surfaced by the native driver layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverFault {
    /// The device cannot acquire without its vendor window.
    UiRequired,
    /// The device does not understand the option; callers ignore this.
    Unsupported,
    /// The device or host is gone.
    Offline(String),
    /// Anything else the driver reports.
    Failed(String),
}

impl std::fmt::Display for DriverFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UiRequired => f.write_str("driver requires its vendor dialog"),
            Self::Unsupported => f.write_str("option not supported"),
            Self::Offline(m) => write!(f, "device offline: {m}"),
            Self::Failed(m) => f.write_str(m),
        }
    }
}

/// UI mode requested when starting a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiMode {
    None,
    Modeless,
    Modal,
}

/// Duplex capability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexSupport {
    None,
    OnePass,
    TwoPass,
    Both,
}

/// Duplex pass order pushed to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexMode {
    Off,
    /// Interleaved front/back in one pass. Preserves page order.
    OnePass,
    /// All fronts, then all backs.
    TwoPass,
}

/// What a device reports about itself before it is opened. The driver may
/// leave `id` empty until the device has been opened once.
#[derive(Debug, Clone)]
pub struct VendorDeviceDesc {
    pub handle: u32,
    pub id: Option<String>,
    pub name: String,
    pub is_default: bool,
}

impl VendorDeviceDesc {
    /// The id this device is exposed under before the driver fills one in.
    pub fn exposed_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.name.clone())
    }
}

/// Static feature set of an open device.
#[derive(Debug, Clone)]
pub struct VendorFeatures {
    pub resolutions: Vec<u32>,
    pub pixel_kinds: Vec<PixelType>,
    pub paper_sizes: Vec<String>,
    pub feeder: bool,
    pub duplex: DuplexSupport,
    /// Device cannot acquire headless.
    pub ui_required: bool,
    /// Device supports a modeless vendor window.
    pub modeless_ui: bool,
}

/// One option pushed onto an open device.
#[derive(Debug, Clone)]
pub enum DeviceOption {
    Dpi(u32),
    PixelKind(PixelType),
    PaperSize(String),
    UseFeeder(bool),
    Duplex(DuplexMode),
    /// Transfer cap, driver convention: -1 unlimited.
    TransferCount(i32),
}

/// Signals the driver pushes from its own thread during a transfer.
#[derive(Debug)]
pub enum DriverSignal {
    Page(RawPage),
    /// Transfer finished normally.
    Done,
    /// The feeder reports no (more) media.
    FeederEmpty,
    /// Transfer error. Noisy stacks may repeat this or fire it after `Done`.
    Fault(String),
}

/// An open vendor device. Calls run on the backend worker thread.
pub trait VendorDevice: Send {
    fn local_id(&self) -> String;
    fn features(&self) -> VendorFeatures;
    fn set_option(&mut self, option: DeviceOption) -> Result<(), DriverFault>;
    /// Begin a transfer; pages and the terminal condition arrive on
    /// `signals` from the driver's thread. Must not block across pages.
    fn begin_transfer(
        &mut self,
        ui: UiMode,
        signals: std_mpsc::Sender<DriverSignal>,
    ) -> Result<(), DriverFault>;
    /// Ask the driver to abort the running transfer.
    fn abort_transfer(&mut self);
    /// Force the device down to the open (no transfer) level.
    fn end_transfer(&mut self);
    fn close(&mut self);
}

/// The host library entry point. Calls run on the backend worker thread.
pub trait VendorHost: Send {
    fn open(&mut self) -> Result<(), DriverFault>;
    fn devices(&mut self) -> Result<Vec<VendorDeviceDesc>, DriverFault>;
    fn open_device(&mut self, handle: u32) -> Result<Box<dyn VendorDevice>, DriverFault>;
    fn close(&mut self);
}

// -- Job state ----------------------------------------------------------------

/// Mutable per-job record shared between the worker and the signal drain.
/// `terminated` transitions once; everything after it is suppressed.
#[derive(Debug)]
struct JobInner {
    request_id: String,
    pages: u32,
    terminated: bool,
    stop_requested: bool,
    max_pages: i32,
    dpi: u32,
}

type JobState = Arc<Mutex<JobInner>>;

fn wants_more(max_pages: i32, pages: u32) -> bool {
    max_pages < 0 || pages < max_pages as u32
}

// -- Worker -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Ready,
    DeviceOpen,
    Scanning,
    Error,
}

enum Cmd {
    Init(oneshot::Sender<Result<(), DriverFault>>),
    Enumerate(oneshot::Sender<Vec<VendorDeviceDesc>>),
    Select(String, oneshot::Sender<Result<String, DriverFault>>),
    Features(String, oneshot::Sender<Option<VendorFeatures>>),
    Apply(ScanSettings, oneshot::Sender<Result<(), DriverFault>>),
    Start(String, oneshot::Sender<Result<(), DriverFault>>),
    DuplexPass(bool),
    Stop,
    /// Sent by the drain thread once a job terminated, so the worker can
    /// force the device back down to the open level.
    FinishTransfer,
    Shutdown(oneshot::Sender<()>),
}

struct Worker {
    host: Box<dyn VendorHost>,
    phase: Phase,
    device: Option<Box<dyn VendorDevice>>,
    /// Exposed local id -> native handle, refreshed on enumerate and after
    /// open (the driver may only populate the id once a device was opened).
    handles: HashMap<String, u32>,
    applied: ScanSettings,
    duplex_two_pass: bool,
    job: Option<JobState>,
    events: EventSink,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl Worker {
    fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        while let Some(cmd) = cmd_rx.blocking_recv() {
            match cmd {
                Cmd::Init(reply) => {
                    let result = self.host.open();
                    if result.is_ok() {
                        self.phase = Phase::Ready;
                    }
                    let _ = reply.send(result);
                }
                Cmd::Enumerate(reply) => {
                    let devices = if self.phase == Phase::Uninitialized {
                        Vec::new()
                    } else {
                        match self.host.devices() {
                            Ok(descs) => {
                                self.handles = descs
                                    .iter()
                                    .map(|d| (d.exposed_id(), d.handle))
                                    .collect();
                                descs
                            }
                            Err(e) => {
                                warn!(err = %e, "vendor enumeration failed");
                                Vec::new()
                            }
                        }
                    };
                    let _ = reply.send(devices);
                }
                Cmd::Select(local_id, reply) => {
                    let _ = reply.send(self.select(&local_id));
                }
                Cmd::Features(local_id, reply) => {
                    let _ = reply.send(self.features(&local_id));
                }
                Cmd::Apply(settings, reply) => {
                    let _ = reply.send(self.apply(settings));
                }
                Cmd::Start(request_id, reply) => {
                    let _ = reply.send(self.start(request_id));
                }
                Cmd::DuplexPass(two_pass) => {
                    self.duplex_two_pass = two_pass;
                }
                Cmd::Stop => self.stop(),
                Cmd::FinishTransfer => {
                    if let Some(device) = self.device.as_mut() {
                        device.end_transfer();
                    }
                    if self.phase == Phase::Scanning {
                        self.phase = Phase::DeviceOpen;
                    }
                    self.job = None;
                }
                Cmd::Shutdown(reply) => {
                    if let Some(mut device) = self.device.take() {
                        device.abort_transfer();
                        device.end_transfer();
                        device.close();
                    }
                    self.host.close();
                    self.phase = Phase::Uninitialized;
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn handle_for(&mut self, local_id: &str) -> Option<u32> {
        if let Some(handle) = self.handles.get(local_id) {
            return Some(*handle);
        }
        // Stale cache; ask the host again.
        if let Ok(descs) = self.host.devices() {
            self.handles = descs.iter().map(|d| (d.exposed_id(), d.handle)).collect();
        }
        self.handles.get(local_id).copied()
    }

    fn select(&mut self, local_id: &str) -> Result<String, DriverFault> {
        if self.phase == Phase::Uninitialized {
            return Err(DriverFault::Offline("driver not initialized".to_owned()));
        }
        // Invalidate any prior selection, aborting a transfer if one runs.
        if let Some(mut old) = self.device.take() {
            old.abort_transfer();
            old.end_transfer();
            old.close();
        }
        self.job = None;
        let handle = self
            .handle_for(local_id)
            .ok_or_else(|| DriverFault::Offline(format!("unknown device: {local_id}")))?;
        let device = self.host.open_device(handle)?;
        // The driver's id is authoritative once the device is open.
        let resolved = device.local_id();
        self.handles.insert(resolved.clone(), handle);
        self.device = Some(device);
        self.applied = ScanSettings::default();
        self.duplex_two_pass = false;
        self.phase = Phase::DeviceOpen;
        Ok(resolved)
    }

    fn features(&mut self, local_id: &str) -> Option<VendorFeatures> {
        if let Some(ref device) = self.device {
            if device.local_id() == local_id {
                return Some(device.features());
            }
        }
        // Not the open device: peek by opening transiently.
        let handle = self.handle_for(local_id)?;
        match self.host.open_device(handle) {
            Ok(mut device) => {
                let features = device.features();
                device.close();
                Some(features)
            }
            Err(e) => {
                debug!(device = local_id, err = %e, "feature probe failed");
                None
            }
        }
    }

    fn apply(&mut self, settings: ScanSettings) -> Result<(), DriverFault> {
        let Some(device) = self.device.as_mut() else {
            return Err(DriverFault::Offline("no device selected".to_owned()));
        };
        let features = device.features();
        let duplex_mode = if !settings.duplex {
            DuplexMode::Off
        } else {
            // One-pass keeps the client's page order; only fall back to
            // two-pass when the device knows nothing else, or when the
            // experimental override asks for it.
            match (features.duplex, self.duplex_two_pass) {
                (DuplexSupport::None, _) => DuplexMode::Off,
                (DuplexSupport::TwoPass, _) | (DuplexSupport::Both, true) => DuplexMode::TwoPass,
                _ => DuplexMode::OnePass,
            }
        };

        let options = [
            DeviceOption::Dpi(settings.dpi),
            DeviceOption::PixelKind(settings.pixel_type),
            DeviceOption::PaperSize(settings.paper_size.clone()),
            DeviceOption::UseFeeder(settings.use_adf && features.feeder),
            DeviceOption::Duplex(duplex_mode),
        ];
        for option in options {
            match device.set_option(option.clone()) {
                Ok(()) | Err(DriverFault::Unsupported) => {}
                Err(e) => return Err(e),
            }
        }
        self.applied = settings;
        self.phase = Phase::DeviceOpen;
        Ok(())
    }

    fn start(&mut self, request_id: String) -> Result<(), DriverFault> {
        if self.phase == Phase::Scanning {
            return Err(DriverFault::Failed("transfer already running".to_owned()));
        }
        let settings = self.applied.clone();
        let Some(device) = self.device.as_mut() else {
            return Err(DriverFault::Offline("no device selected".to_owned()));
        };
        let features = device.features();

        // The vendor window owns the transfer count when it is shown;
        // pushing a cap underneath it wedges some drivers into single-page
        // mode. Headless scans get the cap verbatim.
        if !settings.show_ui {
            match device.set_option(DeviceOption::TransferCount(settings.max_pages)) {
                Ok(()) | Err(DriverFault::Unsupported) => {}
                Err(e) => return Err(e),
            }
        }

        let job: JobState = Arc::new(Mutex::new(JobInner {
            request_id: request_id.clone(),
            pages: 0,
            terminated: false,
            stop_requested: false,
            max_pages: settings.max_pages,
            dpi: settings.dpi,
        }));

        let (signal_tx, signal_rx) = std_mpsc::channel();
        let begin = if settings.show_ui {
            let first = if features.modeless_ui { UiMode::Modeless } else { UiMode::Modal };
            match device.begin_transfer(first, signal_tx.clone()) {
                Ok(()) => Ok(()),
                Err(_) if first == UiMode::Modeless => {
                    device.begin_transfer(UiMode::Modal, signal_tx.clone())
                }
                Err(e) => Err(e),
            }
        } else {
            device.begin_transfer(UiMode::None, signal_tx.clone())
        };
        drop(signal_tx);

        if let Err(e) = begin {
            self.phase = Phase::Error;
            return Err(e);
        }

        self.job = Some(Arc::clone(&job));
        self.phase = Phase::Scanning;
        spawn_signal_drain(signal_rx, job, self.events.clone(), self.cmd_tx.clone());
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(ref job) = self.job {
            job.lock().stop_requested = true;
        }
        if let Some(device) = self.device.as_mut() {
            device.abort_transfer();
        }
    }
}

/// Drain driver signals into backend events, collapsing noisy terminal
/// conditions into exactly one `Completed`/`Error` per job.
fn spawn_signal_drain(
    signal_rx: std_mpsc::Receiver<DriverSignal>,
    job: JobState,
    events: EventSink,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
) {
    std::thread::spawn(move || {
        let mut finished_sent = false;
        let mut finish = |terminal: BackendEvent| {
            // Queue the device teardown before the terminal event becomes
            // visible, so a back-to-back start cannot observe `Scanning`.
            if !finished_sent {
                let _ = cmd_tx.send(Cmd::FinishTransfer);
                finished_sent = true;
            }
            let _ = events.blocking_send(terminal);
        };

        while let Ok(signal) = signal_rx.recv() {
            let mut inner = job.lock();
            if inner.terminated {
                debug!(request_id = %inner.request_id, "signal after terminal suppressed");
                continue;
            }
            match signal {
                DriverSignal::Page(page) => {
                    if !wants_more(inner.max_pages, inner.pages) {
                        // Cap already satisfied; the driver raced our abort.
                        continue;
                    }
                    inner.pages += 1;
                    let ordinal = inner.pages;
                    let request_id = inner.request_id.clone();
                    let meta = PageMetadata {
                        width: page.width,
                        height: page.height,
                        format: page.format.clone(),
                        size: page.bytes.len(),
                        dpi: inner.dpi,
                    };
                    let cap_reached = !wants_more(inner.max_pages, inner.pages);
                    if cap_reached {
                        inner.terminated = true;
                    }
                    let pages = inner.pages;
                    drop(inner);
                    let _ = events.blocking_send(BackendEvent::Page {
                        request_id: request_id.clone(),
                        bytes: page.bytes,
                        meta,
                        ordinal,
                    });
                    if cap_reached {
                        finish(BackendEvent::Completed { request_id, total_pages: pages });
                    }
                }
                DriverSignal::Done => {
                    inner.terminated = true;
                    let request_id = inner.request_id.clone();
                    let pages = inner.pages;
                    drop(inner);
                    finish(BackendEvent::Completed { request_id, total_pages: pages });
                }
                DriverSignal::FeederEmpty => {
                    inner.terminated = true;
                    let request_id = inner.request_id.clone();
                    let pages = inner.pages;
                    let stop_requested = inner.stop_requested;
                    drop(inner);
                    if pages > 0 || stop_requested {
                        // Out of media after real pages is the normal end of
                        // a batch, not an error.
                        finish(BackendEvent::Completed { request_id, total_pages: pages });
                    } else {
                        finish(BackendEvent::Error {
                            request_id,
                            message: "document feeder is empty".to_owned(),
                        });
                    }
                }
                DriverSignal::Fault(message) => {
                    inner.terminated = true;
                    let request_id = inner.request_id.clone();
                    let pages = inner.pages;
                    let stop_requested = inner.stop_requested;
                    drop(inner);
                    if stop_requested {
                        finish(BackendEvent::Completed { request_id, total_pages: pages });
                    } else {
                        finish(BackendEvent::Error { request_id, message });
                    }
                }
            }
        }
    });
}

// -- Backend ------------------------------------------------------------------

/// The vendor driver family behind the shared backend capability set.
pub struct VendorBackend {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    init_error: Mutex<Option<String>>,
}

impl VendorBackend {
    /// Spawn the worker thread around a host library implementation.
    pub fn new(host: Box<dyn VendorHost>, events: EventSink) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            host,
            phase: Phase::Uninitialized,
            device: None,
            handles: HashMap::new(),
            applied: ScanSettings::default(),
            duplex_two_pass: false,
            job: None,
            events,
            cmd_tx: cmd_tx.clone(),
        };
        std::thread::Builder::new()
            .name("vendor-driver".to_owned())
            .spawn(move || worker.run(cmd_rx))
            .ok();
        Self { cmd_tx, init_error: Mutex::new(None) }
    }

    /// The captured initialization failure, if the host library would not
    /// open. A failed family stays registered but lists no devices.
    pub fn init_error(&self) -> Option<String> {
        self.init_error.lock().clone()
    }

    async fn roundtrip<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Cmd) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| anyhow!("vendor driver worker is gone"))?;
        rx.await.map_err(|_| anyhow!("vendor driver worker dropped the request"))
    }

    fn snapshot_from(features: &VendorFeatures) -> CapabilitySnapshot {
        let mut snap = BaselineCaps {
            dpi_values: features.resolutions.clone(),
            pixel_types: Vec::new(),
            paper_sizes: Vec::new(),
            has_adf: features.feeder,
            has_duplex: features.duplex != DuplexSupport::None,
            has_ui: true,
        }
        .snapshot();
        // Enum values come from the live feature set, not static defaults.
        if let Some(cap) = snap.0.get_mut(crate::scanner::capability::CAP_PIXEL_TYPE) {
            cap.supported_values =
                Some(features.pixel_kinds.iter().map(|p| p.as_str().into()).collect());
        }
        if let Some(cap) = snap.0.get_mut(crate::scanner::capability::CAP_PAPER_SIZE) {
            cap.supported_values =
                Some(features.paper_sizes.iter().map(|p| p.as_str().into()).collect());
        }
        if features.duplex == DuplexSupport::Both {
            snap.insert(
                Capability::new("a:duplexPass", "Duplex pass order", CapabilityType::Enum)
                    .experimental()
                    .with_values(vec!["one".into(), "two".into()]),
            );
        }
        if features.ui_required {
            snap.insert(
                Capability::new("a:uiRequired", "Vendor dialog mandatory", CapabilityType::Bool)
                    .experimental()
                    .read_only()
                    .with_current(true.into()),
            );
        }
        snap
    }
}

#[async_trait]
impl ScannerBackend for VendorBackend {
    fn name(&self) -> &'static str {
        VENDOR_TAG
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        match self.roundtrip(Cmd::Init).await? {
            Ok(()) => {
                *self.init_error.lock() = None;
                Ok(())
            }
            Err(e) => {
                *self.init_error.lock() = Some(e.to_string());
                bail!("vendor driver init failed: {e}")
            }
        }
    }

    async fn shutdown(&self) {
        if let Ok(()) = self.roundtrip(Cmd::Shutdown).await {
            debug!("vendor backend shut down");
        }
    }

    async fn enumerate(&self) -> Vec<Device> {
        let descs = self.roundtrip(Cmd::Enumerate).await.unwrap_or_default();
        descs
            .into_iter()
            .map(|d| Device {
                id: d.exposed_id(),
                name: d.name,
                is_default: d.is_default,
                capabilities: None,
            })
            .collect()
    }

    async fn select(&self, local_id: &str) -> anyhow::Result<()> {
        let local_id = local_id.to_owned();
        match self.roundtrip(|tx| Cmd::Select(local_id, tx)).await? {
            Ok(_resolved) => Ok(()),
            Err(e) => bail!("{e}"),
        }
    }

    async fn capabilities(&self, local_id: &str) -> Option<CapabilitySnapshot> {
        let local_id = local_id.to_owned();
        let features = self.roundtrip(|tx| Cmd::Features(local_id, tx)).await.ok()??;
        Some(Self::snapshot_from(&features))
    }

    async fn apply(&self, settings: &ScanSettings) -> anyhow::Result<()> {
        let settings = settings.clone();
        match self.roundtrip(|tx| Cmd::Apply(settings, tx)).await? {
            Ok(()) => Ok(()),
            Err(e) => bail!("{e}"),
        }
    }

    async fn apply_advanced(&self, key: &str, value: &serde_json::Value) -> FieldResult {
        match key.strip_prefix("a:") {
            Some("duplexPass") => match value.as_str() {
                Some(order @ ("one" | "two")) => {
                    // Takes effect on the next settings push.
                    let _ = self.cmd_tx.send(Cmd::DuplexPass(order == "two"));
                    FieldResult::applied(key, value.clone())
                }
                _ => FieldResult::rejected(key, "expected \"one\" or \"two\""),
            },
            Some(_) | None => FieldResult::rejected(key, "unknown advanced key"),
        }
    }

    async fn start(&self, request_id: &str) -> anyhow::Result<()> {
        let request_id = request_id.to_owned();
        match self.roundtrip(|tx| Cmd::Start(request_id, tx)).await? {
            Ok(()) => Ok(()),
            Err(DriverFault::UiRequired) => {
                bail!("this device cannot scan without its driver dialog; retry with showUI: true")
            }
            Err(e) => bail!("{e}"),
        }
    }

    async fn stop(&self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
    }
}

#[cfg(test)]
#[path = "vendor_tests.rs"]
mod tests;
