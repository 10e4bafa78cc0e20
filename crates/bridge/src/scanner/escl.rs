// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Network scanner backend (device id prefix `e`).
//!
//! Speaks the standard HTTP+XML scan protocol: capabilities are fetched from
//! `<base>/ScannerCapabilities`, a job is created with a POST to
//! `<base>/ScanJobs`, and pages are drained by polling `<job>/NextDocument`
//! until the device answers 404. Devices live behind self-signed TLS more
//! often than not, so the client accepts untrusted certificates.
//!
//! Discovery is probe-based: candidate `host:port` endpoints come from
//! configuration (and can be added at runtime); a periodic pass checks which
//! of them currently answer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::scanner::capability::{
    BaselineCaps, Capability, CapabilitySnapshot, CapabilityType, FieldResult,
};
use crate::scanner::settings::{PixelType, ScanSettings};
use crate::scanner::{BackendEvent, Device, EventSink, PageMetadata, ScannerBackend, ESCL_TAG};

const ESCL_PATH: &str = "eSCL";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Fixed backoff between `NextDocument` polls answered 503.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Bounded number of consecutive 503 answers before the job fails.
const BUSY_RETRY_LIMIT: u32 = 40;

/// A discovered network scanner.
#[derive(Debug, Clone)]
pub struct EsclDevice {
    /// Local id: the `host:port` the device was registered under.
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub resolutions: Vec<u32>,
    pub pixel_kinds: Vec<PixelType>,
    pub has_feeder: bool,
    pub has_duplex: bool,
}

struct EsclJob {
    request_id: String,
    cancel: CancellationToken,
}

struct EsclState {
    initialized: bool,
    /// Candidate endpoints, probed periodically.
    hosts: Vec<String>,
    /// Endpoints that answered the last probe.
    alive: BTreeMap<String, EsclDevice>,
    selected: Option<String>,
    applied: ScanSettings,
    job: Option<EsclJob>,
}

/// The network scanner family behind the shared backend capability set.
pub struct EsclBackend {
    client: reqwest::Client,
    state: Arc<Mutex<EsclState>>,
    events: EventSink,
}

impl EsclBackend {
    pub fn new(hosts: Vec<String>, events: EventSink) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            client,
            state: Arc::new(Mutex::new(EsclState {
                initialized: false,
                hosts,
                alive: BTreeMap::new(),
                selected: None,
                applied: ScanSettings::default(),
                job: None,
            })),
            events,
        }
    }

    /// Register an endpoint for the next probe pass.
    pub fn register_host(&self, host: impl Into<String>) {
        let host = host.into();
        let mut state = self.state.lock();
        if !state.hosts.contains(&host) {
            state.hosts.push(host);
        }
    }

    /// Probe every candidate endpoint and refresh the alive set.
    pub async fn probe_once(&self) {
        probe_pass(&self.client, &self.state).await;
    }

    /// Spawn the periodic discovery pass.
    pub fn spawn_prober(&self, interval: Duration, shutdown: CancellationToken) {
        let client = self.client.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }
                probe_pass(&client, &state).await;
            }
        });
    }

    /// Candidate base URLs for a registered endpoint. A bare `host:port`
    /// is tried over TLS first, then plaintext.
    fn candidate_bases(host: &str) -> Vec<String> {
        if host.contains("://") {
            vec![format!("{}/{ESCL_PATH}", host.trim_end_matches('/'))]
        } else {
            vec![
                format!("https://{host}/{ESCL_PATH}"),
                format!("http://{host}/{ESCL_PATH}"),
            ]
        }
    }

    fn device(&self, local_id: &str) -> Option<EsclDevice> {
        self.state.lock().alive.get(local_id).cloned()
    }

    fn snapshot_from(device: &EsclDevice) -> CapabilitySnapshot {
        let mut snap = BaselineCaps {
            dpi_values: device.resolutions.clone(),
            pixel_types: Vec::new(),
            paper_sizes: vec!["A4", "LETTER", "LEGAL"],
            has_adf: device.has_feeder,
            has_duplex: device.has_duplex,
            // Network devices have no local vendor window.
            has_ui: false,
        }
        .snapshot();
        if let Some(cap) = snap.0.get_mut(crate::scanner::capability::CAP_PIXEL_TYPE) {
            cap.supported_values =
                Some(device.pixel_kinds.iter().map(|p| p.as_str().into()).collect());
        }
        snap.insert(
            Capability::new("e:documentFormat", "Transfer format", CapabilityType::Enum)
                .experimental()
                .with_values(vec!["image/jpeg".into()])
                .with_current("image/jpeg".into()),
        );
        snap
    }
}

/// One discovery pass over all candidate endpoints.
async fn probe_pass(client: &reqwest::Client, state: &Arc<Mutex<EsclState>>) {
    let hosts: Vec<String> = state.lock().hosts.clone();
    let mut alive = BTreeMap::new();
    for host in hosts {
        match probe_host(client, &host).await {
            Some(device) => {
                debug!(host = %host, name = %device.name, "network scanner answered");
                alive.insert(device.id.clone(), device);
            }
            None => debug!(host = %host, "network scanner probe failed"),
        }
    }
    state.lock().alive = alive;
}

async fn probe_host(client: &reqwest::Client, host: &str) -> Option<EsclDevice> {
    for base in EsclBackend::candidate_bases(host) {
        let url = format!("{base}/ScannerCapabilities");
        let response = client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let Ok(response) = response else { continue };
        let Ok(body) = response.text().await else { continue };
        if let Some(device) = parse_capabilities(host, &base, &body) {
            return Some(device);
        }
    }
    None
}

/// Pull the device capability fields this bridge cares about out of the
/// capabilities document. Parsing is namespace-agnostic: tag local names
/// only, because devices disagree on prefixes.
fn parse_capabilities(host: &str, base_url: &str, xml: &str) -> Option<EsclDevice> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    let text_of = |tag: &str| -> Option<String> {
        doc.descendants()
            .find(|n| n.tag_name().name() == tag)
            .and_then(|n| n.text())
            .map(|t| t.trim().to_owned())
    };

    let name = text_of("MakeAndModel").unwrap_or_else(|| host.to_owned());

    let mut resolutions: Vec<u32> = doc
        .descendants()
        .filter(|n| n.tag_name().name() == "XResolution")
        .filter_map(|n| n.text().and_then(|t| t.trim().parse().ok()))
        .collect();
    resolutions.sort_unstable();
    resolutions.dedup();
    if resolutions.is_empty() {
        resolutions = vec![200, 300];
    }

    let mut pixel_kinds: Vec<PixelType> = doc
        .descendants()
        .filter(|n| n.tag_name().name() == "ColorMode")
        .filter_map(|n| n.text())
        .filter_map(|t| match t.trim() {
            "RGB24" => Some(PixelType::Rgb),
            "Grayscale8" => Some(PixelType::Gray8),
            "BlackAndWhite1" => Some(PixelType::Bw1),
            _ => None,
        })
        .collect();
    pixel_kinds.dedup();
    if pixel_kinds.is_empty() {
        pixel_kinds = vec![PixelType::Rgb];
    }

    let has_feeder = doc.descendants().any(|n| n.tag_name().name() == "Adf");
    let has_duplex = doc
        .descendants()
        .any(|n| n.tag_name().name().eq_ignore_ascii_case("AdfDuplexInputCaps"));

    Some(EsclDevice {
        id: host.to_owned(),
        name,
        base_url: base_url.to_owned(),
        resolutions,
        pixel_kinds,
        has_feeder,
        has_duplex,
    })
}

/// Render the job creation document for the given settings.
fn scan_settings_xml(settings: &ScanSettings) -> String {
    let color_mode = match settings.pixel_type {
        PixelType::Rgb => "RGB24",
        PixelType::Gray8 => "Grayscale8",
        PixelType::Bw1 => "BlackAndWhite1",
    };
    let source = if settings.use_adf { "Feeder" } else { "Platen" };
    let duplex = if settings.duplex { "true" } else { "false" };
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<scan:ScanSettings",
            " xmlns:scan=\"http://schemas.hp.com/imaging/escl/2011/05/03\"",
            " xmlns:pwg=\"http://www.pwg.org/schemas/2010/12/sm\">",
            "<pwg:Version>2.0</pwg:Version>",
            "<scan:InputSource>{source}</scan:InputSource>",
            "<scan:ColorMode>{color}</scan:ColorMode>",
            "<scan:XResolution>{dpi}</scan:XResolution>",
            "<scan:YResolution>{dpi}</scan:YResolution>",
            "<scan:Duplex>{duplex}</scan:Duplex>",
            "<pwg:DocumentFormat>image/jpeg</pwg:DocumentFormat>",
            "</scan:ScanSettings>"
        ),
        source = source,
        color = color_mode,
        dpi = settings.dpi,
        duplex = duplex,
    )
}

/// Resolve a possibly-relative job Location against the capabilities base.
fn job_url(base_url: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.trim_end_matches('/').to_owned();
    }
    let origin = base_url
        .find("://")
        .and_then(|scheme_end| {
            base_url[scheme_end + 3..]
                .find('/')
                .map(|path_start| &base_url[..scheme_end + 3 + path_start])
        })
        .unwrap_or(base_url);
    format!("{}/{}", origin.trim_end_matches('/'), location.trim_start_matches('/'))
}

/// Drain one job: poll `NextDocument` until the device reports the end,
/// then delete the job. Emits exactly one terminal event.
#[allow(clippy::too_many_arguments)]
async fn run_job(
    client: reqwest::Client,
    device: EsclDevice,
    settings: ScanSettings,
    request_id: String,
    cancel: CancellationToken,
    events: EventSink,
    state: Arc<Mutex<EsclState>>,
) {
    let terminal = drain_documents(&client, &device, &settings, &request_id, &cancel, &events)
        .await;
    // Release the job before the terminal event is visible, so a
    // back-to-back start finds the backend idle.
    state.lock().job = None;
    let _ = events.send(terminal).await;
}

async fn drain_documents(
    client: &reqwest::Client,
    device: &EsclDevice,
    settings: &ScanSettings,
    request_id: &str,
    cancel: &CancellationToken,
    events: &EventSink,
) -> BackendEvent {
    let completed = |pages: u32| BackendEvent::Completed {
        request_id: request_id.to_owned(),
        total_pages: pages,
    };
    let failed = |message: String| BackendEvent::Error {
        request_id: request_id.to_owned(),
        message,
    };

    // Create the job.
    let create_url = format!("{}/ScanJobs", device.base_url);
    let response = match client
        .post(&create_url)
        .header("Content-Type", "text/xml")
        .body(scan_settings_xml(settings))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => return failed(format!("job creation failed: {e}")),
    };
    if !response.status().is_success() {
        return failed(format!("job creation failed: HTTP {}", response.status()));
    }
    let Some(location) = response
        .headers()
        .get("Location")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return failed("job creation answered without a Location".to_owned());
    };
    let job = job_url(&device.base_url, &location);
    debug!(job = %job, "network scan job created");

    let mut pages = 0u32;
    let mut busy_retries = 0u32;
    let outcome = loop {
        if cancel.is_cancelled() {
            break completed(pages);
        }
        let next = format!("{job}/NextDocument");
        let response = tokio::select! {
            _ = cancel.cancelled() => break completed(pages),
            r = client.get(&next).send() => r,
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => break failed(format!("document fetch failed: {e}")),
        };
        match response.status().as_u16() {
            200 => {
                busy_retries = 0;
                let bytes = match response.bytes().await {
                    Ok(b) => Bytes::from(b.to_vec()),
                    Err(e) => break failed(format!("document body failed: {e}")),
                };
                pages += 1;
                let (width, height) = image::load_from_memory(&bytes)
                    .map(|i| (i.width(), i.height()))
                    .unwrap_or((0, 0));
                let meta = PageMetadata {
                    width,
                    height,
                    format: "jpg".to_owned(),
                    size: bytes.len(),
                    dpi: settings.dpi,
                };
                let page = BackendEvent::Page {
                    request_id: request_id.to_owned(),
                    bytes,
                    meta,
                    ordinal: pages,
                };
                if events.send(page).await.is_err() {
                    break completed(pages);
                }
                if !settings.wants_more_pages(pages) {
                    break completed(pages);
                }
            }
            503 => {
                // The device is composing the next page.
                busy_retries += 1;
                if busy_retries > BUSY_RETRY_LIMIT {
                    break failed("device stayed busy past the retry budget".to_owned());
                }
                tokio::select! {
                    _ = cancel.cancelled() => break completed(pages),
                    _ = tokio::time::sleep(BUSY_RETRY_DELAY) => {}
                }
            }
            404 => {
                // All documents delivered.
                if pages > 0 || cancel.is_cancelled() {
                    break completed(pages);
                }
                break failed("device returned no documents".to_owned());
            }
            status => {
                break failed(format!("document fetch failed: HTTP {status}"));
            }
        }
    };

    // Best-effort job deletion regardless of how the drain ended.
    if let Err(e) = client.delete(&job).send().await {
        debug!(job = %job, err = %e, "job deletion failed");
    }

    outcome
}

#[async_trait]
impl ScannerBackend for EsclBackend {
    fn name(&self) -> &'static str {
        ESCL_TAG
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.probe_once().await;
        let mut state = self.state.lock();
        state.initialized = true;
        debug!(candidates = state.hosts.len(), alive = state.alive.len(), "network backend ready");
        Ok(())
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Some(ref job) = state.job {
            job.cancel.cancel();
        }
        state.alive.clear();
        state.selected = None;
        state.initialized = false;
    }

    async fn enumerate(&self) -> Vec<Device> {
        let state = self.state.lock();
        if !state.initialized {
            return Vec::new();
        }
        state
            .alive
            .values()
            .map(|d| Device {
                id: d.id.clone(),
                name: d.name.clone(),
                is_default: false,
                capabilities: None,
            })
            .collect()
    }

    async fn select(&self, local_id: &str) -> anyhow::Result<()> {
        // Re-probe on a miss so a freshly registered endpoint is selectable
        // before the next periodic pass.
        if self.device(local_id).is_none() {
            self.probe_once().await;
        }
        let Some(_) = self.device(local_id) else {
            bail!("no network scanner at {local_id}");
        };
        let mut state = self.state.lock();
        state.selected = Some(local_id.to_owned());
        state.applied = ScanSettings::default();
        Ok(())
    }

    async fn capabilities(&self, local_id: &str) -> Option<CapabilitySnapshot> {
        let device = self.device(local_id)?;
        Some(Self::snapshot_from(&device))
    }

    async fn apply(&self, settings: &ScanSettings) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.job.is_some() {
            bail!("scan in progress");
        }
        if state.selected.is_none() {
            bail!("no device selected");
        }
        // Settings travel in the job creation document; nothing is pushed
        // to the device until the scan starts.
        state.applied = settings.clone();
        Ok(())
    }

    async fn apply_advanced(&self, key: &str, value: &serde_json::Value) -> FieldResult {
        match key.strip_prefix("e:") {
            Some("documentFormat") => match value.as_str() {
                Some("image/jpeg") => FieldResult::applied(key, value.clone()),
                Some(other) => {
                    FieldResult::rejected(key, format!("unsupported transfer format: {other}"))
                }
                None => FieldResult::rejected(key, "expected a string"),
            },
            Some(_) | None => FieldResult::rejected(key, "unknown advanced key"),
        }
    }

    async fn start(&self, request_id: &str) -> anyhow::Result<()> {
        let (device, settings, cancel) = {
            let mut state = self.state.lock();
            if state.job.is_some() {
                bail!("scan in progress");
            }
            let selected = state
                .selected
                .clone()
                .ok_or_else(|| anyhow!("no device selected"))?;
            let device = state
                .alive
                .get(&selected)
                .cloned()
                .ok_or_else(|| anyhow!("network scanner went away: {selected}"))?;
            let cancel = CancellationToken::new();
            state.job = Some(EsclJob {
                request_id: request_id.to_owned(),
                cancel: cancel.clone(),
            });
            (device, state.applied.clone(), cancel)
        };

        tokio::spawn(run_job(
            self.client.clone(),
            device,
            settings,
            request_id.to_owned(),
            cancel,
            self.events.clone(),
            Arc::clone(&self.state),
        ));
        Ok(())
    }

    async fn stop(&self) {
        let state = self.state.lock();
        if let Some(ref job) = state.job {
            debug!(request_id = %job.request_id, "network scan stop requested");
            job.cancel.cancel();
        }
    }
}

#[cfg(test)]
#[path = "escl_tests.rs"]
mod tests;
