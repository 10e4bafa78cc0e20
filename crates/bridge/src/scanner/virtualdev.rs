// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Virtual device families: deterministic in-memory scanners implementing
//! the native seams of the vendor and imaging backends.
//!
//! These power the test suites and the `--virtual-devices` mode, so SDK work
//! and protocol debugging need no hardware. Pages are real encoded images
//! (a small gradient with a page-number stripe), produced at transfer time.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};

use crate::scanner::imaging::{
    ImagingDeviceDesc, ImagingError, ImagingProp, ImagingService, ImagingUnit,
};
use crate::scanner::settings::PixelType;
use crate::scanner::vendor::{
    DeviceOption, DriverFault, DriverSignal, DuplexSupport, UiMode, VendorDevice,
    VendorDeviceDesc, VendorFeatures, VendorHost,
};
use crate::scanner::RawPage;

/// Render one synthetic page. Deterministic for a given `(seq, dpi)`.
pub fn render_page(seq: u32, dpi: u32) -> RawPage {
    // Keep the raster small; realism lives in the encoding, not the size.
    let width = 64 + (dpi / 25).min(64);
    let height = 96 + (dpi / 25).min(64);
    let stripe = (seq % 8) * (height / 8);
    let img = RgbImage::from_fn(width, height, |x, y| {
        if y >= stripe && y < stripe + 4 {
            Rgb([0, 0, 0])
        } else {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        }
    });
    let mut buf = Cursor::new(Vec::new());
    // Encoding a freshly built raster cannot fail; fall back to raw bytes
    // so the signature stays infallible either way.
    let bytes = if img.write_to(&mut buf, ImageFormat::Png).is_ok() {
        buf.into_inner()
    } else {
        img.into_raw()
    };
    RawPage { bytes: Bytes::from(bytes), width, height, format: "png".to_owned() }
}

// -- Vendor family ------------------------------------------------------------

/// Behavior knobs for one virtual vendor device.
#[derive(Debug, Clone)]
pub struct VirtualVendorConfig {
    pub name: String,
    /// Driver-populated id; `None` mimics drivers that only fill it in after
    /// the device has been opened.
    pub id: Option<String>,
    pub is_default: bool,
    /// Pages the feeder holds per transfer.
    pub feeder_pages: u32,
    pub features: VendorFeatures,
    /// Fail `open_device` to exercise select errors.
    pub fail_open: bool,
    /// Push a redundant fault after the terminal signal, like noisy stacks do.
    pub noisy_faults: bool,
    pub page_delay: Duration,
}

impl VirtualVendorConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            id: Some(name.to_owned()),
            is_default: false,
            feeder_pages: 3,
            features: VendorFeatures {
                resolutions: vec![100, 200, 300, 600],
                pixel_kinds: vec![PixelType::Rgb, PixelType::Gray8, PixelType::Bw1],
                paper_sizes: vec!["A4".to_owned(), "LETTER".to_owned()],
                feeder: true,
                duplex: DuplexSupport::Both,
                ui_required: false,
                modeless_ui: true,
            },
            fail_open: false,
            noisy_faults: false,
            page_delay: Duration::from_millis(2),
        }
    }
}

struct VirtualVendorDeviceState {
    aborted: AtomicBool,
}

struct VirtualVendorDevice {
    config: VirtualVendorConfig,
    dpi: u32,
    use_feeder: bool,
    transfer_count: i32,
    state: Arc<VirtualVendorDeviceState>,
}

impl VendorDevice for VirtualVendorDevice {
    fn local_id(&self) -> String {
        self.config.id.clone().unwrap_or_else(|| self.config.name.clone())
    }

    fn features(&self) -> VendorFeatures {
        self.config.features.clone()
    }

    fn set_option(&mut self, option: DeviceOption) -> Result<(), DriverFault> {
        match option {
            DeviceOption::Dpi(dpi) => {
                if !self.config.features.resolutions.contains(&dpi) {
                    return Err(DriverFault::Failed(format!("unsupported resolution {dpi}")));
                }
                self.dpi = dpi;
            }
            DeviceOption::PixelKind(kind) => {
                if !self.config.features.pixel_kinds.contains(&kind) {
                    return Err(DriverFault::Unsupported);
                }
            }
            DeviceOption::PaperSize(_) => {}
            DeviceOption::UseFeeder(use_feeder) => {
                if use_feeder && !self.config.features.feeder {
                    return Err(DriverFault::Unsupported);
                }
                self.use_feeder = use_feeder;
            }
            DeviceOption::Duplex(_) => {
                if self.config.features.duplex == DuplexSupport::None {
                    return Err(DriverFault::Unsupported);
                }
            }
            DeviceOption::TransferCount(count) => self.transfer_count = count,
        }
        Ok(())
    }

    fn begin_transfer(
        &mut self,
        ui: UiMode,
        signals: std_mpsc::Sender<DriverSignal>,
    ) -> Result<(), DriverFault> {
        if self.config.features.ui_required && ui == UiMode::None {
            return Err(DriverFault::UiRequired);
        }
        if ui == UiMode::Modeless && !self.config.features.modeless_ui {
            return Err(DriverFault::Failed("modeless dialog unavailable".to_owned()));
        }
        self.state.aborted.store(false, Ordering::Release);

        let available = if self.use_feeder { self.config.feeder_pages } else { 1 };
        let capped = if self.transfer_count > 0 {
            available.min(self.transfer_count as u32)
        } else {
            available
        };
        let dpi = self.dpi;
        let delay = self.config.page_delay;
        let use_feeder = self.use_feeder;
        let noisy = self.config.noisy_faults;
        let state = Arc::clone(&self.state);

        std::thread::spawn(move || {
            let mut sent = 0u32;
            for seq in 0..capped {
                if state.aborted.load(Ordering::Acquire) {
                    let _ = signals.send(DriverSignal::Fault("transfer aborted".to_owned()));
                    return;
                }
                std::thread::sleep(delay);
                let _ = signals.send(DriverSignal::Page(render_page(seq + 1, dpi)));
                sent += 1;
            }
            if use_feeder && sent == available {
                let _ = signals.send(DriverSignal::FeederEmpty);
            } else {
                let _ = signals.send(DriverSignal::Done);
            }
            if noisy {
                // Some stacks keep polling the feeder after the batch and
                // report the empty tray as a transfer error.
                let _ = signals.send(DriverSignal::Fault("feeder empty".to_owned()));
                let _ = signals.send(DriverSignal::FeederEmpty);
            }
        });
        Ok(())
    }

    fn abort_transfer(&mut self) {
        self.state.aborted.store(true, Ordering::Release);
    }

    fn end_transfer(&mut self) {}

    fn close(&mut self) {}
}

/// A virtual vendor host library holding a fixed set of devices.
pub struct VirtualVendorHost {
    devices: Vec<VirtualVendorConfig>,
    fail_open: bool,
    opened: bool,
}

impl VirtualVendorHost {
    pub fn new(devices: Vec<VirtualVendorConfig>) -> Self {
        Self { devices, fail_open: false, opened: false }
    }

    /// A host whose `open` fails, for init-error coverage.
    pub fn broken() -> Self {
        Self { devices: Vec::new(), fail_open: true, opened: false }
    }
}

impl VendorHost for VirtualVendorHost {
    fn open(&mut self) -> Result<(), DriverFault> {
        if self.fail_open {
            return Err(DriverFault::Offline("virtual host disabled".to_owned()));
        }
        self.opened = true;
        Ok(())
    }

    fn devices(&mut self) -> Result<Vec<VendorDeviceDesc>, DriverFault> {
        if !self.opened {
            return Err(DriverFault::Offline("host not open".to_owned()));
        }
        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| VendorDeviceDesc {
                handle: i as u32,
                id: d.id.clone(),
                name: d.name.clone(),
                is_default: d.is_default,
            })
            .collect())
    }

    fn open_device(&mut self, handle: u32) -> Result<Box<dyn VendorDevice>, DriverFault> {
        let config = self
            .devices
            .get(handle as usize)
            .ok_or_else(|| DriverFault::Offline(format!("no device #{handle}")))?
            .clone();
        if config.fail_open {
            return Err(DriverFault::Offline(format!("{} is switched off", config.name)));
        }
        Ok(Box::new(VirtualVendorDevice {
            config,
            dpi: 200,
            use_feeder: false,
            transfer_count: -1,
            state: Arc::new(VirtualVendorDeviceState { aborted: AtomicBool::new(false) }),
        }))
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

// -- Imaging family -----------------------------------------------------------

/// Behavior knobs for one virtual imaging unit.
#[derive(Debug, Clone)]
pub struct VirtualImagingConfig {
    pub desc: ImagingDeviceDesc,
    /// Pages the source yields per job.
    pub pages: u32,
    pub page_delay: Duration,
}

impl VirtualImagingConfig {
    pub fn named(id: &str, name: &str) -> Self {
        Self {
            desc: ImagingDeviceDesc {
                id: id.to_owned(),
                name: name.to_owned(),
                is_default: false,
                feeder: true,
                duplex: false,
                resolutions: vec![150, 200, 300],
                pixel_kinds: vec![PixelType::Rgb, PixelType::Gray8],
                paper_sizes: vec!["A4".to_owned()],
            },
            pages: 2,
            page_delay: Duration::from_millis(2),
        }
    }
}

pub struct VirtualImagingService {
    devices: Vec<VirtualImagingConfig>,
    fail: bool,
}

impl VirtualImagingService {
    pub fn new(devices: Vec<VirtualImagingConfig>) -> Self {
        Self { devices, fail: false }
    }

    pub fn broken() -> Self {
        Self { devices: Vec::new(), fail: true }
    }
}

impl ImagingService for VirtualImagingService {
    fn enumerate(&self) -> Result<Vec<ImagingDeviceDesc>, ImagingError> {
        if self.fail {
            return Err(ImagingError::Offline("virtual service disabled".to_owned()));
        }
        Ok(self.devices.iter().map(|d| d.desc.clone()).collect())
    }

    fn open(&self, id: &str) -> Result<Box<dyn ImagingUnit>, ImagingError> {
        let config = self
            .devices
            .iter()
            .find(|d| d.desc.id == id)
            .cloned()
            .ok_or_else(|| ImagingError::Offline(format!("no unit {id}")))?;
        Ok(Box::new(VirtualImagingUnit { config, dpi: 200, pulled: 0 }))
    }
}

struct VirtualImagingUnit {
    config: VirtualImagingConfig,
    dpi: u32,
    pulled: u32,
}

impl ImagingUnit for VirtualImagingUnit {
    fn descriptor(&self) -> ImagingDeviceDesc {
        self.config.desc.clone()
    }

    fn set_property(&mut self, prop: ImagingProp) -> Result<(), ImagingError> {
        match prop {
            ImagingProp::Dpi(dpi) => {
                if !self.config.desc.resolutions.contains(&dpi) {
                    return Err(ImagingError::Failed(format!("unsupported resolution {dpi}")));
                }
                self.dpi = dpi;
            }
            ImagingProp::Duplex(true) if !self.config.desc.duplex => {
                return Err(ImagingError::Unsupported);
            }
            _ => {}
        }
        Ok(())
    }

    fn next_page(
        &mut self,
        stop: &std::sync::atomic::AtomicBool,
    ) -> Result<Option<RawPage>, ImagingError> {
        if stop.load(Ordering::Acquire) {
            return Err(ImagingError::Cancelled);
        }
        if self.pulled >= self.config.pages {
            return Ok(None);
        }
        std::thread::sleep(self.config.page_delay);
        if stop.load(Ordering::Acquire) {
            return Err(ImagingError::Cancelled);
        }
        self.pulled += 1;
        Ok(Some(render_page(self.pulled, self.dpi)))
    }

    fn close(&mut self) {
        self.pulled = 0;
    }
}

// -- Default development fleet ------------------------------------------------

/// The vendor host exposed by `--virtual-devices`.
pub fn development_vendor_host() -> VirtualVendorHost {
    let mut adf = VirtualVendorConfig::named("Virtual ADF Scanner");
    adf.is_default = true;
    let mut flatbed = VirtualVendorConfig::named("Virtual Flatbed");
    flatbed.feeder_pages = 0;
    flatbed.features.feeder = false;
    flatbed.features.duplex = DuplexSupport::None;
    VirtualVendorHost::new(vec![adf, flatbed])
}

/// The imaging service exposed by `--virtual-devices`.
pub fn development_imaging_service() -> VirtualImagingService {
    VirtualImagingService::new(vec![VirtualImagingConfig::named(
        "virtual-imaging-1",
        "Virtual Imaging Unit",
    )])
}
