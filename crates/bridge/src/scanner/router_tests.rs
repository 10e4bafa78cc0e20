// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use super::ScannerRouter;
use crate::protocol::DeviceSettingsPatch;
use crate::scanner::imaging::ImagingBackend;
use crate::scanner::settings::PixelType;
use crate::scanner::vendor::VendorBackend;
use crate::scanner::virtualdev::{
    VirtualImagingConfig, VirtualImagingService, VirtualVendorConfig, VirtualVendorHost,
};
use crate::scanner::{BackendEvent, ScanEvent, IMAGING_TAG, VENDOR_TAG};

async fn test_router() -> (ScannerRouter, mpsc::Receiver<ScanEvent>) {
    let (mut router, out_rx) = ScannerRouter::new(64);

    let mut adf = VirtualVendorConfig::named("ACME ADF");
    adf.is_default = true;
    adf.feeder_pages = 2;
    let vendor_sink = router.attach(VENDOR_TAG);
    let vendor = VendorBackend::new(Box::new(VirtualVendorHost::new(vec![adf])), vendor_sink);
    router.register(Box::new(vendor));

    let imaging_sink = router.attach(IMAGING_TAG);
    let imaging = ImagingBackend::new(
        Arc::new(VirtualImagingService::new(vec![VirtualImagingConfig::named(
            "unit-1", "Unit One",
        )])),
        imaging_sink,
    );
    router.register(Box::new(imaging));

    router.initialize_all().await;
    (router, out_rx)
}

async fn drain_to_terminal(rx: &mut mpsc::Receiver<ScanEvent>) -> ScanEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a router event")
            .expect("router event channel closed");
        if event.event.is_terminal() {
            return event;
        }
    }
}

#[tokio::test]
async fn ids_parse_with_backend_prefixes() {
    let (router, _rx) = test_router().await;
    assert_eq!(router.parse_id("a:ACME ADF"), ("a", "ACME ADF"));
    assert_eq!(router.parse_id("b:unit-1"), ("b", "unit-1"));
    // A bare id belongs to the default family.
    assert_eq!(router.parse_id("ACME ADF"), ("a", "ACME ADF"));
    // Unknown prefixes are not split: the whole string is a local id.
    assert_eq!(router.parse_id("x:whatever"), ("a", "x:whatever"));
}

#[tokio::test]
async fn enumerate_namespaces_and_filters() {
    let (router, _rx) = test_router().await;

    let all = router.enumerate(None, None).await;
    let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
    assert!(ids.contains(&"a:ACME ADF"));
    assert!(ids.contains(&"b:unit-1"));

    let only_imaging = router.enumerate(Some(&["b".to_owned()]), None).await;
    assert_eq!(only_imaging.len(), 1);
    assert_eq!(only_imaging[0].protocol, "b");

    let with_default = router.enumerate(None, Some("b:unit-1")).await;
    let unit = with_default.iter().find(|d| d.id == "b:unit-1").expect("unit");
    assert!(unit.is_default);
    let adf = with_default.iter().find(|d| d.id == "a:ACME ADF").expect("adf");
    assert!(!adf.is_default);
}

#[tokio::test]
async fn select_sets_the_active_cell_atomically() {
    let (router, _rx) = test_router().await;
    assert!(router.active().is_none());

    let active = router.select("a:ACME ADF").await.expect("select");
    assert_eq!(active.namespaced_id(), "a:ACME ADF");
    let cell = router.active().expect("active");
    assert_eq!(cell.protocol, "a");
    assert_eq!(cell.local_id, "ACME ADF");

    // Selecting elsewhere replaces the seat wholesale.
    router.select("b:unit-1").await.expect("select imaging");
    assert_eq!(router.active().expect("active").namespaced_id(), "b:unit-1");
}

#[tokio::test]
async fn select_unknown_device_fails_and_keeps_the_seat() {
    let (router, _rx) = test_router().await;
    router.select("a:ACME ADF").await.expect("select");
    assert!(router.select("a:NotThere").await.is_err());
    assert_eq!(router.active().expect("active").namespaced_id(), "a:ACME ADF");
}

#[tokio::test]
async fn single_seat_scan_rejection_and_release() {
    let (router, mut rx) = test_router().await;
    router.select("a:ACME ADF").await.expect("select");
    router.start("r1").await.expect("start");

    let second = router.start("r2").await;
    assert!(second.is_err(), "the seat is single occupancy");

    let terminal = drain_to_terminal(&mut rx).await;
    assert_eq!(terminal.protocol, "a");
    assert!(matches!(terminal.event, BackendEvent::Completed { .. }));

    // The fan-in released the seat before forwarding the terminal event.
    assert!(router.active_job().is_none());
    router.start("r2").await.expect("seat is free again");
    drain_to_terminal(&mut rx).await;
}

#[tokio::test]
async fn events_carry_the_backend_tag() {
    let (router, mut rx) = test_router().await;
    router.select("b:unit-1").await.expect("select");
    router.start("r9").await.expect("start");

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("closed");
    assert_eq!(event.protocol, "b");
    assert_eq!(event.event.request_id(), "r9");
    drain_to_terminal(&mut rx).await;
}

#[tokio::test]
async fn patch_application_yields_per_field_results() {
    let (router, _rx) = test_router().await;
    router.select("a:ACME ADF").await.expect("select");

    let patch = DeviceSettingsPatch {
        dpi: Some(300),
        pixel_type: Some("gray8".to_owned()),
        paper_size: Some("letter".to_owned()),
        max_pages: Some(0),
        ..Default::default()
    };
    let (active, results) = router.apply_patch(&patch, None).await.expect("patch");
    assert_eq!(active.namespaced_id(), "a:ACME ADF");

    let by_key = |k: &str| results.iter().find(|r| r.key == k).expect("result");
    assert!(by_key("dpi").applied_value.is_some());
    assert!(by_key("pixelType").applied_value.is_some());
    assert!(by_key("paperSize").applied_value.is_some());
    // Zero is never a legal cap.
    assert!(by_key("maxPages").applied_value.is_none());

    let applied = router.applied_settings();
    assert_eq!(applied.dpi, 300);
    assert_eq!(applied.pixel_type, PixelType::Gray8);
    assert_eq!(applied.paper_size, "LETTER");
    assert_eq!(applied.max_pages, -1);
}

#[tokio::test]
async fn patch_rejects_unsupported_enum_values() {
    let (router, _rx) = test_router().await;
    router.select("a:ACME ADF").await.expect("select");

    let patch = DeviceSettingsPatch {
        pixel_type: Some("CMYK".to_owned()),
        ..Default::default()
    };
    let (_, results) = router.apply_patch(&patch, None).await.expect("patch");
    assert_eq!(results.len(), 1);
    assert!(results[0].applied_value.is_none());
    // Nothing accepted, so the snapshot is untouched.
    assert_eq!(router.applied_settings().pixel_type, PixelType::Rgb);
}

#[tokio::test]
async fn patch_during_a_scan_fails_with_one_record() {
    let (router, mut rx) = test_router().await;
    router.select("a:ACME ADF").await.expect("select");
    router.start("r1").await.expect("start");

    let patch = DeviceSettingsPatch { dpi: Some(300), ..Default::default() };
    let (_, results) = router.apply_patch(&patch, None).await.expect("patch");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key, "scan");
    drain_to_terminal(&mut rx).await;
}

#[tokio::test]
async fn advanced_keys_route_to_the_owning_backend() {
    let (router, _rx) = test_router().await;
    router.select("a:ACME ADF").await.expect("select");

    let mut advanced = serde_json::Map::new();
    advanced.insert("a:duplexPass".to_owned(), json!("two"));
    advanced.insert("a:nonsense".to_owned(), json!(1));
    let (_, results) =
        router.apply_patch(&DeviceSettingsPatch::default(), Some(&advanced)).await.expect("patch");

    let by_key = |k: &str| results.iter().find(|r| r.key == k).expect("result");
    assert!(by_key("a:duplexPass").applied_value.is_some());
    assert!(by_key("a:nonsense").applied_value.is_none());
}

#[tokio::test]
async fn device_capabilities_report_current_values() {
    let (router, _rx) = test_router().await;
    router.select("a:ACME ADF").await.expect("select");

    let patch = DeviceSettingsPatch { dpi: Some(600), ..Default::default() };
    router.apply_patch(&patch, None).await.expect("patch");

    let (active, caps) = router.device_capabilities().await.expect("caps");
    assert_eq!(active.namespaced_id(), "a:ACME ADF");
    let dpi = caps.iter().find(|c| c.key == "dpi").expect("dpi");
    assert_eq!(dpi.current_value, Some(600.into()));
    // Experimental keys survive the merge.
    assert!(caps.iter().any(|c| c.key == "a:duplexPass" && c.experimental));
}

#[tokio::test]
async fn device_capabilities_require_a_selection() {
    let (router, _rx) = test_router().await;
    assert!(router.device_capabilities().await.is_err());
}
