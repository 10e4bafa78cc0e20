// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use yare::parameterized;

use super::{PixelType, ScanSettings};

#[parameterized(
    rgb = { "RGB", PixelType::Rgb },
    rgb_lower = { "rgb", PixelType::Rgb },
    color = { "Color", PixelType::Rgb },
    gray8_mixed = { "Gray8", PixelType::Gray8 },
    grayscale = { "grayscale", PixelType::Gray8 },
    bitonal = { "BITONAL", PixelType::Bw1 },
    bw = { "bw", PixelType::Bw1 },
)]
fn pixel_type_parses_case_insensitively(input: &str, expected: PixelType) {
    assert_eq!(PixelType::parse(input), Some(expected));
}

#[test]
fn pixel_type_rejects_unknown() {
    assert_eq!(PixelType::parse("cmyk"), None);
}

#[test]
fn defaults_match_the_wire_contract() {
    let s = ScanSettings::default();
    assert_eq!(s.dpi, 200);
    assert_eq!(s.pixel_type, PixelType::Rgb);
    assert_eq!(s.paper_size, "A4");
    assert!(!s.duplex);
    assert!(!s.show_ui);
    assert!(s.use_adf);
    assert_eq!(s.max_pages, -1);
    assert!(!s.continuous_scan);
    assert!(s.protocols.is_none());
}

#[test]
fn missing_fields_fall_back_to_defaults() {
    let s: ScanSettings = serde_json::from_str(r#"{"dpi":300}"#).expect("parse");
    assert_eq!(s.dpi, 300);
    assert_eq!(s.paper_size, "A4");
    assert_eq!(s.max_pages, -1);
}

#[test]
fn canonicalize_uppercases_paper_size() {
    let mut s = ScanSettings { paper_size: "a4".to_owned(), ..Default::default() };
    s.canonicalize();
    assert_eq!(s.paper_size, "A4");
}

#[test]
fn zero_max_pages_is_invalid() {
    let s = ScanSettings { max_pages: 0, ..Default::default() };
    assert!(s.validate().is_err());
    let s = ScanSettings { max_pages: -1, ..Default::default() };
    assert!(s.validate().is_ok());
}

#[test]
fn zero_dpi_is_invalid() {
    let s = ScanSettings { dpi: 0, ..Default::default() };
    assert!(s.validate().is_err());
}

#[test]
fn page_cap_accounting() {
    let unlimited = ScanSettings { max_pages: -1, ..Default::default() };
    assert!(unlimited.wants_more_pages(10_000));

    let capped = ScanSettings { max_pages: 2, ..Default::default() };
    assert!(capped.wants_more_pages(0));
    assert!(capped.wants_more_pages(1));
    assert!(!capped.wants_more_pages(2));
}

#[test]
fn serializes_pixel_type_uppercase() {
    let s = ScanSettings { pixel_type: PixelType::Gray8, ..Default::default() };
    let json = serde_json::to_value(&s).expect("serialize");
    assert_eq!(json["pixelType"], "GRAY8");
}

#[test]
fn show_ui_uses_the_exact_wire_key() {
    let s: ScanSettings = serde_json::from_str(r#"{"showUI":true}"#).expect("parse");
    assert!(s.show_ui);
    let json = serde_json::to_value(&s).expect("serialize");
    assert_eq!(json["showUI"], true);
    assert!(json.get("showUi").is_none());
}
