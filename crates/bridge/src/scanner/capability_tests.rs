// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::{BaselineCaps, Capability, CapabilityType, FieldResult, FieldStatus, CAP_DPI,
    CAP_DUPLEX, CAP_PIXEL_TYPE, CAP_SHOW_UI};

fn baseline() -> super::CapabilitySnapshot {
    BaselineCaps {
        dpi_values: vec![100, 200, 300, 600],
        pixel_types: vec!["RGB", "GRAY8", "BW1"],
        paper_sizes: vec!["A4", "LETTER"],
        has_adf: true,
        has_duplex: false,
        has_ui: false,
    }
    .snapshot()
}

#[test]
fn baseline_contains_the_seven_keys() {
    let snap = baseline();
    for key in ["dpi", "pixelType", "paperSize", "useAdf", "duplex", "maxPages", "showUI"] {
        assert!(snap.get(key).is_some(), "missing {key}");
    }
    assert_eq!(snap.len(), 7);
}

#[test]
fn unsupported_features_become_read_only() {
    let snap = baseline();
    assert!(!snap.get(CAP_DUPLEX).expect("duplex").is_writable);
    assert!(!snap.get(CAP_SHOW_UI).expect("showUI").is_writable);
    assert!(snap.get("useAdf").expect("useAdf").is_writable);
}

#[test]
fn enum_accepts_case_insensitively() {
    let snap = baseline();
    let pixel = snap.get(CAP_PIXEL_TYPE).expect("pixelType");
    assert!(pixel.accepts(&json!("gray8")).is_ok());
    assert!(pixel.accepts(&json!("RGB")).is_ok());
    assert!(pixel.accepts(&json!("CMYK")).is_err());
}

#[test]
fn type_mismatches_are_rejected() {
    let snap = baseline();
    let dpi = snap.get(CAP_DPI).expect("dpi");
    assert!(dpi.accepts(&json!(300)).is_ok());
    assert!(dpi.accepts(&json!("300")).is_err());
}

#[test]
fn read_only_rejects_writes() {
    let cap = Capability::new("vendor", "Vendor", CapabilityType::String).read_only();
    assert!(cap.accepts(&json!("x")).is_err());
}

#[test]
fn field_result_serialization_omits_empty_fields() {
    let ok = FieldResult::applied("dpi", json!(300));
    let value = serde_json::to_value(&ok).expect("serialize");
    assert_eq!(value["status"], "applied");
    assert_eq!(value["appliedValue"], 300);
    assert!(value.get("message").is_none());

    let bad = FieldResult::rejected("dpi", "nope");
    assert_eq!(bad.status, FieldStatus::Rejected);
    let value = serde_json::to_value(&bad).expect("serialize");
    assert!(value.get("appliedValue").is_none());
    assert_eq!(value["message"], "nope");
}
