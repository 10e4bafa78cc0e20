// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device capability snapshots and the baseline capability set.
//!
//! Every backend reports the baseline keys; families may add experimental
//! keys under a backend-qualified namespace (e.g. `a:transferMode`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CAP_DPI: &str = "dpi";
pub const CAP_PIXEL_TYPE: &str = "pixelType";
pub const CAP_PAPER_SIZE: &str = "paperSize";
pub const CAP_USE_ADF: &str = "useAdf";
pub const CAP_DUPLEX: &str = "duplex";
pub const CAP_MAX_PAGES: &str = "maxPages";
pub const CAP_SHOW_UI: &str = "showUI";

/// Value type tag for a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    Bool,
    Int,
    Enum,
    String,
}

/// One capability descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub key: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub value_type: CapabilityType,
    pub is_readable: bool,
    pub is_writable: bool,
    pub experimental: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_values: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<serde_json::Value>,
}

impl Capability {
    pub fn new(key: &str, label: &str, value_type: CapabilityType) -> Self {
        Self {
            key: key.to_owned(),
            label: label.to_owned(),
            description: None,
            value_type,
            is_readable: true,
            is_writable: true,
            experimental: false,
            supported_values: None,
            current_value: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.is_writable = false;
        self
    }

    pub fn experimental(mut self) -> Self {
        self.experimental = true;
        self
    }

    pub fn with_values(mut self, values: Vec<serde_json::Value>) -> Self {
        self.supported_values = Some(values);
        self
    }

    pub fn with_current(mut self, value: serde_json::Value) -> Self {
        self.current_value = Some(value);
        self
    }

    /// Check a candidate value against this descriptor's type and, for enum
    /// capabilities, its supported list (strings matched case-insensitively).
    pub fn accepts(&self, value: &serde_json::Value) -> Result<(), String> {
        if !self.is_writable {
            return Err(format!("{} is read-only", self.key));
        }
        let type_ok = match self.value_type {
            CapabilityType::Bool => value.is_boolean(),
            CapabilityType::Int => value.is_i64() || value.is_u64(),
            CapabilityType::Enum | CapabilityType::String => value.is_string(),
        };
        if !type_ok {
            return Err(format!("{} expects a {:?} value", self.key, self.value_type));
        }
        if self.value_type == CapabilityType::Enum {
            if let Some(ref supported) = self.supported_values {
                let matched = supported.iter().any(|candidate| {
                    match (candidate.as_str(), value.as_str()) {
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        _ => candidate == value,
                    }
                });
                if !matched {
                    return Err(format!(
                        "{} does not support {}",
                        self.key,
                        value.as_str().unwrap_or("that value")
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Snapshot of a device's capabilities: key to descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySnapshot(pub BTreeMap<String, Capability>);

impl CapabilitySnapshot {
    pub fn get(&self, key: &str) -> Option<&Capability> {
        self.0.get(key)
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap.key.clone(), cap);
    }

    pub fn entries(&self) -> impl Iterator<Item = &Capability> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Builder for the baseline snapshot shared by every family.
pub struct BaselineCaps {
    pub dpi_values: Vec<u32>,
    pub pixel_types: Vec<&'static str>,
    pub paper_sizes: Vec<&'static str>,
    pub has_adf: bool,
    pub has_duplex: bool,
    pub has_ui: bool,
}

impl BaselineCaps {
    pub fn snapshot(&self) -> CapabilitySnapshot {
        let mut snap = CapabilitySnapshot::default();
        snap.insert(
            Capability::new(CAP_DPI, "Resolution", CapabilityType::Int)
                .with_values(self.dpi_values.iter().map(|d| (*d).into()).collect()),
        );
        snap.insert(
            Capability::new(CAP_PIXEL_TYPE, "Color mode", CapabilityType::Enum)
                .with_values(self.pixel_types.iter().map(|p| (*p).into()).collect()),
        );
        snap.insert(
            Capability::new(CAP_PAPER_SIZE, "Paper size", CapabilityType::Enum)
                .with_values(self.paper_sizes.iter().map(|p| (*p).into()).collect()),
        );
        let adf = Capability::new(CAP_USE_ADF, "Use document feeder", CapabilityType::Bool);
        snap.insert(if self.has_adf { adf } else { adf.read_only() });
        let duplex = Capability::new(CAP_DUPLEX, "Two-sided", CapabilityType::Bool);
        snap.insert(if self.has_duplex { duplex } else { duplex.read_only() });
        snap.insert(Capability::new(CAP_MAX_PAGES, "Page limit", CapabilityType::Int));
        let ui = Capability::new(CAP_SHOW_UI, "Driver dialog", CapabilityType::Bool);
        snap.insert(if self.has_ui { ui } else { ui.read_only() });
        snap
    }
}

/// Status of one field in an `apply_device_settings` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldStatus {
    Applied,
    Rejected,
}

/// Per-field outcome record for settings application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldResult {
    pub key: String,
    pub status: FieldStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_value: Option<serde_json::Value>,
}

impl FieldResult {
    pub fn applied(key: &str, value: serde_json::Value) -> Self {
        Self {
            key: key.to_owned(),
            status: FieldStatus::Applied,
            message: None,
            applied_value: Some(value),
        }
    }

    pub fn rejected(key: &str, message: impl Into<String>) -> Self {
        Self {
            key: key.to_owned(),
            status: FieldStatus::Rejected,
            message: Some(message.into()),
            applied_value: None,
        }
    }
}

#[cfg(test)]
#[path = "capability_tests.rs"]
mod tests;
