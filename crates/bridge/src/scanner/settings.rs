// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Canonical scan settings shared by the protocol layer and the backends.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Pixel interpretation for transferred pages. Stored canonically in
/// uppercase; parsed case-insensitively with common aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelType {
    #[default]
    Rgb,
    Gray8,
    Bw1,
}

impl PixelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rgb => "RGB",
            Self::Gray8 => "GRAY8",
            Self::Bw1 => "BW1",
        }
    }

    /// Case-insensitive parse with the aliases browser SDKs have shipped.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RGB" | "COLOR" | "COLOUR" => Some(Self::Rgb),
            "GRAY8" | "GREY8" | "GRAY" | "GREY" | "GRAYSCALE" => Some(Self::Gray8),
            "BW1" | "BW" | "BITONAL" | "BLACKWHITE" | "MONO" => Some(Self::Bw1),
            _ => None,
        }
    }
}

impl Serialize for PixelType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PixelType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown pixel type: {s}")))
    }
}

/// Request-scoped scan settings, with the wire defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanSettings {
    pub dpi: u32,
    pub pixel_type: PixelType,
    pub paper_size: String,
    pub duplex: bool,
    // camelCase would render this "showUi"; the wire key is "showUI".
    #[serde(rename = "showUI")]
    pub show_ui: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub use_adf: bool,
    /// -1 means unlimited; positive is a hard cap; 0 is invalid.
    pub max_pages: i32,
    pub continuous_scan: bool,
    /// Backend filter for enumeration. Empty/absent means all backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            dpi: 200,
            pixel_type: PixelType::Rgb,
            paper_size: "A4".to_owned(),
            duplex: false,
            show_ui: false,
            source: None,
            use_adf: true,
            max_pages: -1,
            continuous_scan: false,
            protocols: None,
        }
    }
}

impl ScanSettings {
    /// Normalize fields to their canonical stored form.
    pub fn canonicalize(&mut self) {
        self.paper_size = self.paper_size.to_ascii_uppercase();
    }

    /// Validate the enumerable constraints that do not depend on a device.
    pub fn validate(&self) -> Result<(), String> {
        if self.dpi == 0 {
            return Err("dpi must be a positive integer".to_owned());
        }
        if self.max_pages == 0 {
            return Err("maxPages must be -1 (unlimited) or positive".to_owned());
        }
        Ok(())
    }

    /// Whether the page-count cap permits another page after `transferred`.
    pub fn wants_more_pages(&self, transferred: u32) -> bool {
        self.max_pages < 0 || transferred < self.max_pages as u32
    }
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
