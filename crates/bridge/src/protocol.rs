// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire codec: JSON text frames in, tagged requests out; typed response
//! frames back. One logical request per frame; responses echo `requestId`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::scanner::capability::{Capability, FieldResult};
use crate::scanner::router::DeviceInfo;
use crate::scanner::settings::ScanSettings;
use crate::scanner::PageMetadata;

/// Legacy wake-up payload. Accepted verbatim, bypasses authentication, and
/// produces a UI event instead of a response.
pub const LEGACY_WAKE_FRAME: &str = "1100";

/// Patch over the baseline settings; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paper_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_adf: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplex: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<i32>,
    // camelCase would render this "showUi"; the wire key is "showUI".
    #[serde(rename = "showUI", skip_serializing_if = "Option::is_none")]
    pub show_ui: Option<bool>,
}

impl DeviceSettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.dpi.is_none()
            && self.pixel_type.is_none()
            && self.paper_size.is_none()
            && self.use_adf.is_none()
            && self.duplex.is_none()
            && self.max_pages.is_none()
            && self.show_ui.is_none()
    }
}

/// A parsed client request, tagged by `action`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    Authenticate {
        request_id: String,
        #[serde(default)]
        client_id: Option<String>,
    },
    Ping {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    ListScanners {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        settings: Option<ScanSettings>,
    },
    SelectScanner {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        settings: Option<ScanSettings>,
    },
    GetCapabilities {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    GetDeviceCapabilities {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    ApplyDeviceSettings {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        patch: Option<DeviceSettingsPatch>,
        #[serde(default)]
        advanced: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Scan {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        settings: Option<ScanSettings>,
    },
    StopScan {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
    },
}

impl Request {
    /// The wire action tag, used when echoing responses.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Ping { .. } => "ping",
            Self::ListScanners { .. } => "list_scanners",
            Self::SelectScanner { .. } => "select_scanner",
            Self::GetCapabilities { .. } => "get_capabilities",
            Self::GetDeviceCapabilities { .. } => "get_device_capabilities",
            Self::ApplyDeviceSettings { .. } => "apply_device_settings",
            Self::Scan { .. } => "scan",
            Self::StopScan { .. } => "stop_scan",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Authenticate { request_id, .. }
            | Self::Ping { request_id, .. }
            | Self::ListScanners { request_id, .. }
            | Self::SelectScanner { request_id, .. }
            | Self::GetCapabilities { request_id, .. }
            | Self::GetDeviceCapabilities { request_id, .. }
            | Self::ApplyDeviceSettings { request_id, .. }
            | Self::Scan { request_id, .. }
            | Self::StopScan { request_id, .. } => request_id,
        }
    }

    /// The auth token, for actions that require one.
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Authenticate { .. } => None,
            Self::Ping { token, .. }
            | Self::ListScanners { token, .. }
            | Self::SelectScanner { token, .. }
            | Self::GetCapabilities { token, .. }
            | Self::GetDeviceCapabilities { token, .. }
            | Self::ApplyDeviceSettings { token, .. }
            | Self::Scan { token, .. }
            | Self::StopScan { token, .. } => token.as_deref(),
        }
    }
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug)]
pub enum Decoded {
    Request(Box<Request>),
    /// The legacy `"1100"` wake-up payload.
    WakeUp,
    /// Undecodable frame; `request_id` is echoed when extractable.
    Invalid { request_id: Option<String>, reason: String },
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> Decoded {
    if text.trim() == LEGACY_WAKE_FRAME {
        return Decoded::WakeUp;
    }
    match serde_json::from_str::<Request>(text) {
        Ok(req) => Decoded::Request(Box::new(req)),
        Err(e) => {
            // Salvage the request id for the error echo if the frame was at
            // least a JSON object.
            let request_id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("requestId").and_then(|r| r.as_str()).map(String::from));
            Decoded::Invalid { request_id, reason: e.to_string() }
        }
    }
}

/// Response status tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
    Scanning,
    Completed,
    Cancelled,
}

/// One outbound response frame. Optional fields absent from an action's
/// payload stay `None` and are omitted on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub status: Status,
    pub action: String,
    pub request_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanners: Option<Vec<DeviceInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<Capability>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<FieldResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Frame {
    fn base(status: Status, action: &str, request_id: &str) -> Self {
        Self {
            status,
            action: action.to_owned(),
            request_id: request_id.to_owned(),
            timestamp: timestamp_now(),
            message: None,
            token: None,
            expires_at: None,
            scanners: None,
            scanner_id: None,
            protocol: None,
            capabilities: None,
            results: None,
            metadata: None,
            data: None,
            page_number: None,
            total_pages: None,
            error_code: None,
            error_details: None,
        }
    }

    pub fn success(action: &str, request_id: &str) -> Self {
        Self::base(Status::Success, action, request_id)
    }

    pub fn error(action: &str, request_id: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut frame = Self::base(Status::Error, action, request_id);
        frame.error_code = Some(code);
        frame.message = Some(message.into());
        frame
    }

    pub fn page(
        action: &str,
        request_id: &str,
        meta: PageMetadata,
        data_b64: String,
        page_number: u32,
    ) -> Self {
        let mut frame = Self::base(Status::Scanning, action, request_id);
        frame.metadata = Some(meta);
        frame.data = Some(data_b64);
        frame.page_number = Some(page_number);
        frame
    }

    pub fn completed(action: &str, request_id: &str, total_pages: u32) -> Self {
        let mut frame = Self::base(Status::Completed, action, request_id);
        frame.total_pages = Some(total_pages);
        frame
    }

    pub fn cancelled(action: &str, request_id: &str) -> Self {
        Self::base(Status::Cancelled, action, request_id)
    }

    pub fn scan_error(
        request_id: &str,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        let mut frame = Self::base(Status::Error, "scan", request_id);
        frame.error_code = Some(code);
        frame.message = Some(message.into());
        frame.error_details = details;
        frame
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Serialize for the wire. Serialization of this shape cannot fail; an
    /// empty object is returned in the unreachable error arm.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
