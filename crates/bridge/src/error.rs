// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error codes carried in error response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    InvalidToken,
    TokenExpired,
    InvalidRequest,
    ScannerNotFound,
    ScannerBusy,
    ScanFailed,
    NoScannersAvailable,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ScannerNotFound => "SCANNER_NOT_FOUND",
            Self::ScannerBusy => "SCANNER_BUSY",
            Self::ScanFailed => "SCAN_FAILED",
            Self::NoScannersAvailable => "NO_SCANNERS_AVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
