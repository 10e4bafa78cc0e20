// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Size-adaptive page recompression.
//!
//! Pages ride the text channel as base64, so oversized payloads hurt twice:
//! once in encoding overhead and once in the client's frame handling. Pages
//! at or above the threshold are re-encoded as lossy JPEG; everything else
//! passes through untouched. Failures are non-fatal and leave the page as
//! it was.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, warn};

pub const DEFAULT_THRESHOLD_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Stateless page recompressor.
#[derive(Debug, Clone, Copy)]
pub struct Recompressor {
    threshold: usize,
    quality: u8,
}

impl Default for Recompressor {
    fn default() -> Self {
        Self { threshold: DEFAULT_THRESHOLD_BYTES, quality: DEFAULT_JPEG_QUALITY }
    }
}

impl Recompressor {
    pub fn new(threshold: usize, quality: u8) -> Self {
        Self { threshold, quality }
    }

    /// Recompress `bytes` when they are at or above the threshold. Returns
    /// the (possibly new) payload and format tag.
    pub fn process(&self, bytes: Bytes, format: &str) -> (Bytes, String) {
        if bytes.len() < self.threshold {
            return (bytes, format.to_owned());
        }
        match self.reencode(&bytes) {
            Ok(jpeg) => {
                debug!(from = bytes.len(), to = jpeg.len(), "page recompressed");
                (jpeg, "jpg".to_owned())
            }
            Err(e) => {
                warn!(size = bytes.len(), err = %e, "page recompression failed, passing through");
                (bytes, format.to_owned())
            }
        }
    }

    fn reencode(&self, bytes: &[u8]) -> anyhow::Result<Bytes> {
        let img = image::load_from_memory(bytes)?;
        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, self.quality);
        img.write_with_encoder(encoder)?;
        Ok(Bytes::from(buf.into_inner()))
    }
}

#[cfg(test)]
#[path = "recompress_tests.rs"]
mod tests;
