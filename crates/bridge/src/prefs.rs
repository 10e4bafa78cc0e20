// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User preferences: the sticky device-default record.
//!
//! Load is tolerant (missing or malformed files yield defaults); save is
//! best-effort with an atomic write and never surfaces into the scan path.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const PREFS_FILE: &str = "user-settings.json";

/// Persisted device-preference record.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPrefs {
    /// Namespaced id of the device flagged as default in listings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_device_id: Option<String>,
    /// Backend tag of that device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_protocol: Option<String>,
}

impl UserPrefs {
    /// Load from `dir/user-settings.json`; any problem yields defaults.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(PREFS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(prefs) => prefs,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "malformed preferences, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist atomically (write tmp + rename). Failures are logged only.
    pub fn save(&self, dir: &Path) {
        if let Err(e) = self.try_save(dir) {
            warn!(err = %e, "failed to save preferences");
        }
    }

    fn try_save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(PREFS_FILE);
        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
