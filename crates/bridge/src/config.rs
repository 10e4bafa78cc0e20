// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

/// Configuration for the scanbridge daemon.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "scanbridge", about = "Loopback WebSocket bridge for document scanners")]
pub struct BridgeConfig {
    /// Host to bind both listeners on.
    #[arg(long, default_value = "127.0.0.1", env = "SCANBRIDGE_HOST")]
    pub host: String,

    /// Plaintext WebSocket port.
    #[arg(long, default_value_t = 8180, env = "SCANBRIDGE_WS_PORT")]
    pub ws_port: u16,

    /// TLS WebSocket port.
    #[arg(long, default_value_t = 8181, env = "SCANBRIDGE_WSS_PORT")]
    pub wss_port: u16,

    /// Path to the PEM certificate bundle. Defaults to `<state-dir>/certificate.pem`.
    #[arg(long, env = "SCANBRIDGE_CERTIFICATE_PATH")]
    pub certificate_path: Option<PathBuf>,

    /// Validity window for newly generated certificates, in days.
    #[arg(long, default_value_t = 365, env = "SCANBRIDGE_CERTIFICATE_VALIDITY_DAYS")]
    pub certificate_validity_days: u32,

    /// Extra DNS subject to include in generated certificates.
    #[arg(long, env = "SCANBRIDGE_CERTIFICATE_SUBJECT")]
    pub certificate_subject: Option<String>,

    /// Install the generated certificate into the user trust store.
    #[arg(long, env = "SCANBRIDGE_AUTO_INSTALL_CERTIFICATE")]
    pub auto_install_certificate: bool,

    /// Session token lifetime in minutes.
    #[arg(long, default_value_t = 30, env = "SCANBRIDGE_TOKEN_TTL_MINUTES")]
    pub token_ttl_minutes: u64,

    /// Maximum number of live sessions.
    #[arg(long, default_value_t = 16, env = "SCANBRIDGE_MAX_SESSIONS")]
    pub max_sessions: usize,

    /// Expired-session sweep interval in seconds.
    #[arg(long, default_value_t = 300, env = "SCANBRIDGE_SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: u64,

    /// Page payloads at or above this many bytes are recompressed to JPEG.
    #[arg(long, default_value_t = 5 * 1024 * 1024, env = "SCANBRIDGE_RECOMPRESS_THRESHOLD_BYTES")]
    pub recompress_threshold_bytes: usize,

    /// JPEG quality used when recompressing oversized pages.
    #[arg(long, default_value_t = 85, env = "SCANBRIDGE_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Manually registered network scanner endpoints (`host:port`), repeatable.
    #[arg(long = "escl-host", env = "SCANBRIDGE_ESCL_HOSTS", value_delimiter = ',')]
    pub escl_hosts: Vec<String>,

    /// Network scanner discovery probe interval in seconds. 0 disables probing.
    #[arg(long, default_value_t = 60, env = "SCANBRIDGE_ESCL_PROBE_SECS")]
    pub escl_probe_secs: u64,

    /// Register the built-in virtual devices (development / SDK work without hardware).
    #[arg(long, env = "SCANBRIDGE_VIRTUAL_DEVICES")]
    pub virtual_devices: bool,
}

impl BridgeConfig {
    pub fn token_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.token_ttl_minutes * 60)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn escl_probe_interval(&self) -> Option<std::time::Duration> {
        (self.escl_probe_secs > 0)
            .then(|| std::time::Duration::from_secs(self.escl_probe_secs))
    }
}

/// Resolve the state directory for scanbridge data (certificate, preferences).
///
/// Checks `SCANBRIDGE_STATE_DIR`, then `$XDG_STATE_HOME/scanbridge`,
/// then `$HOME/.local/state/scanbridge`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SCANBRIDGE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("scanbridge");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/scanbridge");
    }
    PathBuf::from(".scanbridge")
}
