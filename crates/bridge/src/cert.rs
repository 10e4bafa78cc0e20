// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TLS certificate lifecycle: load, validate, regenerate, optionally trust.
//!
//! The daemon provisions its own certificate on first start: ECDSA P-256,
//! CN=localhost, SANs for localhost plus both loopback addresses, validity
//! from yesterday to the configured horizon. The bundle (certificate +
//! PKCS#8 key) is one PEM file written atomically. A certificate within 30
//! days of expiry is replaced on the next start.
//!
//! Trust-store installation is best-effort and idempotent by thumbprint;
//! the daemon serves TLS either way.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Regenerate when fewer than this many days of validity remain.
const RENEWAL_WINDOW_DAYS: i64 = 30;

/// Loaded certificate material ready for the TLS listener.
pub struct CertBundle {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// SHA-256 of the leaf certificate, lowercase hex.
    pub thumbprint: String,
}

/// Owns the on-disk certificate bundle.
pub struct CertificateManager {
    path: PathBuf,
    validity_days: u32,
    extra_subject: Option<String>,
    auto_install: bool,
}

impl CertificateManager {
    pub fn new(
        path: PathBuf,
        validity_days: u32,
        extra_subject: Option<String>,
        auto_install: bool,
    ) -> Self {
        Self { path, validity_days, extra_subject, auto_install }
    }

    /// Produce usable certificate material, regenerating when the stored
    /// bundle is missing, unreadable, or close to expiry. `None` means TLS
    /// stays disabled for this run.
    pub fn obtain(&self) -> Option<CertBundle> {
        match self.load_if_fresh() {
            Ok(Some(bundle)) => {
                debug!(path = %self.path.display(), "reusing stored certificate");
                self.maybe_install(&bundle);
                return Some(bundle);
            }
            Ok(None) => {}
            Err(e) => warn!(err = %e, "stored certificate unusable, regenerating"),
        }

        match self.generate_and_store() {
            Ok(()) => info!(path = %self.path.display(), "certificate generated"),
            Err(e) => {
                warn!(err = %e, "certificate generation failed");
                return None;
            }
        }
        match self.load_bundle() {
            Ok(bundle) => {
                self.maybe_install(&bundle);
                Some(bundle)
            }
            Err(e) => {
                warn!(err = %e, "freshly written certificate failed to load");
                None
            }
        }
    }

    /// Load the stored bundle if it exists and has more than the renewal
    /// window left.
    fn load_if_fresh(&self) -> anyhow::Result<Option<CertBundle>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bundle = self.load_bundle()?;
        let leaf = bundle.certs.first().ok_or_else(|| anyhow!("bundle has no certificate"))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| anyhow!("certificate parse: {e}"))?;
        let not_after = parsed.validity().not_after.timestamp();
        let now = chrono::Utc::now().timestamp();
        let days_left = (not_after - now) / 86_400;
        if days_left <= RENEWAL_WINDOW_DAYS {
            info!(days_left, "certificate near expiry, regenerating");
            return Ok(None);
        }
        Ok(Some(bundle))
    }

    fn load_bundle(&self) -> anyhow::Result<CertBundle> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut reader = BufReader::new(file);
        let mut certs = Vec::new();
        let mut key = None;
        for item in rustls_pemfile::read_all(&mut reader) {
            match item? {
                rustls_pemfile::Item::X509Certificate(der) => certs.push(der),
                rustls_pemfile::Item::Pkcs8Key(k) => key = Some(PrivateKeyDer::Pkcs8(k)),
                rustls_pemfile::Item::Sec1Key(k) => key = Some(PrivateKeyDer::Sec1(k)),
                rustls_pemfile::Item::Pkcs1Key(k) => key = Some(PrivateKeyDer::Pkcs1(k)),
                _ => {}
            }
        }
        let key = key.ok_or_else(|| anyhow!("bundle has no private key"))?;
        let leaf = certs.first().ok_or_else(|| anyhow!("bundle has no certificate"))?;
        let thumbprint = hex_digest(leaf.as_ref());
        Ok(CertBundle { certs, key, thumbprint })
    }

    fn generate_and_store(&self) -> anyhow::Result<()> {
        let mut sans = vec![
            "localhost".to_owned(),
            "127.0.0.1".to_owned(),
            "::1".to_owned(),
        ];
        if let Some(ref subject) = self.extra_subject {
            if !sans.contains(subject) {
                sans.push(subject.clone());
            }
        }

        let key_pair = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(sans)?;
        params.distinguished_name.push(rcgen::DnType::CommonName, "localhost");
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(i64::from(self.validity_days));
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let cert = params.self_signed(&key_pair)?;

        let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());
        self.write_atomic(pem.as_bytes())
    }

    /// Write tmp + rename, key-only permissions on unix.
    fn write_atomic(&self, contents: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Install into the user trust store when configured. Never fatal, and
    /// skipped entirely when the thumbprint marker says it already happened.
    fn maybe_install(&self, bundle: &CertBundle) {
        if !self.auto_install {
            return;
        }
        let marker = self.path.with_extension("trusted");
        if let Ok(recorded) = std::fs::read_to_string(&marker) {
            if recorded.trim() == bundle.thumbprint {
                debug!("certificate already trusted, skipping install");
                return;
            }
        }
        match install_in_user_trust_store(&self.path) {
            Ok(()) => {
                info!("certificate installed into the user trust store");
                if let Err(e) = std::fs::write(&marker, &bundle.thumbprint) {
                    warn!(err = %e, "failed to record trust marker");
                }
            }
            Err(e) => warn!(err = %e, "trust store install failed; TLS continues untrusted"),
        }
    }
}

/// Build the rustls server configuration for the WSS listener.
pub fn server_config(bundle: &CertBundle) -> anyhow::Result<rustls::ServerConfig> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(bundle.certs.clone(), bundle.key.clone_key())?;
    Ok(config)
}

fn hex_digest(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(target_os = "macos")]
fn install_in_user_trust_store(path: &Path) -> anyhow::Result<()> {
    let status = std::process::Command::new("security")
        .args(["add-trusted-cert", "-r", "trustRoot"])
        .arg(path)
        .status()?;
    anyhow::ensure!(status.success(), "security exited with {status}");
    Ok(())
}

#[cfg(target_os = "windows")]
fn install_in_user_trust_store(path: &Path) -> anyhow::Result<()> {
    let status = std::process::Command::new("certutil")
        .args(["-user", "-addstore", "Root"])
        .arg(path)
        .status()?;
    anyhow::ensure!(status.success(), "certutil exited with {status}");
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn install_in_user_trust_store(_path: &Path) -> anyhow::Result<()> {
    // No per-user trust store convention to target here; browsers accept a
    // manually trusted certificate instead.
    Err(anyhow!("no user trust store integration on this platform"))
}

#[cfg(test)]
#[path = "cert_tests.rs"]
mod tests;
