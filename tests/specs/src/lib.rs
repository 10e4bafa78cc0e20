// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end protocol specs.
//!
//! Boots the daemon in-process on an ephemeral loopback port with virtual
//! device families, and drives it through real WebSocket clients.

use std::sync::{Arc, Once};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use scanbridge::cert::CertificateManager;
use scanbridge::config::BridgeConfig;
use scanbridge::gateway;
use scanbridge::scanner::imaging::ImagingBackend;
use scanbridge::scanner::router::ScannerRouter;
use scanbridge::scanner::vendor::VendorBackend;
use scanbridge::scanner::virtualdev::{
    VirtualImagingConfig, VirtualImagingService, VirtualVendorConfig, VirtualVendorHost,
};
use scanbridge::scanner::{IMAGING_TAG, VENDOR_TAG};
use scanbridge::state::BridgeState;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider. Safe to call repeatedly.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Knobs for a spec daemon.
pub struct DaemonOptions {
    pub vendor: Vec<VirtualVendorConfig>,
    pub imaging: Vec<VirtualImagingConfig>,
    pub token_ttl_minutes: u64,
    pub max_sessions: usize,
    /// Serve WSS (with a freshly generated certificate) instead of WS.
    pub tls: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        let mut adf = VirtualVendorConfig::named("ACME ADF");
        adf.is_default = true;
        Self {
            vendor: vec![adf],
            imaging: vec![VirtualImagingConfig::named("unit-1", "Virtual Imaging Unit")],
            token_ttl_minutes: 30,
            max_sessions: 16,
            tls: false,
        }
    }
}

fn spec_config(options: &DaemonOptions) -> BridgeConfig {
    BridgeConfig {
        host: "127.0.0.1".to_owned(),
        ws_port: 0,
        wss_port: 0,
        certificate_path: None,
        certificate_validity_days: 365,
        certificate_subject: None,
        auto_install_certificate: false,
        token_ttl_minutes: options.token_ttl_minutes,
        max_sessions: options.max_sessions,
        sweep_interval_secs: 300,
        recompress_threshold_bytes: 5 * 1024 * 1024,
        jpeg_quality: 85,
        escl_hosts: vec![],
        escl_probe_secs: 0,
        virtual_devices: false,
    }
}

/// One in-process daemon bound to an ephemeral port.
pub struct TestDaemon {
    pub port: u16,
    pub state: Arc<BridgeState>,
    tls: bool,
    shutdown: CancellationToken,
    _state_dir: tempfile::TempDir,
}

impl TestDaemon {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(DaemonOptions::default()).await
    }

    pub async fn start_with(options: DaemonOptions) -> anyhow::Result<Self> {
        ensure_crypto();
        let state_dir = tempfile::tempdir()?;
        let shutdown = CancellationToken::new();

        let (mut router, events) = ScannerRouter::new(64);
        let sink = router.attach(VENDOR_TAG);
        router.register(Box::new(VendorBackend::new(
            Box::new(VirtualVendorHost::new(options.vendor.clone())),
            sink,
        )));
        let sink = router.attach(IMAGING_TAG);
        router.register(Box::new(ImagingBackend::new(
            Arc::new(VirtualImagingService::new(options.imaging.clone())),
            sink,
        )));
        router.initialize_all().await;

        let state = Arc::new(BridgeState::new(
            spec_config(&options),
            router,
            state_dir.path().to_path_buf(),
            shutdown.clone(),
        ));
        gateway::registry::spawn_dispatcher(Arc::clone(&state), events);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        if options.tls {
            let manager = CertificateManager::new(
                state_dir.path().join("certificate.pem"),
                365,
                None,
                false,
            );
            let bundle = manager.obtain().ok_or_else(|| anyhow::anyhow!("no certificate"))?;
            let tls_config = Arc::new(scanbridge::cert::server_config(&bundle)?);
            tokio::spawn(gateway::serve_wss(Arc::clone(&state), listener, tls_config));
        } else {
            tokio::spawn(gateway::serve_ws(Arc::clone(&state), listener));
        }

        Ok(Self { port, state, tls: options.tls, shutdown, _state_dir: state_dir })
    }

    /// Open a client connection to this daemon.
    pub async fn connect(&self) -> anyhow::Result<WsClient> {
        let scheme = if self.tls { "wss" } else { "ws" };
        WsClient::connect(&format!("{scheme}://127.0.0.1:{}/", self.port)).await
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A WebSocket client speaking the bridge protocol.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        ensure_crypto();
        let stream = if url.starts_with("wss://") {
            let connector = tokio_tungstenite::Connector::Rustls(Arc::new(trusting_client_config()));
            let (stream, _) = tokio_tungstenite::connect_async_tls_with_config(
                url,
                None,
                false,
                Some(connector),
            )
            .await?;
            stream
        } else {
            let (stream, _) = tokio_tungstenite::connect_async(url).await?;
            stream
        };
        Ok(Self { stream })
    }

    /// Send one raw text frame.
    pub async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.stream.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Send one JSON frame.
    pub async fn send(&mut self, value: serde_json::Value) -> anyhow::Result<()> {
        self.send_text(&value.to_string()).await
    }

    /// Receive the next text frame as JSON, with a timeout.
    pub async fn recv(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for a frame"))?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
            match msg {
                Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => anyhow::bail!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Expect silence for `window`; fails if any text frame arrives.
    pub async fn expect_quiet(&mut self, window: Duration) -> anyhow::Result<()> {
        match tokio::time::timeout(window, self.stream.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(Message::Text(text)))) => {
                anyhow::bail!("unexpected frame during quiet window: {text}")
            }
            Ok(_) => Ok(()),
        }
    }

    /// Send a request and return the next frame.
    pub async fn request(&mut self, value: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.send(value).await?;
        self.recv().await
    }

    /// Run the authenticate handshake and return the token.
    pub async fn authenticate(&mut self) -> anyhow::Result<String> {
        let resp = self
            .request(serde_json::json!({"action": "authenticate", "requestId": "auth"}))
            .await?;
        anyhow::ensure!(resp["status"] == "success", "authenticate failed: {resp}");
        resp["token"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("no token in {resp}"))
    }
}

/// A rustls client config that accepts the daemon's self-signed certificate.
fn trusting_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
