// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scanbridge: loopback WebSocket bridge between browser pages and locally
//! attached document scanners.

pub mod cert;
pub mod config;
pub mod error;
pub mod gateway;
pub mod prefs;
pub mod protocol;
pub mod recompress;
pub mod scanner;
pub mod session;
pub mod state;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cert::CertificateManager;
use crate::config::BridgeConfig;
use crate::scanner::escl::EsclBackend;
use crate::scanner::imaging::ImagingBackend;
use crate::scanner::router::ScannerRouter;
use crate::scanner::vendor::VendorBackend;
use crate::scanner::virtualdev;
use crate::scanner::{ESCL_TAG, IMAGING_TAG, VENDOR_TAG};
use crate::state::{BridgeState, UiEvent};

/// Run the daemon until shutdown.
pub async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    // reqwest and the TLS listener share the process-wide provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let state_dir = config::state_dir();
    let shutdown = CancellationToken::new();

    // Assemble the device families. The vendor and imaging seams take
    // platform glue from embedders; this binary wires the virtual fleet
    // when asked, and the network family always.
    let (mut router, events) = ScannerRouter::new(256);
    if config.virtual_devices {
        let sink = router.attach(VENDOR_TAG);
        router.register(Box::new(VendorBackend::new(
            Box::new(virtualdev::development_vendor_host()),
            sink,
        )));
        let sink = router.attach(IMAGING_TAG);
        router.register(Box::new(ImagingBackend::new(
            Arc::new(virtualdev::development_imaging_service()),
            sink,
        )));
        info!("virtual device families registered");
    }
    let sink = router.attach(ESCL_TAG);
    let escl = EsclBackend::new(config.escl_hosts.clone(), sink);
    if let Some(interval) = config.escl_probe_interval() {
        escl.spawn_prober(interval, shutdown.clone());
    }
    router.register(Box::new(escl));
    router.initialize_all().await;

    let state = Arc::new(BridgeState::new(
        config.clone(),
        router,
        state_dir.clone(),
        shutdown.clone(),
    ));

    gateway::registry::spawn_dispatcher(Arc::clone(&state), events);
    session::spawn_sweeper(
        Arc::clone(&state.sessions),
        config.sweep_interval(),
        shutdown.clone(),
    );

    // Certificate material for the TLS listener. Failure disables WSS only.
    let cert_path = config
        .certificate_path
        .clone()
        .unwrap_or_else(|| state_dir.join("certificate.pem"));
    let cert_manager = CertificateManager::new(
        cert_path,
        config.certificate_validity_days,
        config.certificate_subject.clone(),
        config.auto_install_certificate,
    );
    let bundle = cert_manager.obtain();

    // Both listeners bind independently; the daemon runs as long as at
    // least one of them could.
    let mut listeners = Vec::new();

    let ws_addr = format!("{}:{}", config.host, config.ws_port);
    match TcpListener::bind(&ws_addr).await {
        Ok(listener) => {
            info!(addr = %ws_addr, "ws listener bound");
            listeners.push(tokio::spawn(gateway::serve_ws(Arc::clone(&state), listener)));
        }
        Err(e) => warn!(addr = %ws_addr, err = %e, "ws listener failed to bind"),
    }

    if let Some(ref bundle) = bundle {
        let wss_addr = format!("{}:{}", config.host, config.wss_port);
        match cert::server_config(bundle) {
            Ok(tls_config) => match TcpListener::bind(&wss_addr).await {
                Ok(listener) => {
                    info!(addr = %wss_addr, "wss listener bound");
                    listeners.push(tokio::spawn(gateway::serve_wss(
                        Arc::clone(&state),
                        listener,
                        Arc::new(tls_config),
                    )));
                }
                Err(e) => warn!(addr = %wss_addr, err = %e, "wss listener failed to bind"),
            },
            Err(e) => warn!(err = %e, "TLS configuration failed, wss disabled"),
        }
    } else {
        warn!("no certificate available, wss disabled");
    }

    if listeners.is_empty() {
        state.notify_ui(UiEvent::Fatal { message: "no listener could bind".to_owned() });
        anyhow::bail!("no listener could bind");
    }

    // Ctrl-c tears the whole tree down.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    for handle in listeners {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "listener ended with error"),
            Err(e) => warn!(err = %e, "listener task panicked"),
        }
    }

    // Release device handles in reverse registration order.
    state.router.shutdown_all().await;
    info!("scanbridge stopped");
    Ok(())
}
