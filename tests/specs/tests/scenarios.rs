// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end protocol scenarios over real WebSocket connections.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;

use scanbridge::scanner::virtualdev::VirtualVendorConfig;
use scanbridge::state::UiEvent;
use scanbridge_specs::{DaemonOptions, TestDaemon};

// -- Authentication -----------------------------------------------------------

#[tokio::test]
async fn authenticate_then_ping() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;

    let resp = client.request(json!({"action": "authenticate", "requestId": "r1"})).await?;
    assert_eq!(resp["status"], "success");
    assert_eq!(resp["action"], "authenticate");
    assert_eq!(resp["requestId"], "r1");
    let token = resp["token"].as_str().expect("token");
    assert!(token.len() >= 43);
    assert!(resp["expiresAt"].as_str().expect("expiresAt").ends_with('Z'));

    let pong = client
        .request(json!({"action": "ping", "requestId": "r2", "token": token}))
        .await?;
    assert_eq!(pong["status"], "success");
    assert_eq!(pong["action"], "pong");
    assert_eq!(pong["requestId"], "r2");
    assert_eq!(pong["message"], "pong");
    Ok(())
}

#[tokio::test]
async fn authenticated_actions_require_a_token() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;

    let resp = client.request(json!({"action": "list_scanners", "requestId": "r1"})).await?;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["errorCode"], "UNAUTHORIZED");

    let resp = client
        .request(json!({"action": "list_scanners", "requestId": "r2", "token": "bogus"}))
        .await?;
    assert_eq!(resp["errorCode"], "INVALID_TOKEN");
    Ok(())
}

#[tokio::test]
async fn stale_tokens_are_rejected() -> anyhow::Result<()> {
    let options = DaemonOptions { token_ttl_minutes: 0, ..Default::default() };
    let daemon = TestDaemon::start_with(options).await?;
    let mut client = daemon.connect().await?;

    let token = client.authenticate().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let resp = client
        .request(json!({"action": "list_scanners", "requestId": "r1", "token": token}))
        .await?;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["errorCode"], "INVALID_TOKEN");
    Ok(())
}

#[tokio::test]
async fn session_cap_refuses_further_authentication() -> anyhow::Result<()> {
    let options = DaemonOptions { max_sessions: 1, ..Default::default() };
    let daemon = TestDaemon::start_with(options).await?;

    let mut first = daemon.connect().await?;
    first.authenticate().await?;

    let mut second = daemon.connect().await?;
    let resp = second.request(json!({"action": "authenticate", "requestId": "r1"})).await?;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["errorCode"], "INTERNAL_ERROR");
    Ok(())
}

// -- Enumeration and selection ------------------------------------------------

#[tokio::test]
async fn list_select_and_capabilities() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;

    let resp = client
        .request(json!({"action": "list_scanners", "requestId": "r1", "token": token}))
        .await?;
    assert_eq!(resp["status"], "success");
    let scanners = resp["scanners"].as_array().expect("scanners");
    let adf = scanners
        .iter()
        .find(|s| s["id"] == "a:ACME ADF")
        .expect("namespaced vendor device");
    assert_eq!(adf["protocol"], "a");
    assert!(scanners.iter().any(|s| s["id"] == "b:unit-1"));

    let resp = client
        .request(json!({
            "action": "select_scanner", "requestId": "r2", "token": token,
            "settings": {"source": "a:ACME ADF"},
        }))
        .await?;
    assert_eq!(resp["status"], "success");
    assert_eq!(resp["scannerId"], "a:ACME ADF");
    assert_eq!(resp["protocol"], "a");

    let resp = client
        .request(json!({"action": "get_device_capabilities", "requestId": "r3", "token": token}))
        .await?;
    assert_eq!(resp["status"], "success");
    assert_eq!(resp["scannerId"], "a:ACME ADF");
    let caps = resp["capabilities"].as_array().expect("capabilities");
    for key in ["dpi", "pixelType", "paperSize", "useAdf", "duplex", "maxPages", "showUI"] {
        assert!(caps.iter().any(|c| c["key"] == key), "missing {key}");
    }
    Ok(())
}

#[tokio::test]
async fn selecting_an_unknown_scanner_fails() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;

    let resp = client
        .request(json!({
            "action": "select_scanner", "requestId": "r1", "token": token,
            "settings": {"source": "a:NotThere"},
        }))
        .await?;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["errorCode"], "SCANNER_NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn apply_device_settings_reports_per_field_results() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;
    client
        .request(json!({
            "action": "select_scanner", "requestId": "r1", "token": token,
            "settings": {"source": "a:ACME ADF"},
        }))
        .await?;

    let resp = client
        .request(json!({
            "action": "apply_device_settings", "requestId": "r2", "token": token,
            "patch": {"dpi": 300, "pixelType": "CMYK"},
        }))
        .await?;
    assert_eq!(resp["status"], "success");
    let results = resp["results"].as_array().expect("results");
    let dpi = results.iter().find(|r| r["key"] == "dpi").expect("dpi");
    assert_eq!(dpi["status"], "applied");
    assert_eq!(dpi["appliedValue"], 300);
    let pixel = results.iter().find(|r| r["key"] == "pixelType").expect("pixelType");
    assert_eq!(pixel["status"], "rejected");

    // The applied value shows up as the capability's current value.
    let resp = client
        .request(json!({"action": "get_device_capabilities", "requestId": "r3", "token": token}))
        .await?;
    let caps = resp["capabilities"].as_array().expect("capabilities");
    let dpi = caps.iter().find(|c| c["key"] == "dpi").expect("dpi");
    assert_eq!(dpi["currentValue"], 300);
    Ok(())
}

// -- Scanning -----------------------------------------------------------------

async fn select_adf(client: &mut scanbridge_specs::WsClient, token: &str) -> anyhow::Result<()> {
    let resp = client
        .request(json!({
            "action": "select_scanner", "requestId": "sel", "token": token,
            "settings": {"source": "a:ACME ADF"},
        }))
        .await?;
    anyhow::ensure!(resp["status"] == "success", "select failed: {resp}");
    Ok(())
}

#[tokio::test]
async fn two_page_adf_scan_streams_in_order() -> anyhow::Result<()> {
    let mut adf = VirtualVendorConfig::named("ACME ADF");
    adf.is_default = true;
    adf.feeder_pages = 5;
    let options = DaemonOptions { vendor: vec![adf], ..Default::default() };
    let daemon = TestDaemon::start_with(options).await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;
    select_adf(&mut client, &token).await?;

    client
        .send(json!({
            "action": "scan", "requestId": "job-1", "token": token,
            "settings": {"dpi": 300, "pixelType": "Gray8", "useAdf": true, "maxPages": 2},
        }))
        .await?;

    for expected in 1..=2 {
        let frame = client.recv().await?;
        assert_eq!(frame["status"], "scanning", "frame: {frame}");
        assert_eq!(frame["requestId"], "job-1");
        assert_eq!(frame["pageNumber"], expected);
        let data = frame["data"].as_str().expect("data");
        let bytes = BASE64.decode(data)?;
        assert!(!bytes.is_empty());
        assert_eq!(frame["metadata"]["size"], bytes.len() as u64);
        assert_eq!(frame["metadata"]["dpi"], 300);
    }

    let done = client.recv().await?;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["requestId"], "job-1");
    assert_eq!(done["totalPages"], 2);

    client.expect_quiet(Duration::from_millis(200)).await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_scan_on_same_session_is_rejected() -> anyhow::Result<()> {
    let mut adf = VirtualVendorConfig::named("ACME ADF");
    adf.is_default = true;
    adf.feeder_pages = 10;
    adf.page_delay = Duration::from_millis(20);
    let options = DaemonOptions { vendor: vec![adf], ..Default::default() };
    let daemon = TestDaemon::start_with(options).await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;
    select_adf(&mut client, &token).await?;

    client
        .send(json!({"action": "scan", "requestId": "first", "token": token, "settings": {}}))
        .await?;
    client
        .send(json!({"action": "scan", "requestId": "second", "token": token, "settings": {}}))
        .await?;

    let mut saw_busy = false;
    let mut saw_completed = false;
    let mut pages = 0u64;
    while !(saw_busy && saw_completed) {
        let frame = client.recv().await?;
        match (frame["requestId"].as_str(), frame["status"].as_str()) {
            (Some("second"), Some("error")) => {
                assert_eq!(frame["errorCode"], "SCANNER_BUSY");
                saw_busy = true;
            }
            (Some("first"), Some("scanning")) => {
                pages += 1;
                assert_eq!(frame["pageNumber"], pages);
            }
            (Some("first"), Some("completed")) => {
                assert_eq!(frame["totalPages"], pages);
                saw_completed = true;
            }
            other => panic!("unexpected frame {other:?}: {frame}"),
        }
    }
    Ok(())
}

#[tokio::test]
async fn stop_scan_cancels_and_suppresses_terminals() -> anyhow::Result<()> {
    let mut adf = VirtualVendorConfig::named("ACME ADF");
    adf.is_default = true;
    adf.feeder_pages = 10;
    adf.page_delay = Duration::from_millis(25);
    let options = DaemonOptions { vendor: vec![adf], ..Default::default() };
    let daemon = TestDaemon::start_with(options).await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;
    select_adf(&mut client, &token).await?;

    client
        .send(json!({"action": "scan", "requestId": "job", "token": token, "settings": {}}))
        .await?;

    // Wait for a page so the job is well underway, then cancel.
    let frame = client.recv().await?;
    assert_eq!(frame["status"], "scanning");
    client
        .send(json!({"action": "stop_scan", "requestId": "stop-1", "token": token}))
        .await?;

    // The cancellation acknowledgment arrives; pages already in flight may
    // precede it, but no terminal frame for "job" may follow it.
    loop {
        let frame = client.recv().await?;
        if frame["requestId"] == "stop-1" {
            assert_eq!(frame["status"], "cancelled");
            break;
        }
        assert_eq!(frame["status"], "scanning", "only pages may precede the ack: {frame}");
    }
    client.expect_quiet(Duration::from_millis(300)).await?;
    Ok(())
}

#[tokio::test]
async fn stop_scan_without_a_job_is_cancelled() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;

    let resp = client
        .request(json!({"action": "stop_scan", "requestId": "r1", "token": token}))
        .await?;
    assert_eq!(resp["status"], "cancelled");
    Ok(())
}

#[tokio::test]
async fn headless_scan_against_dialog_only_device_hints_show_ui() -> anyhow::Result<()> {
    let mut adf = VirtualVendorConfig::named("ACME ADF");
    adf.is_default = true;
    adf.features.ui_required = true;
    let options = DaemonOptions { vendor: vec![adf], ..Default::default() };
    let daemon = TestDaemon::start_with(options).await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;
    select_adf(&mut client, &token).await?;

    let resp = client
        .request(json!({
            "action": "scan", "requestId": "job", "token": token,
            "settings": {"showUI": false},
        }))
        .await?;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["errorCode"], "SCAN_FAILED");
    assert!(
        resp["message"].as_str().expect("message").contains("showUI"),
        "missing hint: {resp}"
    );
    Ok(())
}

#[tokio::test]
async fn scan_without_selection_reports_scanner_not_found() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;
    let token = client.authenticate().await?;

    let resp = client
        .request(json!({"action": "scan", "requestId": "job", "token": token, "settings": {}}))
        .await?;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["errorCode"], "SCANNER_NOT_FOUND");
    Ok(())
}

// -- Protocol edges -----------------------------------------------------------

#[tokio::test]
async fn invalid_frames_answer_invalid_request_and_keep_the_connection() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;

    let resp = client.request(json!({"action": "make_coffee", "requestId": "r1"})).await?;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["errorCode"], "INVALID_REQUEST");
    assert_eq!(resp["requestId"], "r1");

    client.send_text("definitely not json").await?;
    let resp = client.recv().await?;
    assert_eq!(resp["errorCode"], "INVALID_REQUEST");

    // The connection survived both.
    let pong = client.request(json!({"action": "ping", "requestId": "r2"})).await?;
    assert_eq!(pong["action"], "pong");
    Ok(())
}

#[tokio::test]
async fn legacy_wake_frame_emits_a_ui_event_and_no_response() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut ui = daemon.state.subscribe_ui();
    let mut client = daemon.connect().await?;

    client.send_text("1100").await?;

    let woke = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ui.recv().await {
                Ok(UiEvent::WakeUp) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await?;
    assert!(woke, "wake-up event not observed");
    client.expect_quiet(Duration::from_millis(200)).await?;
    Ok(())
}

#[tokio::test]
async fn disconnect_removes_the_session() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut client = daemon.connect().await?;
    client.authenticate().await?;
    assert_eq!(daemon.state.sessions.len(), 1);

    drop(client);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !daemon.state.sessions.is_empty() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "session never removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

// -- TLS ----------------------------------------------------------------------

#[tokio::test]
async fn wss_listener_serves_the_same_protocol() -> anyhow::Result<()> {
    let options = DaemonOptions { tls: true, ..Default::default() };
    let daemon = TestDaemon::start_with(options).await?;
    let mut client = daemon.connect().await?;

    let token = client.authenticate().await?;
    let resp = client
        .request(json!({"action": "list_scanners", "requestId": "r1", "token": token}))
        .await?;
    assert_eq!(resp["status"], "success");
    assert!(resp["scanners"].as_array().is_some_and(|s| !s.is_empty()));
    Ok(())
}
