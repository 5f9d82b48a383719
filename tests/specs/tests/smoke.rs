// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary-level smoke tests: lock file, control API, consumer WS policing.

use std::time::Duration;

use futures_util::StreamExt;
use relay_specs::RelayProcess;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Read until close; return the close code if one arrived.
async fn close_code(
    ws: &mut (impl StreamExt<
        Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
) -> Option<u16> {
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
        match frame {
            Ok(WsMessage::Close(frame)) => return frame.map(|f| u16::from(f.code)),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

#[tokio::test]
async fn daemon_comes_up_with_lock_and_control_api() -> anyhow::Result<()> {
    let daemon = RelayProcess::start(&[])?;
    let control = daemon.wait_for_control(Duration::from_secs(10))?;

    assert!(daemon.data_dir().join("daemon.lock").exists());

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", control.port);

    // Control API requires the bearer token.
    let resp = client.get(format!("{base}/health")).send().await?;
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{base}/health"))
        .bearer_auth(&control.token)
        .send()
        .await?;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["status"], "ok");

    // No adapters are configured, so listing works but creating errors.
    let resp = client
        .get(format!("{base}/sessions"))
        .bearer_auth(&control.token)
        .send()
        .await?;
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base}/sessions"))
        .bearer_auth(&control.token)
        .json(&serde_json::json!({"cwd": "/tmp"}))
        .send()
        .await?;
    assert_eq!(resp.status(), 404);
    Ok(())
}

#[tokio::test]
async fn consumer_ws_polices_session_ids() -> anyhow::Result<()> {
    let daemon = RelayProcess::start(&[])?;
    let _control = daemon.wait_for_control(Duration::from_secs(10))?;
    let port = daemon.port();

    // Malformed session id: policy violation.
    let (mut ws, _) = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{port}/ws/consumer/not-a-uuid"
    ))
    .await?;
    assert_eq!(close_code(&mut ws).await, Some(1008));

    // Well-formed but unknown session id.
    let (mut ws, _) = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{port}/ws/consumer/5b1f3a64-29aa-4de2-9b0e-222222222222"
    ))
    .await?;
    assert_eq!(close_code(&mut ws).await, Some(4404));
    Ok(())
}

#[tokio::test]
async fn second_daemon_in_same_dir_is_refused() -> anyhow::Result<()> {
    let daemon = RelayProcess::start(&[])?;
    let _control = daemon.wait_for_control(Duration::from_secs(10))?;

    let mut second = RelayProcess::start_in(daemon.data_dir())?;
    let status = tokio::task::spawn_blocking(move || second.wait()).await??;
    assert!(!status.success(), "second daemon must refuse to start");
    Ok(())
}
