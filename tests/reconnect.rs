//! Reconnect backoff, attempt accounting and cancellation, on paused time.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use brokerlink::error::ProtocolError;
use brokerlink::network::{NetworkStatus, StatusKind};
use brokerlink::protocol::packets::DisconnectType;
use common::*;
use tokio::time::Instant;

fn record_delays(h: &Harness) -> Arc<Mutex<Vec<(u32, Duration)>>> {
    let delays = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delays);
    h.network().on_status(move |status| {
        if let NetworkStatus::Reconnecting { attempt, delay, .. } = status {
            sink.lock().unwrap().push((attempt, delay));
        }
        async { Ok(()) }
    });
    delays
}

/// Open a session and end it with a retryable disconnect before ready.
async fn fail_before_ready(server: &ServerSession) {
    server.open(&ServerSession::meta()).await;
    server.disconnect(DisconnectType::ServerRestart).await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_and_resets_after_ready() {
    let mut h = harness();
    let delays = record_delays(&h);
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });

    let server = h.accept().await;
    server.handshake().await;
    wait_ready(h.network()).await;

    // =================== First retry: 2s ===================
    server.disconnect(DisconnectType::ServerRestart).await;
    let dropped = Instant::now();
    let server = h.accept().await;
    assert!(dropped.elapsed() >= Duration::from_secs(2));

    // =================== Second retry: 4s ===================
    fail_before_ready(&server).await;
    let dropped = Instant::now();
    let server = h.accept().await;
    assert!(dropped.elapsed() >= Duration::from_secs(4));

    // =================== Ready resets the count ===================
    server.handshake().await;
    wait_ready(h.network()).await;
    server.disconnect(DisconnectType::InternalError).await;
    let dropped = Instant::now();
    let server = h.accept().await;
    let waited = dropped.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(4));

    assert_eq!(
        *delays.lock().unwrap(),
        [
            (0, Duration::from_secs(2)),
            (1, Duration::from_secs(4)),
            (0, Duration::from_secs(2)),
        ]
    );
    let snapshot = h.network().metrics().snapshot();
    assert_eq!(snapshot.reconnect_attempts, 3);

    server.handshake().await;
    wait_ready(h.network()).await;
    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pending_reconnect() {
    let mut h = harness();
    let mut status = h.network().subscribe_status();
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });

    let server = h.accept().await;
    fail_before_ready(&server).await;

    let handle = {
        let current = status
            .wait_for(|status| status.kind() == StatusKind::Reconnecting)
            .await
            .unwrap();
        match &*current {
            NetworkStatus::Reconnecting { handle, .. } => handle.clone(),
            other => panic!("unexpected {other:?}"),
        }
    };
    handle.cancel();

    assert!(run.await.unwrap().is_ok());
    assert!(matches!(
        h.network().status(),
        NetworkStatus::Disconnected { attempt: Some(0), .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_while_waiting_to_reconnect() {
    let mut h = harness();
    let mut status = h.network().subscribe_status();
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });

    let server = h.accept().await;
    fail_before_ready(&server).await;
    status
        .wait_for(|status| status.kind() == StatusKind::Reconnecting)
        .await
        .unwrap();

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
    assert!(h.network().status().is_disconnected());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_limit() {
    let mut config = test_config();
    config.client.max_reconnect_attempts = 2;
    let mut h = harness_with(app(), config);
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });

    for _ in 0..3 {
        let server = h.accept().await;
        fail_before_ready(&server).await;
    }

    match run.await.unwrap() {
        Err(ProtocolError::ReconnectLimit(attempts)) => assert_eq!(attempts, 2),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_without_reconnect_error_is_returned() {
    let mut h = harness();
    let delays = record_delays(&h);
    let network = h.network().clone();
    let run = tokio::spawn(async move { network.connect(false).await });

    let server = h.accept().await;
    server.handshake().await;
    wait_ready(h.network()).await;
    server.disconnect(DisconnectType::ServerRestart).await;

    assert!(matches!(
        run.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(delays.lock().unwrap().is_empty());
    assert!(h.network().status().is_disconnected());
}

#[tokio::test(start_paused = true)]
async fn test_dial_failure_is_retried() {
    let mut config = test_config();
    config.client.max_reconnect_attempts = 1;
    let h = harness_with(app(), config);
    let delays = record_delays(&h);
    drop(h.listener);

    let started = Instant::now();
    match h.client.run().await {
        Err(ProtocolError::ReconnectLimit(attempts)) => assert_eq!(attempts, 1),
        other => panic!("unexpected {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(*delays.lock().unwrap(), [(0, Duration::from_secs(2))]);
}
