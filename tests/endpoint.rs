//! Integration tests for endpoint calls and bound handlers.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use bytes::Bytes;
use brokerlink::error::ProtocolError;
use brokerlink::extension::endpoint::packets::*;
use brokerlink::extension::EndpointType;
use brokerlink::network::StatusKind;
use brokerlink::protocol::packets::{DisconnectType, READY};
use brokerlink::Identifier;
use common::*;

static ECHO: LazyLock<EndpointType<String, String>> = LazyLock::new(|| {
    EndpointType::json(Identifier::from_static("com.other", &["service", "echo"]))
});

static SUM: LazyLock<EndpointType<Vec<i64>, i64>> = LazyLock::new(|| {
    EndpointType::json(Identifier::from_static("com.example", &["app", "sum"])).with_permission(
        Identifier::from_static("com.example", &["app", "sum_permission"]),
    )
});

fn caller() -> Identifier {
    Identifier::from_static("com.other", &["service"])
}

fn invoked(key: u64, payload: &'static [u8]) -> EndpointInvokedPacket {
    EndpointInvokedPacket {
        id: SUM.id().clone(),
        caller: caller(),
        key,
        payload: Bytes::from_static(payload),
    }
}

#[tokio::test]
async fn test_call_waits_for_ready_and_resolves() {
    let mut h = harness();
    let endpoints = h.client.endpoints.clone();
    let call = tokio::spawn(async move { endpoints.call(&ECHO, &"hello".to_string()).await });

    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;

    let invoke = server.expect(&INVOKE).await;
    assert_eq!(invoke.id, *ECHO.id());
    assert_eq!(invoke.payload.as_ref(), br#""hello""#);
    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(invoke.id.clone(), invoke.key, Bytes::from_static(br#""HELLO""#)),
        )
        .await;

    assert_eq!(call.await.unwrap().unwrap(), "HELLO");
    assert_eq!(h.network().metrics().snapshot().calls_total, 1);

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_error_response_fails_call() {
    let mut h = harness();
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;
    wait_ready(h.network()).await;

    let endpoints = h.client.endpoints.clone();
    let call = tokio::spawn(async move { endpoints.call(&ECHO, &"x".to_string()).await });
    let invoke = server.expect(&INVOKE).await;
    server
        .send(&RESPONSE, &EndpointResponsePacket::err(invoke.id.clone(), invoke.key, "boom"))
        .await;

    match call.await.unwrap() {
        Err(ProtocolError::EndpointError(message)) => assert_eq!(message, "boom"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.network().metrics().snapshot().calls_failed, 1);

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_bound_endpoint_is_advertised_and_served() {
    let mut h = harness();
    let callers = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&callers);
    h.client
        .endpoints
        .bind(&SUM, move |values: Vec<i64>, invocation| {
            seen.lock().unwrap().push(invocation.caller);
            async move { Ok(values.iter().sum::<i64>()) }
        })
        .unwrap();

    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.open(&common::ServerSession::meta()).await;

    let before = server.until_ready().await;
    let register = before[0].downcast(&REGISTER).expect("register packet");
    assert_eq!(
        register.endpoints,
        [(SUM.id().clone(), SUM.permission().cloned())]
    );
    server.send(&READY, &()).await;
    wait_ready(h.network()).await;

    server.send(&INVOKED, &invoked(41, b"[1,2,3]")).await;
    let response = server.expect(&RESPONSE).await;
    assert_eq!(response.key, 41);
    assert_eq!(response.error, None);
    assert_eq!(response.payload.as_ref(), b"6");
    assert_eq!(*callers.lock().unwrap(), [caller()]);

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_handler_failures_become_error_responses() {
    let mut h = harness();
    h.client
        .endpoints
        .bind(&SUM, |values: Vec<i64>, _| async move {
            match values.len() {
                0 => Err(ProtocolError::EndpointError("empty input".into())),
                1 => panic!("handler bug"),
                _ => Ok(values.iter().sum::<i64>()),
            }
        })
        .unwrap();

    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;

    server.send(&INVOKED, &invoked(1, b"[]")).await;
    let response = server.expect(&RESPONSE).await;
    assert_eq!(response.error.as_deref(), Some("empty input"));

    server.send(&INVOKED, &invoked(2, b"[7]")).await;
    let response = server.expect(&RESPONSE).await;
    assert_eq!(response.key, 2);
    assert!(response.error.is_some());

    server.send(&INVOKED, &invoked(3, b"not json")).await;
    let response = server.expect(&RESPONSE).await;
    assert!(response.error.is_some());

    // the session survives all three
    server.send(&INVOKED, &invoked(4, b"[2,2]")).await;
    let response = server.expect(&RESPONSE).await;
    assert_eq!(response.payload.as_ref(), b"4");

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_invocation_of_unbound_endpoint_is_fault() {
    let mut h = harness();
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;

    server.send(&INVOKED, &invoked(9, b"[1]")).await;
    match run.await.unwrap() {
        Err(ProtocolError::UnknownEndpoint(id)) => assert_eq!(id, SUM.id().key()),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_bind_rules() {
    let mut h = harness();
    h.client
        .endpoints
        .bind(&SUM, |values: Vec<i64>, _| async move { Ok(values.len() as i64) })
        .unwrap();
    assert!(matches!(
        h.client
            .endpoints
            .bind(&SUM, |_: Vec<i64>, _| async move { Ok(0) }),
        Err(ProtocolError::DuplicateRegistration(_))
    ));
    assert!(h.client.endpoints.is_bound(SUM.id()));

    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;

    assert!(matches!(
        h.client
            .endpoints
            .bind(&ECHO, |value: String, _| async move { Ok(value) }),
        Err(ProtocolError::InvalidState(_))
    ));

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_disconnect_rejects_pending_calls() {
    let mut h = harness();
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;
    wait_ready(h.network()).await;

    let endpoints = h.client.endpoints.clone();
    let call = tokio::spawn(async move { endpoints.call(&ECHO, &"x".to_string()).await });
    server.expect(&INVOKE).await;
    server.disconnect(brokerlink::protocol::packets::DisconnectType::Close).await;

    assert!(matches!(
        call.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_startup_task_call_resolves_before_ready() {
    let mut h = harness();
    let endpoints = h.client.endpoints.clone();
    let answers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&answers);
    h.network()
        .add_task(move || {
            let endpoints = endpoints.clone();
            let sink = Arc::clone(&sink);
            async move {
                let answer = endpoints.call(&ECHO, &"setup".to_string()).await?;
                sink.lock().unwrap().push(answer);
                Ok(())
            }
        })
        .unwrap();

    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.open(&common::ServerSession::meta()).await;

    server.expect(&REGISTER).await;
    let invoke = server.expect(&INVOKE).await;
    assert!(!h.network().is_ready());
    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(invoke.id.clone(), invoke.key, Bytes::from_static(br#""done""#)),
        )
        .await;

    assert!(server.until_ready().await.is_empty());
    assert_eq!(*answers.lock().unwrap(), ["done"]);

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_unknown_and_abandoned_responses_are_ignored() {
    let mut h = harness();
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;
    wait_ready(h.network()).await;

    let endpoints = h.client.endpoints.clone();
    let abandoned = tokio::spawn(async move { endpoints.call(&ECHO, &"late".to_string()).await });
    let invoke = server.expect(&INVOKE).await;
    abandoned.abort();
    let _ = abandoned.await;

    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(invoke.id.clone(), invoke.key, Bytes::from_static(b"\"x\"")),
        )
        .await;
    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(ECHO.id().clone(), u64::MAX, Bytes::new()),
        )
        .await;

    // a later call still completes on the same session
    let endpoints = h.client.endpoints.clone();
    let call = tokio::spawn(async move { endpoints.call(&ECHO, &"again".to_string()).await });
    let invoke = server.expect(&INVOKE).await;
    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(invoke.id.clone(), invoke.key, Bytes::from_static(br#""ok""#)),
        )
        .await;
    assert_eq!(call.await.unwrap().unwrap(), "ok");
    assert!(h.network().is_ready());

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_concurrent_calls_resolve_by_key() {
    let mut h = harness();
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;
    wait_ready(h.network()).await;

    let endpoints = h.client.endpoints.clone();
    let first = tokio::spawn(async move { endpoints.call(&ECHO, &"one".to_string()).await });
    let one = server.expect(&INVOKE).await;
    let endpoints = h.client.endpoints.clone();
    let second = tokio::spawn(async move { endpoints.call(&ECHO, &"two".to_string()).await });
    let two = server.expect(&INVOKE).await;
    assert_ne!(one.key, two.key);

    // answer in reverse order
    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(two.id.clone(), two.key, Bytes::from_static(br#""TWO""#)),
        )
        .await;
    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(one.id.clone(), one.key, Bytes::from_static(br#""ONE""#)),
        )
        .await;

    assert_eq!(first.await.unwrap().unwrap(), "ONE");
    assert_eq!(second.await.unwrap().unwrap(), "TWO");

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_unregistered_packet_rejects_pending_calls() {
    let mut h = harness();
    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;
    wait_ready(h.network()).await;

    let endpoints = h.client.endpoints.clone();
    let call = tokio::spawn(async move { endpoints.call(&ECHO, &"x".to_string()).await });
    server.expect(&INVOKE).await;
    server
        .send_envelope(brokerlink::core::packet::Envelope::new(
            "com.example:unknown",
            &b"{}"[..],
        ))
        .await;

    assert!(matches!(
        run.await.unwrap(),
        Err(ProtocolError::InvalidPacket(_))
    ));
    assert!(matches!(
        call.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_resolves_after_ready_listeners() {
    let mut h = harness();
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);
    h.network().on_ready(move |_| {
        let sink = Arc::clone(&sink);
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            sink.lock().unwrap().push("on_ready");
            Ok(())
        }
    });

    let endpoints = h.client.endpoints.clone();
    let sink = Arc::clone(&order);
    let call = tokio::spawn(async move {
        let result = endpoints.call(&ECHO, &"hello".to_string()).await;
        sink.lock().unwrap().push("call_resolved");
        result
    });

    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;

    let invoke = server.expect(&INVOKE).await;
    assert_eq!(*order.lock().unwrap(), ["on_ready"]);
    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(invoke.id.clone(), invoke.key, Bytes::from_static(br#""HELLO""#)),
        )
        .await;

    assert_eq!(call.await.unwrap().unwrap(), "HELLO");
    assert_eq!(*order.lock().unwrap(), ["on_ready", "call_resolved"]);

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_ready_listener_may_call_endpoints() {
    let mut h = harness();
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    let endpoints = h.client.endpoints.clone();
    h.network().on_ready(move |_| {
        let sink = Arc::clone(&sink);
        let endpoints = endpoints.clone();
        async move {
            let reply = endpoints.call(&ECHO, &"ready".to_string()).await?;
            sink.lock().unwrap().push(reply);
            Ok(())
        }
    });

    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;

    let invoke = server.expect(&INVOKE).await;
    assert_eq!(invoke.payload.as_ref(), br#""ready""#);
    server
        .send(
            &RESPONSE,
            &EndpointResponsePacket::ok(invoke.id.clone(), invoke.key, Bytes::from_static(br#""READY""#)),
        )
        .await;

    // the gate opens only once the listener got its reply
    wait_ready(h.network()).await;
    assert_eq!(*replies.lock().unwrap(), ["READY"]);

    h.client.close().await;
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_unfinished_ready_listener_is_cancelled_on_disconnect() {
    let mut h = harness();
    let finished = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&finished);
    let endpoints = h.client.endpoints.clone();
    h.network().on_ready(move |_| {
        let flag = Arc::clone(&flag);
        let endpoints = endpoints.clone();
        async move {
            let _ = endpoints.call(&ECHO, &"never answered".to_string()).await;
            *flag.lock().unwrap() = true;
            Ok(())
        }
    });
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    h.network()
        .events()
        .status
        .listen_sync(move |status: brokerlink::NetworkStatus| {
            sink.lock().unwrap().push(status.kind());
        });

    let client = h.client.clone();
    let run = tokio::spawn(async move { client.run().await });
    let server = h.accept().await;
    server.handshake().await;
    server.expect(&INVOKE).await;

    server.disconnect(DisconnectType::Close).await;
    assert!(run.await.unwrap().is_ok());
    assert!(!*finished.lock().unwrap());
    assert!(h.network().status().is_disconnected());
    let kinds = kinds.lock().unwrap();
    assert_eq!(kinds[kinds.len() - 2..], [StatusKind::Ready, StatusKind::Disconnected]);
}
