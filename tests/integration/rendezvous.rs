//! Buildlets dialing back through `/reverse`.

use std::time::Duration;

use hyper::StatusCode;
use tokio_util::sync::CancellationToken;

use gomote_api::ConnectionSecurity;
use gomote_services::RendezvousError;

use crate::*;

/// A registered machine dials back with valid credentials; the waiter gets a
/// working buildlet client and the registration is gone.
#[tokio::test]
async fn reverse_connection_reaches_waiter() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    broker
        .rendezvous
        .register_instance("sess-1", Duration::from_secs(5))
        .await;

    let rendezvous = broker.rendezvous.clone();
    let waiter = tokio::spawn(async move {
        rendezvous
            .wait_for_instance(&CancellationToken::new(), "sess-1")
            .await
    });

    let (status, upgraded) =
        dial_reverse(broker.addr, &reverse_headers("sess-1", "good-token")).await;
    assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
    serve_buildlet(upgraded.unwrap());

    let bc = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should finish within the wait")
        .unwrap()
        .unwrap();
    assert_eq!(bc.instance_name(), "sess-1");
    assert_eq!(bc.work_dir().await.unwrap(), "/workdir");
    assert!(!broker.rendezvous.is_registered("sess-1").await);
}

/// A bad token is refused with 412, the waiter gives up at its own deadline,
/// and the registration does not outlive it.
#[tokio::test]
async fn invalid_token_is_refused_and_waiter_times_out() {
    let broker = Broker::start(ConnectionSecurity::Tls, false).await;
    broker
        .rendezvous
        .register_instance("sess-1", Duration::from_secs(5))
        .await;

    let rendezvous = broker.rendezvous.clone();
    let waiter = tokio::spawn(async move {
        let ctx = CancellationToken::new();
        let deadline = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            deadline.cancel();
        });
        rendezvous.wait_for_instance(&ctx, "sess-1").await
    });

    let (status, _) = dial_reverse(broker.addr, &reverse_headers("sess-1", "bad-token")).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);

    let res = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(RendezvousError::Cancelled(_))));
    assert!(!broker.rendezvous.is_registered("sess-1").await);

    let (status, _) = dial_reverse(broker.addr, &reverse_headers("sess-1", "good-token")).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn unregistered_instance_is_refused() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let (status, upgraded) =
        dial_reverse(broker.addr, &reverse_headers("nobody", "good-token")).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert!(upgraded.is_none());
}

#[tokio::test]
async fn missing_headers_are_rejected() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    broker
        .rendezvous
        .register_instance("sess-1", Duration::from_secs(5))
        .await;

    let mut headers = reverse_headers("sess-1", "good-token");
    headers.retain(|(name, _)| *name != HEADER_TOKEN);
    let (status, _) = dial_reverse(broker.addr, &headers).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // the registration is still claimable
    assert!(broker.rendezvous.is_registered("sess-1").await);
}

#[tokio::test]
async fn plain_listener_refuses_reverse() {
    let broker = Broker::start(ConnectionSecurity::Plain, true).await;
    broker
        .rendezvous
        .register_instance("sess-1", Duration::from_secs(5))
        .await;
    let (status, _) = dial_reverse(broker.addr, &reverse_headers("sess-1", "good-token")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

/// Full path: dial back, lease the machine as a session, and run a command
/// through the JSON API. Output arrives as NDJSON ending in an exit line.
#[tokio::test]
async fn exec_over_reverse_connection() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    broker
        .rendezvous
        .register_instance("sess-1", Duration::from_secs(5))
        .await;
    let rendezvous = broker.rendezvous.clone();
    let waiter = tokio::spawn(async move {
        rendezvous
            .wait_for_instance(&CancellationToken::new(), "sess-1")
            .await
    });
    let (_, upgraded) = dial_reverse(broker.addr, &reverse_headers("sess-1", "good-token")).await;
    serve_buildlet(upgraded.unwrap());
    let bc = waiter.await.unwrap().unwrap();

    let id = broker
        .pool
        .add_session(&alice().id, "alice", "linux-amd64", "host-linux-amd64", None, bc)
        .await;

    let resp = broker
        .api(
            reqwest::Method::POST,
            &format!("/api/instances/{id}/exec"),
            &alice(),
        )
        .json(&serde_json::json!({ "command": "go", "args": ["version"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body = resp.text().await.unwrap();
    let lines: Vec<serde_json::Value> = body
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2, "unexpected stream: {body}");
    let output = String::from_utf8(output_bytes(&lines[..1])).unwrap();
    assert!(output.starts_with("ran cmd=go"), "output: {output}");
    assert!(output.contains("cmdArg=version"), "output: {output}");
    assert_eq!(lines[1], serde_json::json!({ "exit": 0 }));
}
