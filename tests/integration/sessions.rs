//! Ownership and listing through the façade and the JSON API.

use std::sync::Arc;

use bytes::Bytes;
use gomote_api::ConnectionSecurity;
use gomote_services::{Code, FakeBuildlet};

use crate::*;

async fn lease(broker: &Broker, owner: &IapIdentity, user: &str) -> String {
    broker
        .pool
        .add_session(
            &owner.id,
            user,
            "linux-amd64",
            "host-linux-amd64",
            None,
            Arc::new(FakeBuildlet::new(format!("{user}-machine"))),
        )
        .await
}

/// Another user's destroy attempt fails with a permission error and leaves
/// the session in place for its owner.
#[tokio::test]
async fn foreign_destroy_is_denied() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let id = lease(&broker, &alice(), "alice").await;

    let err = broker
        .service
        .destroy_instance(Some(&bob()), &id)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);

    broker
        .service
        .instance_alive(Some(&alice()), &id)
        .await
        .unwrap();
    assert!(broker.pool.is_session(&id).await);
}

#[tokio::test]
async fn foreign_destroy_over_http_is_forbidden() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let id = lease(&broker, &alice(), "alice").await;

    let resp = broker
        .api(reqwest::Method::DELETE, &format!("/api/instances/{id}"), &bob())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "permission_denied");

    let resp = broker
        .api(reqwest::Method::DELETE, &format!("/api/instances/{id}"), &alice())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(!broker.pool.is_session(&id).await);
}

#[tokio::test]
async fn missing_identity_is_unauthenticated() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let resp = reqwest::Client::new()
        .get(broker.url("/api/instances"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}

/// Four sessions list sorted by ID; after destroying two, the other two
/// remain, still sorted.
#[tokio::test]
async fn list_stays_sorted_across_destroys() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let mut ids = Vec::new();
    for user in ["dave", "alice", "carol", "bob"] {
        ids.push(lease(&broker, &alice(), user).await);
    }

    let listed: Vec<String> = broker.pool.list().await.into_iter().map(|s| s.id).collect();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(listed, expected);

    broker.pool.destroy_session(&expected[1]).await.unwrap();
    broker.pool.destroy_session(&expected[3]).await.unwrap();

    let listed: Vec<String> = broker.pool.list().await.into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![expected[0].clone(), expected[2].clone()]);
}

/// Creating through the API streams progress and ends with the instance.
#[tokio::test]
async fn create_streams_complete_instance() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let resp = broker
        .api(reqwest::Method::POST, "/api/instances", &alice())
        .json(&serde_json::json!({ "builder_type": "linux-amd64" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body = resp.text().await.unwrap();
    let last: serde_json::Value = serde_json::from_str(body.lines().last().unwrap()).unwrap();
    assert_eq!(last["status"], "COMPLETE");
    let id = last["instance"]["gomote_id"].as_str().unwrap().to_string();
    assert_eq!(id, "alice-linux-amd64-0");

    let resp = broker
        .api(reqwest::Method::GET, "/api/instances", &alice())
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["instances"][0]["gomote_id"], id.as_str());

    let resp = broker
        .api(reqwest::Method::GET, "/api/instances", &bob())
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["instances"], serde_json::json!([]));
}

/// Output bytes pass through untouched even when a character, or plain
/// binary, is split across chunks.
#[tokio::test]
async fn exec_output_keeps_split_bytes() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let machine = FakeBuildlet::new("alice-machine").with_output(vec![
        Bytes::from_static(b"caf\xc3"),
        Bytes::from_static(b"\xa9\n"),
        Bytes::from_static(b"\xff\x00"),
    ]);
    let id = broker
        .pool
        .add_session(
            &alice().id,
            "alice",
            "linux-amd64",
            "host-linux-amd64",
            None,
            Arc::new(machine),
        )
        .await;

    let resp = broker
        .api(
            reqwest::Method::POST,
            &format!("/api/instances/{id}/exec"),
            &alice(),
        )
        .json(&serde_json::json!({ "command": "cat" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let lines: Vec<serde_json::Value> = resp
        .text()
        .await
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let output = output_bytes(&lines);
    assert_eq!(output, b"caf\xc3\xa9\n\xff\x00".to_vec());
    assert_eq!(std::str::from_utf8(&output[..6]).unwrap(), "café\n");
    assert_eq!(lines.last().unwrap(), &serde_json::json!({ "exit": 0 }));
}
