//! /reverse: Buildlets dialing back to the broker.
//!
//! The request is checked against the rendezvous, answered with
//! `101 Switching Protocols`, and the upgraded socket becomes the transport
//! for a buildlet client that is handed to whoever is waiting for it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

use gomote_services::rendezvous::{HEADER_HOSTNAME, HEADER_ID, HEADER_TOKEN};
use gomote_services::reverse::ReverseBuildlet;
use gomote_services::{BuildletClient, RendezvousError, ReverseRequest};

use super::{ApiState, ConnectionSecurity};

pub async fn handle_reverse(
    State(state): State<ApiState>,
    Extension(security): Extension<ConnectionSecurity>,
    mut req: Request,
) -> Response {
    let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.to_string())
        .unwrap_or_default();

    let headers = req.headers();
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let reverse = ReverseRequest {
        tls: security == ConnectionSecurity::Tls,
        id: get(HEADER_ID),
        token: get(HEADER_TOKEN),
        hostname: get(HEADER_HOSTNAME),
    };
    let slot = match state.rendezvous.accept_reverse(&reverse).await {
        Ok(slot) => slot,
        Err(rejection) => {
            tracing::warn!(
                remote_addr = %remote_addr,
                id = reverse.id.unwrap_or_default(),
                reason = %rejection,
                "rejected reverse connection"
            );
            let status = StatusCode::from_u16(rejection.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, rejection.to_string()).into_response();
        }
    };

    let Some(on_upgrade) = on_upgrade else {
        // the slot is dropped here, which fails the waiter
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "connection cannot be upgraded",
        )
            .into_response();
    };

    tokio::spawn(async move {
        let outcome = match on_upgrade.await {
            Ok(upgraded) => ReverseBuildlet::connect(
                TokioIo::new(upgraded),
                slot.id(),
                slot.hostname(),
                &remote_addr,
            )
            .await
            .map(|bc| Arc::new(bc) as Arc<dyn BuildletClient>)
            .map_err(|e| RendezvousError::Connection(e.to_string())),
            Err(e) => Err(RendezvousError::Connection(e.to_string())),
        };
        slot.deliver(outcome);
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "revdial")
        .header(header::CONNECTION, "Upgrade")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
