//! HTTP API handlers: The gomote service over JSON, plus `/reverse`.

pub mod instances;
pub mod reverse;

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use gomote_core::identity::{HEADER_EMAIL, HEADER_ID};
use gomote_core::IapIdentity;
use gomote_services::{Code, GomoteService, Rendezvous, Status};

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<GomoteService>,
    pub rendezvous: Arc<Rendezvous>,
}

/// Whether the listener a request arrived on terminates TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSecurity {
    Plain,
    Tls,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Identity asserted by the proxy. Both headers must be present.
pub fn identity_from_headers(headers: &HeaderMap) -> Option<IapIdentity> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    };
    Some(IapIdentity::new(get(HEADER_EMAIL)?, get(HEADER_ID)?))
}

pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::Aborted => StatusCode::CONFLICT,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal | Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A service status rendered as `{"code": ..., "message": ...}`.
#[derive(Debug)]
pub struct ApiError(pub Status);

impl From<Status> for ApiError {
    fn from(s: Status) -> Self {
        Self(s)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (http_status(self.0.code), Json(self.0)).into_response()
    }
}

/// Terminal line of an NDJSON stream that failed.
#[derive(Serialize)]
struct ErrorLine<'a> {
    error: &'a Status,
}

fn ndjson_line<T: Serialize>(value: &T) -> Bytes {
    let mut line = serde_json::to_vec(value).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

fn error_line(status: &Status) -> Bytes {
    ndjson_line(&ErrorLine { error: status })
}

/// Streams lines from `rx` as an NDJSON body. `guard` lives as long as the
/// body, so a client that goes away cancels the operation behind it.
fn ndjson_response(rx: mpsc::Receiver<Bytes>, guard: DropGuard) -> Response {
    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(line), (rx, guard)))
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

// Re-export handler functions for use in router setup.
pub use instances::{
    handle_authenticate, handle_create_instance, handle_destroy_instance,
    handle_execute_command, handle_instance_alive, handle_list_directory,
    handle_list_instances, handle_remove_files, handle_sign_ssh_key, handle_write_tgz,
};
pub use reverse::handle_reverse;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn identity_needs_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_EMAIL,
            HeaderValue::from_static("accounts.google.com:alice@example.com"),
        );
        assert_eq!(identity_from_headers(&headers), None);
        headers.insert(HEADER_ID, HeaderValue::from_static("alice-id"));
        assert_eq!(
            identity_from_headers(&headers),
            Some(IapIdentity::new("accounts.google.com:alice@example.com", "alice-id"))
        );
    }

    #[test]
    fn status_codes_map_to_http() {
        assert_eq!(http_status(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(http_status(Code::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(http_status(Code::FailedPrecondition), StatusCode::PRECONDITION_FAILED);
        assert_eq!(http_status(Code::Unknown), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_lines_wrap_status() {
        let line = error_line(&Status::not_found("gone"));
        assert_eq!(
            &line[..],
            b"{\"error\":{\"code\":\"not_found\",\"message\":\"gone\"}}\n"
        );
    }
}
