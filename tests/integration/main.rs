//! gomote integration test harness.
//!
//! Everything runs in-process: the real router on an ephemeral port, a
//! session pool, a rendezvous, and the SSH relay. Each test builds its own
//! broker, so tests share no state.
//!
//!   cargo test --test integration

mod rendezvous;
mod sessions;
mod ssh;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, CONNECTION, HOST, UPGRADE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use russh::keys::PrivateKey;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use gomote_api::{ApiState, ConnectionSecurity};
use gomote_core::crypto::ssh_key_pair;
use gomote_core::identity::{HEADER_EMAIL, HEADER_ID};
use gomote_core::{GomoteConfig, IapIdentity};
use gomote_services::rendezvous::{HEADER_HOSTNAME, HEADER_ID as HEADER_GOMOTE_ID, HEADER_TOKEN};
use gomote_services::scheduler::FakeScheduler;
use gomote_services::token::StaticValidator;
use gomote_services::{
    GomoteService, GomoteServiceConfig, Rendezvous, SessionPool, SessionPoolConfig,
};

// ── Identities ────────────────────────────────────────────────────────────────

pub fn alice() -> IapIdentity {
    IapIdentity::new("accounts.google.com:alice@example.com", "alice-id")
}

pub fn bob() -> IapIdentity {
    IapIdentity::new("accounts.google.com:bob@example.com", "bob-id")
}

/// Fresh ECDSA key, decoded for use with russh.
pub fn fresh_key() -> (PrivateKey, String) {
    let pair = ssh_key_pair().unwrap();
    let key = russh::keys::decode_secret_key(&pair.private_pem, None).unwrap();
    (key, pair.public_authorized)
}

/// Concatenated output of NDJSON exec lines, decoded from base64.
pub fn output_bytes(lines: &[serde_json::Value]) -> Vec<u8> {
    use base64::Engine;
    lines
        .iter()
        .filter_map(|l| l["output"].as_str())
        .flat_map(|s| base64::engine::general_purpose::STANDARD.decode(s).unwrap())
        .collect()
}

// ── Broker ────────────────────────────────────────────────────────────────────

pub struct Broker {
    pub pool: Arc<SessionPool>,
    pub rendezvous: Arc<Rendezvous>,
    pub service: Arc<GomoteService>,
    pub ca: PrivateKey,
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl Broker {
    /// Starts the HTTP surface on 127.0.0.1:0. `security` is what `/reverse`
    /// believes about the listener; `token_ok` is every token's verdict.
    pub async fn start(security: ConnectionSecurity, token_ok: bool) -> Broker {
        let config = GomoteConfig::default();
        let (ca, _) = fresh_key();
        let pool = Arc::new(SessionPool::new(SessionPoolConfig::default()));
        let rendezvous = Arc::new(Rendezvous::new(
            Duration::from_millis(100),
            Arc::new(StaticValidator(token_ok)),
        ));
        let service = Arc::new(GomoteService::new(
            GomoteServiceConfig::from(&config),
            pool.clone(),
            Arc::new(FakeScheduler::new()),
            ca.clone(),
        ));
        let state = ApiState {
            service: service.clone(),
            rendezvous: rendezvous.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        match security {
            ConnectionSecurity::Plain => {
                tokio::spawn(gomote_api::serve(state, listener, shutdown.clone()));
            }
            // TLS is terminated in front of the router in production; here
            // the router is only told that it was.
            ConnectionSecurity::Tls => {
                let app = gomote_api::app(state, ConnectionSecurity::Tls);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _ = axum::serve(
                        listener,
                        app.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await;
                });
            }
        }

        Broker {
            pool,
            rendezvous,
            service,
            ca,
            addr,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// A request carrying `who`'s proxy headers.
    pub fn api(&self, method: reqwest::Method, path: &str, who: &IapIdentity) -> reqwest::RequestBuilder {
        reqwest::Client::new()
            .request(method, self.url(path))
            .header(HEADER_EMAIL, &who.email)
            .header(HEADER_ID, &who.id)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ── Reverse dialing ───────────────────────────────────────────────────────────

pub fn reverse_headers<'a>(id: &'a str, token: &'a str) -> Vec<(&'static str, &'a str)> {
    vec![
        (HEADER_GOMOTE_ID, id),
        (HEADER_TOKEN, token),
        (HEADER_HOSTNAME, "buildlet-host-1"),
    ]
}

/// Dials `/reverse` the way a buildlet does. Returns the status and, on
/// `101`, the upgraded connection.
pub async fn dial_reverse(
    addr: SocketAddr,
    headers: &[(&str, &str)],
) -> (StatusCode, Option<Upgraded>) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });

    let mut req = Request::builder()
        .method("POST")
        .uri("/reverse")
        .header(HOST, "gomote")
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "revdial");
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    let resp = sender
        .send_request(req.body(Empty::<Bytes>::new()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return (status, None);
    }
    let upgraded = hyper::upgrade::on(resp).await.unwrap();
    (status, Some(upgraded))
}

/// Serves a minimal buildlet over an upgraded reverse connection. Every
/// command prints `ran <form>` and succeeds.
pub fn serve_buildlet(io: Upgraded) {
    tokio::spawn(async move {
        let svc = service_fn(|req: Request<Incoming>| async move {
            let path = req.uri().path().to_string();
            let form = req.into_body().collect().await.unwrap().to_bytes();
            let frames: Vec<Result<Frame<Bytes>, Infallible>> = match path.as_str() {
                "/workdir" => vec![Ok(Frame::data(Bytes::from("/workdir\n")))],
                "/exec" => {
                    let mut trailers = HeaderMap::new();
                    trailers.insert("process-state", "ok".parse().unwrap());
                    vec![
                        Ok(Frame::data(Bytes::from(format!(
                            "ran {}\n",
                            String::from_utf8_lossy(&form)
                        )))),
                        Ok(Frame::trailers(trailers)),
                    ]
                }
                _ => vec![],
            };
            let body = StreamBody::new(futures::stream::iter(frames));
            let resp = Response::builder()
                .header("trailer", "process-state")
                .body(body)
                .unwrap();
            Ok::<_, Infallible>(resp)
        });
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, svc)
            .await;
    });
}
