//! Certificate login against the SSH relay.

use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key::Algorithm;
use russh::keys::{Certificate, PrivateKeyWithHashAlg, PublicKey};
use russh::ChannelMsg;
use tokio::net::TcpListener;

use gomote_api::ConnectionSecurity;
use gomote_core::config::SshConfig;
use gomote_services::ssh_auth::Authenticator;
use gomote_services::FakeBuildlet;

use crate::*;

struct PermissiveClient;

impl russh::client::Handler for PermissiveClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Starts the SSH relay next to `broker`, returning its address.
async fn start_relay(broker: &Broker) -> SocketAddr {
    start_relay_with(broker, &SshConfig::default()).await
}

async fn start_relay_with(broker: &Broker, config: &SshConfig) -> SocketAddr {
    let host_key = PrivateKey::random(
        &mut russh::keys::ssh_key::rand_core::OsRng,
        Algorithm::Ed25519,
    )
    .unwrap();
    let auth = Arc::new(
        Authenticator::new(broker.pool.clone(), broker.ca.public_key().clone(), config).unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    gomoted::ssh::spawn(
        host_key,
        auth,
        broker.pool.clone(),
        listener,
        broker.shutdown.clone(),
    );
    addr
}

async fn connect(addr: SocketAddr) -> russh::client::Handle<PermissiveClient> {
    russh::client::connect(
        Arc::new(russh::client::Config::default()),
        addr,
        PermissiveClient,
    )
    .await
    .unwrap()
}

/// Runs `command` on an open connection, returning output and exit status.
async fn run(session: &russh::client::Handle<PermissiveClient>, command: &str) -> (String, Option<u32>) {
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, command).await.unwrap();

    let mut output = Vec::new();
    let mut exit_status = None;
    let collect = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("exec should finish");
    (String::from_utf8_lossy(&output).into_owned(), exit_status)
}

async fn leased_with_cert(broker: &Broker) -> (String, PrivateKey, Certificate) {
    let id = broker
        .pool
        .add_session(
            &alice().id,
            "alice",
            "linux-amd64",
            "host-linux-amd64",
            None,
            Arc::new(FakeBuildlet::new("alice-machine")),
        )
        .await;
    let (key, public) = fresh_key();
    let signed = broker
        .service
        .sign_ssh_key(Some(&alice()), &id, public.as_bytes())
        .await
        .unwrap();
    let cert = Certificate::from_openssh(std::str::from_utf8(&signed).unwrap().trim()).unwrap();
    (id, key, cert)
}

/// A certificate from SignSSHKey logs into its session and runs a command.
#[tokio::test]
async fn certificate_login_runs_exec() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let addr = start_relay(&broker).await;
    let (id, key, cert) = leased_with_cert(&broker).await;

    let mut session = connect(addr).await;
    let auth = session
        .authenticate_openssh_cert(id.clone(), Arc::new(key), cert)
        .await
        .unwrap();
    assert!(auth.success());

    let (output, exit_status) = run(&session, "go version").await;
    assert_eq!(output, "go version\n");
    assert_eq!(exit_status, Some(0));
}

/// A certificate is only good for the session it was issued for.
#[tokio::test]
async fn certificate_for_other_session_is_rejected() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let addr = start_relay(&broker).await;
    let (_, key, cert) = leased_with_cert(&broker).await;
    let other = broker
        .pool
        .add_session(
            &alice().id,
            "alice",
            "linux-amd64",
            "host-linux-amd64",
            None,
            Arc::new(FakeBuildlet::new("second-machine")),
        )
        .await;

    let mut session = connect(addr).await;
    let auth = session
        .authenticate_openssh_cert(other, Arc::new(key), cert)
        .await
        .unwrap();
    assert!(!auth.success());
}

/// Without legacy auth, a bare key is never enough.
#[tokio::test]
async fn plain_key_is_rejected() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let addr = start_relay(&broker).await;
    let (id, _, _) = leased_with_cert(&broker).await;
    let (key, _) = fresh_key();

    let mut session = connect(addr).await;
    let auth = session
        .authenticate_publickey(id, PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await
        .unwrap();
    assert!(!auth.success());
}

/// Serves every `{user}.keys` request with `keys`.
async fn serve_keys(keys: String) -> String {
    let app = axum::Router::new().route(
        "/{file}",
        axum::routing::get(move || {
            let keys = keys.clone();
            async move { keys }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// With legacy auth on, a key published for the user logs into
/// `user-<session id>` and runs commands on that session.
#[tokio::test]
async fn legacy_key_login_runs_exec() {
    let broker = Broker::start(ConnectionSecurity::Tls, true).await;
    let (key, public) = fresh_key();
    let config = SshConfig {
        legacy_auth: true,
        github_keys_url: serve_keys(format!("{public}\n")).await,
        ..SshConfig::default()
    };
    let addr = start_relay_with(&broker, &config).await;
    let id = broker
        .pool
        .add_session(
            &alice().id,
            "alice",
            "linux-amd64",
            "host-linux-amd64",
            None,
            Arc::new(FakeBuildlet::new("alice-machine")),
        )
        .await;

    let mut session = connect(addr).await;
    let auth = session
        .authenticate_publickey(
            format!("user-{id}"),
            PrivateKeyWithHashAlg::new(Arc::new(key), None),
        )
        .await
        .unwrap();
    assert!(auth.success());

    let (output, exit_status) = run(&session, "go env GOOS").await;
    assert_eq!(output, "go env GOOS\n");
    assert_eq!(exit_status, Some(0));
}
