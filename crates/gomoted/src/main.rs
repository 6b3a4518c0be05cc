//! gomoted: Gomote build-session broker daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh::keys::ssh_key::{Algorithm, EcdsaCurve};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use gomote_core::crypto::load_or_generate_key;
use gomote_core::GomoteConfig;
use gomote_services::scheduler::{RendezvousScheduler, Scheduler};
use gomote_services::ssh_auth::Authenticator;
use gomote_services::token::{IdTokenValidator, TokenValidator};
use gomote_services::{GomoteService, GomoteServiceConfig, Rendezvous, SessionPool, SessionPoolConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = GomoteConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = GomoteConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GomoteConfig::default()
    });
    tracing::info!(
        builders = config.builders.len(),
        relay_domain = %config.ssh.relay_domain,
        "gomoted starting"
    );

    // Keys
    let ca_key = load_or_generate_key(
        &config.ssh.ca_key_path,
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        },
    )
    .context("failed to load CA key")?;
    let host_key = load_or_generate_key(&config.ssh.host_key_path, Algorithm::Ed25519)
        .context("failed to load SSH host key")?;

    // Shared state
    let pool = Arc::new(SessionPool::new(SessionPoolConfig::from(&config.session)));
    let validator: Arc<dyn TokenValidator> = Arc::new(
        IdTokenValidator::new(&config.rendezvous).context("failed to set up token validator")?,
    );
    let rendezvous = Arc::new(Rendezvous::new(config.rendezvous.sweep_interval(), validator));
    let scheduler: Arc<dyn Scheduler> = Arc::new(RendezvousScheduler::new(
        rendezvous.clone(),
        config.rendezvous.wait(),
        config.scheduler.launch_command.clone(),
    ));
    if config.scheduler.launch_command.is_empty() {
        tracing::info!("no launch command configured, buildlets are started out of band");
    }
    let authenticator = Arc::new(
        Authenticator::new(pool.clone(), ca_key.public_key().clone(), &config.ssh)
            .context("failed to set up SSH authentication")?,
    );
    let service = Arc::new(GomoteService::new(
        GomoteServiceConfig::from(&config),
        pool.clone(),
        scheduler,
        ca_key,
    ));

    // ── Shutdown ─────────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    // ── Spawn servers ────────────────────────────────────────────────────────

    let state = gomote_api::ApiState {
        service,
        rendezvous: rendezvous.clone(),
    };
    let api_addr: SocketAddr = config
        .api
        .listen_addr
        .parse()
        .with_context(|| format!("invalid api listen address {:?}", config.api.listen_addr))?;
    let api_task = match (&config.api.tls_cert_path, &config.api.tls_key_path) {
        (Some(cert), Some(key)) => {
            let (cert, key) = (cert.clone(), key.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = gomote_api::serve_tls(state, api_addr, &cert, &key, shutdown).await {
                    tracing::error!(error = %e, "API server failed");
                }
            })
        }
        _ => {
            tracing::warn!("no TLS certificate configured, buildlets cannot dial back");
            let listener = TcpListener::bind(api_addr)
                .await
                .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = gomote_api::serve(state, listener, shutdown).await {
                    tracing::error!(error = %e, "API server failed");
                }
            })
        }
    };

    let ssh_listener = TcpListener::bind(&config.ssh.listen_addr)
        .await
        .with_context(|| format!("failed to bind SSH listener on {}", config.ssh.listen_addr))?;
    let ssh_task = gomoted::ssh::spawn(
        host_key,
        authenticator,
        pool.clone(),
        ssh_listener,
        shutdown.clone(),
    );

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = shutdown.cancelled() => tracing::info!("shutting down"),
        r = api_task => tracing::error!("API task exited: {:?}", r),
        r = ssh_task => tracing::error!("SSH task exited: {:?}", r),
    }
    shutdown.cancel();

    rendezvous.close().await;
    pool.close().await;
    Ok(())
}
