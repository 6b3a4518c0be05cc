//! gomote-api: HTTP surface of the broker.

pub mod handlers;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub use handlers::{ApiState, ConnectionSecurity};

/// Builds the router. `security` tells `/reverse` whether the listener
/// terminates TLS.
pub fn app(state: ApiState, security: ConnectionSecurity) -> Router {
    let api_routes = Router::new()
        .route("/authenticate", post(handlers::handle_authenticate))
        .route(
            "/instances",
            get(handlers::handle_list_instances).post(handlers::handle_create_instance),
        )
        .route("/instances/{id}", delete(handlers::handle_destroy_instance))
        .route("/instances/{id}/alive", post(handlers::handle_instance_alive))
        .route("/instances/{id}/exec", post(handlers::handle_execute_command))
        .route("/instances/{id}/ls", get(handlers::handle_list_directory))
        .route("/instances/{id}/remove", post(handlers::handle_remove_files))
        .route("/instances/{id}/writetgz", post(handlers::handle_write_tgz))
        .route("/instances/{id}/ssh-key", post(handlers::handle_sign_ssh_key))
        .with_state(state.clone());

    let reverse = Router::new()
        .route(
            "/reverse",
            get(handlers::handle_reverse).post(handlers::handle_reverse),
        )
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .merge(reverse)
        .layer(Extension(security))
        .layer(TraceLayer::new_for_http())
}

/// Serves plain HTTP until `shutdown` fires. `/reverse` refuses every
/// request on this listener.
pub async fn serve(
    state: ApiState,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "API listening (plain HTTP)");
    let app = app(state, ConnectionSecurity::Plain);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

/// Serves HTTPS with the given PEM certificate and key until `shutdown` fires.
pub async fn serve_tls(
    state: ApiState,
    addr: SocketAddr,
    cert_path: &Path,
    key_path: &Path,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    tracing::info!(%addr, "API listening (TLS)");
    let app = app(state, ConnectionSecurity::Tls);
    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}
