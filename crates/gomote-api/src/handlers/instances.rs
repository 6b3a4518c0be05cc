//! /instances handlers: Gomote lifecycle, commands, and files.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gomote_services::gomote_service::{ExecuteCommandRequest, Instance, ListDirectoryRequest};

use super::{error_line, identity_from_headers, ndjson_line, ndjson_response, ApiError, ApiState};

#[derive(Serialize)]
pub struct Empty {}

// ── /authenticate (POST) ──────────────────────────────────────────────────────

pub async fn handle_authenticate(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Empty>, ApiError> {
    let identity = identity_from_headers(&headers);
    state.service.authenticate(identity.as_ref())?;
    Ok(Json(Empty {}))
}

// ── /instances (POST) ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateInstanceRequest {
    pub builder_type: String,
}

/// Streams `CreateInstanceResponse` lines until the instance is ready.
pub async fn handle_create_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<Response, ApiError> {
    let identity = identity_from_headers(&headers);
    state.service.authenticate(identity.as_ref())?;

    let ctx = CancellationToken::new();
    let guard = ctx.clone().drop_guard();
    let (lines_tx, lines_rx) = mpsc::channel::<Bytes>(8);
    tokio::spawn(async move {
        let (progress_tx, mut progress_rx) = mpsc::channel(8);
        let run = state.service.create_instance(
            &ctx,
            identity.as_ref(),
            &req.builder_type,
            progress_tx,
        );
        let forward = async {
            while let Some(msg) = progress_rx.recv().await {
                if lines_tx.send(ndjson_line(&msg)).await.is_err() {
                    break;
                }
            }
            // progress sends fail from here on instead of blocking
            drop(progress_rx);
        };
        let (res, ()) = tokio::join!(run, forward);
        if let Err(status) = res {
            tracing::info!(builder_type = %req.builder_type, error = %status, "create instance failed");
            let _ = lines_tx.send(error_line(&status)).await;
        }
    });
    Ok(ndjson_response(lines_rx, guard))
}

// ── /instances (GET) ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct ListInstancesResponse {
    pub instances: Vec<Instance>,
}

pub async fn handle_list_instances(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ListInstancesResponse>, ApiError> {
    let identity = identity_from_headers(&headers);
    let instances = state.service.list_instances(identity.as_ref()).await?;
    Ok(Json(ListInstancesResponse { instances }))
}

// ── /instances/{id}/alive (POST) ──────────────────────────────────────────────

pub async fn handle_instance_alive(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Empty>, ApiError> {
    let identity = identity_from_headers(&headers);
    state.service.instance_alive(identity.as_ref(), &id).await?;
    Ok(Json(Empty {}))
}

// ── /instances/{id} (DELETE) ──────────────────────────────────────────────────

pub async fn handle_destroy_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Empty>, ApiError> {
    let identity = identity_from_headers(&headers);
    state.service.destroy_instance(identity.as_ref(), &id).await?;
    tracing::info!(id = %id, "gomote destroyed via API");
    Ok(Json(Empty {}))
}

// ── /instances/{id}/exec (POST) ───────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecLine {
    /// Raw output bytes, base64 encoded. Chunks may split characters.
    Output(String),
    Exit(i32),
}

impl ExecLine {
    pub fn output(chunk: &[u8]) -> Self {
        Self::Output(STANDARD.encode(chunk))
    }
}

/// Streams `{"output": ...}` lines, then `{"exit": 0}` or an error line.
pub async fn handle_execute_command(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut req): Json<ExecuteCommandRequest>,
) -> Result<Response, ApiError> {
    let identity = identity_from_headers(&headers);
    state.service.authenticate(identity.as_ref())?;
    req.gomote_id = id;

    let ctx = CancellationToken::new();
    let guard = ctx.clone().drop_guard();
    let (lines_tx, lines_rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(16);
        let run = state
            .service
            .execute_command(&ctx, identity.as_ref(), req, output_tx);
        let forward = async {
            while let Some(chunk) = output_rx.recv().await {
                let line = ExecLine::output(&chunk);
                if lines_tx.send(ndjson_line(&line)).await.is_err() {
                    break;
                }
            }
        };
        let (res, ()) = tokio::join!(run, forward);
        let last = match res {
            Ok(()) => ndjson_line(&ExecLine::Exit(0)),
            Err(status) => error_line(&status),
        };
        let _ = lines_tx.send(last).await;
    });
    Ok(ndjson_response(lines_rx, guard))
}

// ── /instances/{id}/ls (GET) ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListDirectoryQuery {
    pub directory: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub digest: bool,
    /// Comma-separated relative paths to skip.
    #[serde(default)]
    pub skip: String,
}

#[derive(Serialize, Deserialize)]
pub struct ListDirectoryResponse {
    pub entries: Vec<String>,
}

pub async fn handle_list_directory(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<ListDirectoryQuery>,
) -> Result<Json<ListDirectoryResponse>, ApiError> {
    let identity = identity_from_headers(&headers);
    let ctx = CancellationToken::new();
    let _guard = ctx.clone().drop_guard();
    let req = ListDirectoryRequest {
        gomote_id: id,
        directory: q.directory,
        recursive: q.recursive,
        digest: q.digest,
        skip_files: q
            .skip
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    };
    let entries = state
        .service
        .list_directory(&ctx, identity.as_ref(), req)
        .await?;
    Ok(Json(ListDirectoryResponse { entries }))
}

// ── /instances/{id}/remove (POST) ─────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct RemoveFilesRequest {
    pub paths: Vec<String>,
}

pub async fn handle_remove_files(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RemoveFilesRequest>,
) -> Result<Json<Empty>, ApiError> {
    let identity = identity_from_headers(&headers);
    let ctx = CancellationToken::new();
    let _guard = ctx.clone().drop_guard();
    state
        .service
        .remove_files(&ctx, identity.as_ref(), &id, &req.paths)
        .await?;
    Ok(Json(Empty {}))
}

// ── /instances/{id}/writetgz (POST) ───────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct WriteTgzRequest {
    pub url: String,
    #[serde(default)]
    pub directory: String,
}

pub async fn handle_write_tgz(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<WriteTgzRequest>,
) -> Result<Json<Empty>, ApiError> {
    let identity = identity_from_headers(&headers);
    let ctx = CancellationToken::new();
    let _guard = ctx.clone().drop_guard();
    state
        .service
        .write_tgz_from_url(&ctx, identity.as_ref(), &id, &req.url, &req.directory)
        .await?;
    Ok(Json(Empty {}))
}

// ── /instances/{id}/ssh-key (POST) ────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct SignSshKeyRequest {
    /// `authorized_keys` line.
    pub public_key: String,
}

#[derive(Serialize, Deserialize)]
pub struct SignSshKeyResponse {
    pub signed_public_key: String,
}

pub async fn handle_sign_ssh_key(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SignSshKeyRequest>,
) -> Result<Json<SignSshKeyResponse>, ApiError> {
    let identity = identity_from_headers(&headers);
    let signed = state
        .service
        .sign_ssh_key(identity.as_ref(), &id, req.public_key.as_bytes())
        .await?;
    Ok(Json(SignSshKeyResponse {
        signed_public_key: String::from_utf8_lossy(&signed).into_owned(),
    }))
}
