//! Instance lifecycle, command execution, and file commands.

use std::io::Write;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::http::Api;

#[derive(Deserialize)]
struct Instance {
    gomote_id: String,
    builder_type: String,
    host_type: String,
    expires: i64,
    #[serde(default)]
    working_dir: String,
}

#[derive(Deserialize)]
struct CreateInstanceResponse {
    status: String,
    waiters_ahead: i64,
    #[serde(default)]
    instance: Option<Instance>,
}

#[derive(Deserialize)]
struct ListInstancesResponse {
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExecLine {
    /// Base64 of the raw output bytes.
    Output(String),
    Exit(i32),
}

#[derive(Deserialize)]
struct ListDirectoryResponse {
    entries: Vec<String>,
}

#[derive(Deserialize)]
struct Empty {}

fn instance_path(id: &str, op: &str) -> String {
    if op.is_empty() {
        format!("/instances/{id}")
    } else {
        format!("/instances/{id}/{op}")
    }
}

pub async fn cmd_create(api: &Api, builder_type: &str) -> Result<()> {
    let body = serde_json::json!({ "builder_type": builder_type });
    let mut created: Option<Instance> = None;
    api.post_stream("/instances", &body, |msg: CreateInstanceResponse| {
        match msg.instance {
            Some(inst) if msg.status == "COMPLETE" => created = Some(inst),
            _ => eprintln!("  waiting for a {builder_type} machine ({} ahead)", msg.waiters_ahead),
        }
        Ok(())
    })
    .await?;

    let Some(inst) = created else {
        bail!("stream ended before the instance was ready");
    };
    println!("{}", inst.gomote_id);
    eprintln!("  working dir: {}", inst.working_dir);
    Ok(())
}

pub async fn cmd_list(api: &Api) -> Result<()> {
    let resp: ListInstancesResponse = api.get_json("/instances").await?;

    if resp.instances.is_empty() {
        println!("No active gomotes.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Gomotes ({})", resp.instances.len());
    println!("═══════════════════════════════════════");
    for inst in &resp.instances {
        println!("  ┌─ {}", inst.gomote_id);
        println!("  │  builder : {}", inst.builder_type);
        println!("  │  host    : {}", inst.host_type);
        if inst.expires == 0 {
            println!("  └─ expires : never");
        } else {
            println!("  └─ expires : {}", inst.expires);
        }
    }
    Ok(())
}

pub async fn cmd_ping(api: &Api, id: &str) -> Result<()> {
    let _: Empty = api.post_json(&instance_path(id, "alive"), &serde_json::json!({})).await?;
    println!("{id} is alive");
    Ok(())
}

pub async fn cmd_destroy(api: &Api, id: &str) -> Result<()> {
    api.delete(&instance_path(id, "")).await?;
    println!("destroyed {id}");
    Ok(())
}

#[derive(Serialize)]
struct ExecBody<'a> {
    command: &'a str,
    args: &'a [String],
}

/// Runs a command, copying its output to stdout.
pub async fn cmd_run(api: &Api, id: &str, command: &str, args: &[String]) -> Result<()> {
    let body = ExecBody { command, args };
    let mut exit = None;
    api.post_stream(&instance_path(id, "exec"), &body, |line: ExecLine| {
        match line {
            ExecLine::Output(s) => {
                let chunk = STANDARD.decode(s).context("invalid output encoding")?;
                let mut out = std::io::stdout().lock();
                out.write_all(&chunk)?;
                out.flush()?;
            }
            ExecLine::Exit(code) => exit = Some(code),
        }
        Ok(())
    })
    .await?;

    match exit {
        Some(0) => Ok(()),
        Some(code) => bail!("command exited with status {code}"),
        None => bail!("stream ended without an exit status"),
    }
}

pub async fn cmd_ls(api: &Api, id: &str, dir: &str) -> Result<()> {
    let dir: String = url::form_urlencoded::byte_serialize(dir.as_bytes()).collect();
    let path = format!("{}?directory={}", instance_path(id, "ls"), dir);
    let resp: ListDirectoryResponse = api.get_json(&path).await?;
    for entry in resp.entries {
        println!("{entry}");
    }
    Ok(())
}

pub async fn cmd_rm(api: &Api, id: &str, paths: &[String]) -> Result<()> {
    let body = serde_json::json!({ "paths": paths });
    let _: Empty = api.post_json(&instance_path(id, "remove"), &body).await?;
    Ok(())
}

pub async fn cmd_puttar(api: &Api, id: &str, url: &str, dir: &str) -> Result<()> {
    let body = serde_json::json!({ "url": url, "directory": dir });
    let _: Empty = api.post_json(&instance_path(id, "writetgz"), &body).await?;
    println!("extracted {url} into {}", if dir.is_empty() { "." } else { dir });
    Ok(())
}
