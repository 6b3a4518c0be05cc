//! gomote-ctl: Command-line interface for the gomote broker.

mod cmd;

use anyhow::{Context, Result};

use cmd::http::Api;
use cmd::{instances, ssh};

const DEFAULT_ADDR: &str = "http://127.0.0.1:8443";

fn print_usage() {
    println!("Usage: gomote-ctl [--addr <url>] [--email <email>] [--user-id <id>] <command>");
    println!();
    println!("Commands:");
    println!("  create <builder-type>          Create a gomote and print its name");
    println!("  list                           List your gomotes");
    println!("  ping <id>                      Keep a gomote alive");
    println!("  destroy <id>                   Destroy a gomote");
    println!("  run <id> <cmd> [args...]       Run a command on a gomote");
    println!("  ls <id> <dir>                  List a directory on a gomote");
    println!("  rm <id> <path...>              Remove files on a gomote");
    println!("  puttar <id> <url> [dir]        Extract a tar.gz from a URL onto a gomote");
    println!("  ssh-sign <id> <pubkey-file>    Get an SSH certificate for a gomote");
    println!("  keygen <path>                  Write a new SSH keypair");
    println!();
    println!("Options:");
    println!("  --addr <url>       Broker address (default: {})", DEFAULT_ADDR);
    println!("  --email <email>    Identity header for development without a proxy");
    println!("  --user-id <id>     Account ID header for development without a proxy");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse global options
    let mut addr = std::env::var("GOMOTE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let mut email = std::env::var("GOMOTE_EMAIL").ok();
    let mut user_id = std::env::var("GOMOTE_USER_ID").ok();
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" => {
                i += 1;
                addr = args.get(i).context("--addr requires a value")?.clone();
            }
            "--email" => {
                i += 1;
                email = Some(args.get(i).context("--email requires a value")?.clone());
            }
            "--user-id" => {
                i += 1;
                user_id = Some(args.get(i).context("--user-id requires a value")?.clone());
            }
            other => remaining.push(other),
        }
        i += 1;
    }
    let api = Api::new(&addr, email, user_id);
    let owned = |rest: &[&str]| rest.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    match remaining.as_slice() {
        ["create", builder_type]             => instances::cmd_create(&api, builder_type).await,
        ["list"]                             => instances::cmd_list(&api).await,
        ["ping", id]                         => instances::cmd_ping(&api, id).await,
        ["destroy", id]                      => instances::cmd_destroy(&api, id).await,
        ["run", id, command, rest @ ..]      => instances::cmd_run(&api, id, command, &owned(rest)).await,
        ["ls", id, dir]                      => instances::cmd_ls(&api, id, dir).await,
        ["rm", id, paths @ ..] if !paths.is_empty() => instances::cmd_rm(&api, id, &owned(paths)).await,
        ["puttar", id, url]                  => instances::cmd_puttar(&api, id, url, "").await,
        ["puttar", id, url, dir]             => instances::cmd_puttar(&api, id, url, dir).await,
        ["ssh-sign", id, pubkey_file]        => ssh::cmd_ssh_sign(&api, id, pubkey_file).await,
        ["keygen", path]                     => ssh::cmd_keygen(path),
        ["help"] | ["--help"] | ["-h"] | []  => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
