//! Machine-control client for a leased build machine ("buildlet").

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    /// Working directory, relative to the buildlet work dir. Empty means the
    /// directory containing the command.
    pub dir: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries added to the environment.
    pub extra_env: Vec<String>,
    /// Run the command from the system rather than the work dir.
    pub system_level: bool,
    /// Ask the buildlet to print the environment and command first.
    pub debug: bool,
    /// Replacement `PATH` entries. `$WORKDIR` is expanded remotely.
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListDirOpts {
    pub recursive: bool,
    pub digest: bool,
    /// Relative paths to skip.
    pub skip: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildletError {
    #[error("buildlet connection failed: {0}")]
    Transport(String),
    #[error("buildlet returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("buildlet connection is closed")]
    Closed,
    #[error("command output receiver went away")]
    OutputClosed,
}

/// Outcome of a remote command that ran to completion. `Err` carries the
/// remote process state, e.g. "exit status 1".
pub type RemoteResult = Result<(), String>;

#[async_trait]
pub trait BuildletClient: Send + Sync {
    /// Name the instance registered under.
    fn instance_name(&self) -> String;

    /// Network address of the machine, for logs.
    fn remote_addr(&self) -> String;

    async fn status(&self) -> Result<(), BuildletError>;

    async fn work_dir(&self) -> Result<String, BuildletError>;

    /// Runs `cmd`, streaming combined output into `output`. The outer error
    /// means the command could not be run or observed to completion.
    async fn exec(
        &self,
        cmd: &str,
        opts: ExecOpts,
        output: mpsc::Sender<Bytes>,
    ) -> Result<RemoteResult, BuildletError>;

    async fn remove_all(&self, paths: &[String]) -> Result<(), BuildletError>;

    async fn list_dir(&self, dir: &str, opts: ListDirOpts) -> Result<Vec<String>, BuildletError>;

    /// Has the buildlet fetch a tar.gz from `url` and extract it under `dir`.
    async fn put_tar_from_url(&self, url: &str, dir: &str) -> Result<(), BuildletError>;

    /// Halts the buildlet and tears down the connection.
    async fn close(&self) -> Result<(), BuildletError>;
}

// ── FakeBuildlet ──────────────────────────────────────────────────────────────

/// In-memory buildlet for tests.
///
/// `exec` echoes the command line, or sends the chunks given to
/// [`FakeBuildlet::with_output`]; a command named `false` fails remotely.
/// Files written by `put_tar_from_url` show up in `list_dir`.
pub struct FakeBuildlet {
    name: String,
    work_dir: String,
    closed: AtomicBool,
    files: Mutex<BTreeSet<String>>,
    commands: Mutex<Vec<(String, ExecOpts)>>,
    output: Option<Vec<Bytes>>,
}

impl FakeBuildlet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            work_dir: "/workdir".to_string(),
            closed: AtomicBool::new(false),
            files: Mutex::new(BTreeSet::new()),
            commands: Mutex::new(Vec::new()),
            output: None,
        }
    }

    /// Every `exec` sends exactly these chunks as output.
    pub fn with_output(mut self, chunks: Vec<Bytes>) -> Self {
        self.output = Some(chunks);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Commands executed so far, with their options.
    pub async fn commands(&self) -> Vec<(String, ExecOpts)> {
        self.commands.lock().await.clone()
    }

    fn check_open(&self) -> Result<(), BuildletError> {
        if self.is_closed() {
            return Err(BuildletError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BuildletClient for FakeBuildlet {
    fn instance_name(&self) -> String {
        self.name.clone()
    }

    fn remote_addr(&self) -> String {
        "fake".to_string()
    }

    async fn status(&self) -> Result<(), BuildletError> {
        self.check_open()
    }

    async fn work_dir(&self) -> Result<String, BuildletError> {
        self.check_open()?;
        Ok(self.work_dir.clone())
    }

    async fn exec(
        &self,
        cmd: &str,
        opts: ExecOpts,
        output: mpsc::Sender<Bytes>,
    ) -> Result<RemoteResult, BuildletError> {
        self.check_open()?;
        let mut line = cmd.to_string();
        for arg in &opts.args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        self.commands.lock().await.push((cmd.to_string(), opts));
        let chunks = match &self.output {
            Some(chunks) => chunks.clone(),
            None => vec![Bytes::from(line)],
        };
        for chunk in chunks {
            output
                .send(chunk)
                .await
                .map_err(|_| BuildletError::OutputClosed)?;
        }
        if cmd == "false" || cmd.ends_with("/false") {
            return Ok(Err("exit status 1".to_string()));
        }
        Ok(Ok(()))
    }

    async fn remove_all(&self, paths: &[String]) -> Result<(), BuildletError> {
        self.check_open()?;
        let mut files = self.files.lock().await;
        for path in paths {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            files.retain(|f| f != path && !f.starts_with(&prefix));
        }
        Ok(())
    }

    async fn list_dir(&self, dir: &str, opts: ListDirOpts) -> Result<Vec<String>, BuildletError> {
        self.check_open()?;
        let dir = dir.trim_end_matches('/');
        let prefix = if dir == "." || dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let files = self.files.lock().await;
        let entries = files
            .iter()
            .filter_map(|f| f.strip_prefix(prefix.as_str()))
            .filter(|rel| opts.recursive || !rel.contains('/'))
            .filter(|rel| !opts.skip.iter().any(|s| rel.starts_with(s.as_str())))
            .map(|rel| format!("-rw-r--r-- {rel}"))
            .collect();
        Ok(entries)
    }

    async fn put_tar_from_url(&self, url: &str, dir: &str) -> Result<(), BuildletError> {
        self.check_open()?;
        let base = url
            .rsplit('/')
            .next()
            .unwrap_or(url)
            .trim_end_matches(".tar.gz")
            .trim_end_matches(".tgz");
        let path = if dir.is_empty() {
            base.to_string()
        } else {
            format!("{}/{base}", dir.trim_end_matches('/'))
        };
        self.files.lock().await.insert(path);
        Ok(())
    }

    async fn close(&self) -> Result<(), BuildletError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
