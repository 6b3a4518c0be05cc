//! Buildlet client spoken over a reverse connection.
//!
//! Once a machine's `/reverse` request has been upgraded, the broker takes
//! the client side of an HTTP/1.1 connection running over that socket and
//! drives the buildlet's control API through it.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{CONTENT_TYPE, HOST, TE};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use url::form_urlencoded;

use crate::buildlet::{BuildletClient, BuildletError, ExecOpts, ListDirOpts, RemoteResult};

const FORM: &str = "application/x-www-form-urlencoded";
const STATUS_TIMEOUT: Duration = Duration::from_secs(20);
/// How long `close` waits for `/halt`, including behind a running command.
const HALT_TIMEOUT: Duration = Duration::from_secs(5);
const PROCESS_STATE_TRAILER: &str = "process-state";

pub struct ReverseBuildlet {
    name: String,
    hostname: String,
    remote_addr: String,
    sender: Mutex<SendRequest<Full<Bytes>>>,
    conn: AbortHandle,
}

impl ReverseBuildlet {
    /// Runs the HTTP handshake over `io` and checks that the buildlet
    /// answers `/status` before handing the client out.
    pub async fn connect<IO>(
        io: IO,
        name: &str,
        hostname: &str,
        remote_addr: &str,
    ) -> Result<Self, BuildletError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(transport)?;
        let instance = name.to_string();
        let conn = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(instance = %instance, error = %e, "reverse connection ended");
            }
        })
        .abort_handle();

        let bc = Self {
            name: name.to_string(),
            hostname: hostname.to_string(),
            remote_addr: remote_addr.to_string(),
            sender: Mutex::new(sender),
            conn,
        };
        tokio::time::timeout(STATUS_TIMEOUT, bc.status())
            .await
            .map_err(|_| BuildletError::Transport("timed out waiting for /status".into()))??;
        Ok(bc)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Sends one request and hands back the response once its status is OK.
    /// The connection stays locked until the body has been consumed by `f`.
    async fn round_trip<T, F, Fut>(
        &self,
        method: Method,
        uri: &str,
        form: Option<String>,
        f: F,
    ) -> Result<T, BuildletError>
    where
        F: FnOnce(Response<Incoming>) -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, BuildletError>> + Send,
    {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "buildlet")
            .header(TE, "trailers");
        if form.is_some() {
            builder = builder.header(CONTENT_TYPE, FORM);
        }
        let req = builder
            .body(Full::new(Bytes::from(form.unwrap_or_default())))
            .map_err(|e| BuildletError::Transport(e.to_string()))?;

        let mut sender = self.sender.lock().await;
        if sender.is_closed() {
            return Err(BuildletError::Closed);
        }
        sender.ready().await.map_err(transport)?;
        let resp = sender.send_request(req).await.map_err(transport)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = read_body(resp).await.unwrap_or_default();
            return Err(BuildletError::Http {
                status,
                body: body.trim().to_string(),
            });
        }
        f(resp).await
    }
}

fn transport(e: hyper::Error) -> BuildletError {
    BuildletError::Transport(e.to_string())
}

async fn read_body(resp: Response<Incoming>) -> Result<String, BuildletError> {
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(transport)?
        .to_bytes();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn discard_body(resp: Response<Incoming>) -> Result<(), BuildletError> {
    resp.into_body().collect().await.map_err(transport)?;
    Ok(())
}

fn exec_form(cmd: &str, opts: &ExecOpts) -> String {
    let mut form = form_urlencoded::Serializer::new(String::new());
    form.append_pair("cmd", cmd);
    if opts.system_level {
        form.append_pair("mode", "sys");
    }
    if !opts.dir.is_empty() {
        form.append_pair("dir", &opts.dir);
    }
    for arg in &opts.args {
        form.append_pair("cmdArg", arg);
    }
    for env in &opts.extra_env {
        form.append_pair("env", env);
    }
    for p in &opts.path {
        form.append_pair("path", p);
    }
    if opts.debug {
        form.append_pair("debug", "true");
    }
    form.finish()
}

#[async_trait]
impl BuildletClient for ReverseBuildlet {
    fn instance_name(&self) -> String {
        self.name.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    async fn status(&self) -> Result<(), BuildletError> {
        self.round_trip(Method::GET, "/status", None, discard_body)
            .await
    }

    async fn work_dir(&self) -> Result<String, BuildletError> {
        self.round_trip(Method::GET, "/workdir", None, read_body)
            .await
            .map(|s| s.trim().to_string())
    }

    async fn exec(
        &self,
        cmd: &str,
        opts: ExecOpts,
        output: mpsc::Sender<Bytes>,
    ) -> Result<RemoteResult, BuildletError> {
        let form = exec_form(cmd, &opts);
        self.round_trip(Method::POST, "/exec", Some(form), |resp| async move {
            let mut body = resp.into_body();
            let mut state: Option<String> = None;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(transport)?;
                match frame.into_data() {
                    Ok(data) => {
                        if !data.is_empty() && output.send(data).await.is_err() {
                            return Err(BuildletError::OutputClosed);
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            state = trailers
                                .get(PROCESS_STATE_TRAILER)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                        }
                    }
                }
            }
            match state.as_deref() {
                Some("ok") => Ok(Ok(())),
                Some(s) => Ok(Err(s.to_string())),
                None => Err(BuildletError::Transport(
                    "missing process state trailer".into(),
                )),
            }
        })
        .await
    }

    async fn remove_all(&self, paths: &[String]) -> Result<(), BuildletError> {
        if paths.is_empty() {
            return Ok(());
        }
        let form = {
            let mut form = form_urlencoded::Serializer::new(String::new());
            for p in paths {
                form.append_pair("path", p);
            }
            form.finish()
        };
        self.round_trip(Method::POST, "/removeall", Some(form), discard_body)
            .await
    }

    async fn list_dir(&self, dir: &str, opts: ListDirOpts) -> Result<Vec<String>, BuildletError> {
        let query = {
            let mut query = form_urlencoded::Serializer::new(String::new());
            query.append_pair("dir", dir);
            query.append_pair("recursive", if opts.recursive { "true" } else { "false" });
            query.append_pair("digest", if opts.digest { "true" } else { "false" });
            for s in &opts.skip {
                query.append_pair("skip", s);
            }
            query.finish()
        };
        let uri = format!("/ls?{query}");
        let body = self.round_trip(Method::GET, &uri, None, read_body).await?;
        Ok(body
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn put_tar_from_url(&self, url: &str, dir: &str) -> Result<(), BuildletError> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("dir", dir)
            .finish();
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("url", url)
            .finish();
        let uri = format!("/writetgz?{query}");
        self.round_trip(Method::POST, &uri, Some(form), discard_body)
            .await
    }

    /// Asks the machine to halt, then drops the connection. A command still
    /// streaming output holds the connection, so the halt is given up on
    /// after [`HALT_TIMEOUT`] and the command ends with a transport error.
    async fn close(&self) -> Result<(), BuildletError> {
        let halt = self.round_trip(Method::POST, "/halt", Some(String::new()), discard_body);
        let res = match tokio::time::timeout(HALT_TIMEOUT, halt).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(instance = %self.name, "timed out halting buildlet, dropping connection");
                Ok(())
            }
        };
        self.conn.abort();
        // the machine may drop the connection before answering
        match res {
            Ok(()) | Err(BuildletError::Transport(_)) | Err(BuildletError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
