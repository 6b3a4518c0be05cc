//! Shared HTTP request helpers for CLI commands.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use gomote_core::identity::{HEADER_EMAIL, HEADER_ID};

/// Error body returned by the broker for failed calls.
#[derive(Debug, Deserialize)]
pub struct ApiStatus {
    pub code: String,
    pub message: String,
}

/// One line of an NDJSON stream: a payload or the terminal error.
#[derive(Deserialize)]
#[serde(untagged)]
enum StreamLine<T> {
    Failed { error: ApiStatus },
    Item(T),
}

/// Broker endpoint plus the identity headers a proxy would normally add.
pub struct Api {
    base: String,
    email: Option<String>,
    user_id: Option<String>,
    client: reqwest::Client,
}

impl Api {
    pub fn new(addr: &str, email: Option<String>, user_id: Option<String>) -> Self {
        Self {
            base: format!("{}/api", addr.trim_end_matches('/')),
            email,
            user_id,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, self.url(path));
        if let Some(email) = &self.email {
            req = req.header(HEADER_EMAIL, email);
        }
        if let Some(id) = &self.user_id {
            req = req.header(HEADER_ID, id);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("failed to connect to gomoted at {}: is it running?", self.url(path)))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        match resp.json::<ApiStatus>().await {
            Ok(s) => bail!("{} ({}): {}", status, s.code, s.message),
            Err(_) => bail!("request failed: {}", status),
        }
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let req = self.request(reqwest::Method::GET, path);
        self.send(req, path)
            .await?
            .json::<R>()
            .await
            .context("failed to parse response")
    }

    pub async fn post_json<T, R>(&self, path: &str, body: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let req = self.request(reqwest::Method::POST, path).json(body);
        self.send(req, path)
            .await?
            .json::<R>()
            .await
            .context("failed to parse response")
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let req = self.request(reqwest::Method::DELETE, path);
        self.send(req, path).await?;
        Ok(())
    }

    /// POSTs `body` and calls `f` for each line of the streamed response.
    /// A terminal error line becomes an `Err`.
    pub async fn post_stream<T, R>(
        &self,
        path: &str,
        body: &T,
        mut f: impl FnMut(R) -> Result<()>,
    ) -> Result<()>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let req = self.request(reqwest::Method::POST, path).json(body);
        let mut resp = self.send(req, path).await?;
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = resp.chunk().await.context("stream interrupted")? {
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                match parse_line(&line)? {
                    StreamLine::Failed { error } => bail!("{}: {}", error.code, error.message),
                    StreamLine::Item(item) => f(item)?,
                }
            }
        }
        Ok(())
    }
}

fn parse_line<R: DeserializeOwned>(line: &[u8]) -> Result<StreamLine<R>> {
    serde_json::from_slice(line).context("malformed stream line")
}
