use anyhow::Result;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

use crate::request::ErrorKind;

/// Failure of a single call, as seen from outside an adapter.
///
/// Backend-specific errors (reqwest, serde, HTTP status) are folded into one
/// of these variants before they leave the adapter layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status} server error: {message}")]
    Server { status: u16, message: String },

    #[error("HTTP {status} client error: {message}")]
    Client { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Connection(_) => ErrorKind::Connection,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Server { .. } => ErrorKind::Server,
            AdapterError::Client { .. } => ErrorKind::Client,
            AdapterError::Protocol(_) => ErrorKind::Protocol,
            AdapterError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Classify a failure to send a request or read its body.
    ///
    /// Only transport failures become `Connection`, since that kind is
    /// retried. Everything reqwest cannot attribute to the transport is a
    /// `Protocol` error.
    pub fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            return AdapterError::Timeout(timeout);
        }
        if e.is_connect() {
            return AdapterError::Connection(e.to_string());
        }
        if e.is_decode() || e.is_redirect() || e.is_builder() {
            return AdapterError::Protocol(e.to_string());
        }
        if e.is_request() || e.is_body() {
            let err_msg = format!("{:?}", e).to_lowercase();
            if err_msg.contains("connection closed")
                || err_msg.contains("connection reset")
                || err_msg.contains("broken pipe")
                || err_msg.contains("connection refused")
                || err_msg.contains("incomplete")
            {
                return AdapterError::Connection(format!("Request error: {}", e));
            }
        }
        AdapterError::Protocol(e.to_string())
    }
}

/// Build the connection pool owned by a single adapter.
///
/// No overall request timeout is set here: the per-call deadline is enforced
/// by the adapter's event stream so that a timeout always surfaces as one
/// terminal event.
pub fn build_http_client(connect_timeout: Duration, pool_size: usize) -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(pool_size) // Match concurrency for connection reuse
        .pool_idle_timeout(Duration::from_secs(300))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .build()?;
    Ok(client)
}

/// Reject anything that is not an absolute http(s) URL with a host.
pub fn validate_base_url(base_url: &str) -> Result<Url> {
    let url = Url::parse(base_url)
        .map_err(|e| anyhow::anyhow!("invalid base_url {:?}: {}", base_url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!(
            "invalid base_url {:?}: unsupported scheme {:?}",
            base_url,
            url.scheme()
        );
    }
    if url.host_str().is_none_or(str::is_empty) {
        anyhow::bail!("invalid base_url {:?}: missing host", base_url);
    }
    Ok(url)
}

/// Join a base URL and a path without doubling or dropping slashes.
pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub fn with_auth(req: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => req.header("Authorization", format!("Bearer {}", key)),
        None => req,
    }
}

/// Send a request, mapping transport failures and non-2xx statuses.
pub async fn send(req: RequestBuilder, timeout: Duration) -> Result<Response, AdapterError> {
    let response = req
        .send()
        .await
        .map_err(|e| AdapterError::from_reqwest(e, timeout))?;
    check_status(response).await
}

async fn check_status(response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let status_code = status.as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read response body".to_string());

    if status.is_client_error() {
        Err(AdapterError::Client {
            status: status_code,
            message,
        })
    } else if status.is_server_error() {
        Err(AdapterError::Server {
            status: status_code,
            message,
        })
    } else {
        Err(AdapterError::Protocol(format!(
            "unexpected HTTP {}: {}",
            status_code, message
        )))
    }
}

/// Read a complete JSON body into `T`.
pub async fn read_json<T: DeserializeOwned>(
    response: Response,
    timeout: Duration,
) -> Result<T, AdapterError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| AdapterError::from_reqwest(e, timeout))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AdapterError::Protocol(format!("unexpected response body: {}", e)))
}

/// GET a JSON document from an engine.
pub async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<T, AdapterError> {
    let req = with_auth(client.get(url), api_key).timeout(timeout);
    let response = send(req, timeout).await?;
    read_json(response, timeout).await
}

/// Reassembles newline-delimited records from arbitrarily split body chunks.
///
/// Both SSE (`data: ...` lines) and NDJSON bodies are framed by newlines, but
/// a network chunk may end in the middle of a record.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left once the body has ended without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Payload of an SSE `data:` field, if the line is one.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}
