//! Instance proxy: forwards an invocation to an instance executor.
//!
//! The dispatcher owns the deadline; dropping the forward future drops the
//! connection and leaves any orphaned work to the executor.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use thiserror::Error;

use faasgrid_core::http::{self, HttpError};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProxyError {
    /// No connection could be made.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The exchange failed after connecting.
    #[error("transport: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends invocation payloads to instance executors.
pub trait InstanceProxy: Send + Sync {
    fn forward<'a>(
        &'a self,
        address: &'a str,
        request: ProxyRequest,
    ) -> BoxFuture<'a, Result<ProxyResponse, ProxyError>>;
}

/// Forwards over HTTP/1 to `POST http://{address}/`.
#[derive(Debug, Default, Clone)]
pub struct HttpProxy;

/// Headers worth passing through to the executor.
const FORWARDED: &[&str] = &["content-type", "x-request-id"];

impl InstanceProxy for HttpProxy {
    fn forward<'a>(
        &'a self,
        address: &'a str,
        request: ProxyRequest,
    ) -> BoxFuture<'a, Result<ProxyResponse, ProxyError>> {
        Box::pin(async move {
            let url = format!("http://{address}/");
            let headers: Vec<(String, String)> = request
                .headers
                .into_iter()
                .filter(|(k, _)| FORWARDED.iter().any(|f| k.eq_ignore_ascii_case(f)))
                .collect();
            let resp = http::request(http::Method::POST, &url, &headers, request.body)
                .await
                .map_err(|e| match e {
                    HttpError::Connect { .. } => ProxyError::Unreachable(e.to_string()),
                    other => ProxyError::Transport(other.to_string()),
                })?;
            Ok(ProxyResponse {
                status: resp.status,
                headers: resp.headers,
                body: resp.body,
            })
        })
    }
}
