//! Minimal HTTP/1 client on hyper.
//!
//! One TCP connection per request, no pooling. Callers impose their own
//! deadlines with `tokio::time::timeout`; dropping the future drops the
//! connection. Connection failures are reported separately from failures
//! after the connection was established so the dispatcher can tell an
//! unreachable instance from a broken exchange.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub use http::Method;

/// Errors from a single outbound HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("decode response: {0}")]
    Decode(String),
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-case.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::Decode(e.to_string()))
    }
}

/// Send a request and buffer the whole response body.
pub async fn request(
    method: http::Method,
    url: &str,
    headers: &[(String, String)],
    body: Bytes,
) -> Result<HttpResponse, HttpError> {
    let uri: http::Uri = url
        .parse()
        .map_err(|_| HttpError::InvalidUrl(url.to_string()))?;
    let authority = uri
        .authority()
        .ok_or_else(|| HttpError::InvalidUrl(url.to_string()))?
        .clone();
    let address = match authority.port_u16() {
        Some(_) => authority.as_str().to_string(),
        None => format!("{}:80", authority.host()),
    };
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let stream = tokio::net::TcpStream::connect(&address)
        .await
        .map_err(|e| HttpError::Connect {
            address: address.clone(),
            reason: e.to_string(),
        })?;

    let request_err = |e: &dyn std::fmt::Display| HttpError::Request {
        url: url.to_string(),
        reason: e.to_string(),
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| request_err(&e))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "http connection closed with error");
        }
    });

    let mut builder = http::Request::builder()
        .method(method)
        .uri(path)
        .header("host", authority.as_str())
        .header("user-agent", "faasgrid/0.1");
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let req = builder
        .body(Full::new(body))
        .map_err(|e| request_err(&e))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| request_err(&e))?;

    let status = resp.status().as_u16();
    let headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| request_err(&e))?
        .to_bytes();

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// POST a JSON payload.
pub async fn post_json<T: Serialize + ?Sized>(
    url: &str,
    payload: &T,
) -> Result<HttpResponse, HttpError> {
    let body = serde_json::to_vec(payload).map_err(|e| HttpError::Decode(e.to_string()))?;
    request(
        http::Method::POST,
        url,
        &[("content-type".to_string(), "application/json".to_string())],
        Bytes::from(body),
    )
    .await
}

/// Send a DELETE with an empty body.
pub async fn delete(url: &str) -> Result<HttpResponse, HttpError> {
    request(http::Method::DELETE, url, &[], Bytes::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection, capture the raw request, reply with `response`.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn post_json_sends_body_and_reads_response() {
        let (addr, server) = one_shot_server(
            "HTTP/1.1 201 Created\r\ncontent-type: application/json\r\ncontent-length: 11\r\n\r\n{\"ok\":true}",
        )
        .await;

        let resp = post_json(&format!("http://{addr}/runtime/heartbeat"), &serde_json::json!({"a": 1}))
            .await
            .unwrap();

        assert_eq!(resp.status, 201);
        assert!(resp.is_success());
        assert_eq!(resp.header("Content-Type"), Some("application/json"));
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["ok"], true);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /runtime/heartbeat HTTP/1.1"));
        assert!(raw.ends_with("{\"a\":1}"));
    }

    #[tokio::test]
    async fn closed_port_is_a_connect_error() {
        let err = request(http::Method::GET, "http://127.0.0.1:1/", &[], Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Connect { .. }));
    }

    #[tokio::test]
    async fn url_without_authority_is_rejected() {
        let err = request(http::Method::GET, "/just/a/path", &[], Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidUrl(_)));
    }
}
