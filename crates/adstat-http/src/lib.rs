//! HTTP session utilities for talking to the reporting API.

use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "adstat-http";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// `None` leaves the transport default in place.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub cookie_store: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            cookie_store: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A cookie-keeping client shared by every request of one run.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: reqwest::Client,
}

impl HttpSession {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(config.cookie_store);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// POST an urlencoded form and decode the JSON response.
    pub async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let request = self.client.post(url).form(form);
        send_json(request, url)
            .instrument(info_span!("http_post_form", url))
            .await
    }

    /// POST a JSON body, optionally with a bearer token, and decode the JSON response.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        bearer_token: Option<&str>,
    ) -> Result<T, FetchError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        send_json(request, url)
            .instrument(info_span!("http_post_json", url))
            .await
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder, url: &str) -> Result<T, FetchError> {
    let resp = request.send().await?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    ensure_success(status, &final_url)?;

    let body = resp.bytes().await?;
    debug!(bytes = body.len(), %status, "response received");
    serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

pub fn ensure_success(status: StatusCode, url: &str) -> Result<(), FetchError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serves exactly one canned response and hands back the raw request head.
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&received).to_ascii_lowercase()
        });
        (format!("http://{addr}/api/report/tgview"), handle)
    }

    #[test]
    fn default_config_keeps_transport_timeout_and_cookies() {
        let config = HttpClientConfig::default();
        assert!(config.timeout.is_none());
        assert!(config.cookie_store);
        assert_eq!(config.user_agent.as_deref(), Some(DEFAULT_USER_AGENT));
    }

    #[test]
    fn non_success_status_is_an_error() {
        let err = ensure_success(StatusCode::UNAUTHORIZED, "http://x/login").unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 401, .. }));
        assert!(ensure_success(StatusCode::OK, "http://x/login").is_ok());
    }

    #[tokio::test]
    async fn post_json_sends_bearer_token_and_decodes_body() {
        let (url, server) = one_shot_server("200 OK", r#"{"results":[{"object":"u1"}]}"#).await;
        let session = HttpSession::new(HttpClientConfig::default()).expect("session");

        let value: Value = session
            .post_json(&url, &json!({"platform": [10]}), Some("tok"))
            .await
            .expect("post");

        assert_eq!(value["results"][0]["object"], "u1");
        let head = server.await.expect("server");
        assert!(head.starts_with("post /api/report/tgview"));
        assert!(head.contains("authorization: bearer tok"));
        assert!(head.contains("user-agent: mozilla/5.0"));
    }

    #[tokio::test]
    async fn post_form_surfaces_http_status() {
        let (url, server) = one_shot_server("401 Unauthorized", r#"{"detail":"bad credentials"}"#).await;
        let session = HttpSession::new(HttpClientConfig::default()).expect("session");

        let err = session
            .post_form::<Value>(&url, &[("username", "u"), ("password", "p")])
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 401, .. }));
        let head = server.await.expect("server");
        assert!(head.contains("content-type: application/x-www-form-urlencoded"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let (url, server) = one_shot_server("200 OK", "<html>maintenance</html>").await;
        let session = HttpSession::new(HttpClientConfig::default()).expect("session");

        let err = session.post_json::<_, Value>(&url, &json!({}), None).await.unwrap_err();

        assert!(matches!(err, FetchError::Decode { .. }));
        server.await.expect("server");
    }
}
