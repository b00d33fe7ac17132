//! HTTP transport seam
//!
//! The fetcher and the mutation coordinator never talk to `reqwest` directly.
//! They build an [`HttpRequest`], hand it to an [`HttpTransport`] and interpret
//! the [`HttpResponse`]. [`ReqwestTransport`] is the production implementation;
//! tests plug in scripted transports.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Transport-neutral description of an outgoing request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,

    /// Path segments below the configured base URL (unencoded)
    pub segments: Vec<String>,

    /// Query parameters in the order they are sent
    pub query: Vec<(String, String)>,

    /// Request headers
    pub headers: Vec<(String, String)>,

    /// Optional JSON body
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new<I, S>(method: Method, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::GET, segments)
    }

    pub fn post<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::POST, segments)
    }

    pub fn put<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::PUT, segments)
    }

    pub fn delete<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::DELETE, segments)
    }

    /// Append a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set a header, replacing any previous value with the same name
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    /// Attach a JSON body
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Case-insensitive header lookup
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Path relative to the base URL, used for logging and error context
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    /// Short `METHOD /path` description
    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.path())
    }
}

/// Transport-neutral response: status, headers and raw body
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn from_parts(status: StatusCode, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body to the JSON encoding of `value`
    pub fn with_json<B: Serialize>(mut self, value: &B) -> Self {
        self.body = serde_json::to_vec(value).unwrap_or_default();
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `ETag` response header, if present and non-empty
    pub fn etag(&self) -> Option<String> {
        self.header(reqwest::header::ETAG.as_str())
            .map(str::trim)
            .filter(|etag| !etag.is_empty())
            .map(str::to_string)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Decode the body as a JSON value, `None` if it is empty or malformed
    pub fn json_value(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}

/// Sends requests to the settings server
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform the request.
    ///
    /// Returns `Err(ClientError::Transport)` only when no response was received.
    /// Every HTTP status, including 4xx and 5xx, is returned as `Ok`.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ClientError::Config(format!("invalid base_url {}: {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Config(format!(
                "base_url {} cannot carry path segments",
                config.base_url
            )));
        }

        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.clone(),
        })
    }

    fn url_for(&self, request: &HttpRequest) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::Config("base_url cannot be a base".to_string()))?;
            segments.pop_if_empty().extend(request.segments.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = self.url_for(&request)?;
        debug!("{} {}", request.method, url);

        let mut builder = self.client.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse::from_parts(status, headers, body))
    }
}

/// Scripted [`HttpTransport`] for tests, enabled by the `test-util` feature
#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    enum Reply {
        Response(HttpResponse),
        Failure(String),
    }

    /// Transport that answers from a queue and records every request
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<HttpRequest>>,
        delay: Option<Duration>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every request waits `delay` before its reply is taken from the queue
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn push(&self, response: HttpResponse) {
            self.replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(Reply::Response(response));
        }

        /// Queue a transport failure
        pub fn push_failure(&self, message: &str) {
            self.replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(Reply::Failure(message.to_string()));
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn request_count(&self) -> usize {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        pub fn last_request(&self) -> Option<HttpRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last()
                .cloned()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self
                .replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match reply {
                Some(Reply::Response(response)) => Ok(response),
                Some(Reply::Failure(message)) => Err(ClientError::Transport(message)),
                None => Err(ClientError::Transport("no scripted response".to_string())),
            }
        }
    }
}
