//! Single-shot HTTP calls against proxy and companion endpoints.
//!
//! [`EndpointClient`] issues exactly one request per call and reports what happened:
//! a status code for any received response, or an [`EndpointError`] when the URL is
//! malformed or nothing came back. Retry policy belongs to the callers.
//!
//! Response bodies are always read to the end, so connections are returned to the
//! pool even when the body is not what was expected.

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// State reported by the proxy admin API on `GET /server_info`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub state: String,
}

impl ServerInfo {
    pub const LIVE: &'static str = "LIVE";

    pub fn is_live(&self) -> bool {
        self.state == Self::LIVE
    }
}

/// Errors that can occur while calling an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin wrapper around a shared [`reqwest::Client`].
#[derive(Clone, Debug, Default)]
pub struct EndpointClient {
    client: Client,
}

impl EndpointClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends a body-less request and returns the response status.
    ///
    /// A `timeout` of `None` (or zero) leaves the request unbounded.
    pub async fn call(
        &self,
        method: Method,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<StatusCode, EndpointError> {
        let context = context_for(&method);
        let (status, _) = self.send(method, url, timeout, context).await?;
        Ok(status)
    }

    /// Sends `GET {url}` and decodes the admin API server state.
    pub async fn server_info(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<ServerInfo, EndpointError> {
        let context = "GET /server_info";
        let (_, body) = self.send(Method::GET, url, timeout, context).await?;
        serde_json::from_slice(&body)
            .map_err(|source| EndpointError::JsonDeserialization { context, source })
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        timeout: Option<Duration>,
        context: &'static str,
    ) -> Result<(StatusCode, Vec<u8>), EndpointError> {
        let url = Url::parse(url).map_err(|source| EndpointError::UrlParse { context, source })?;
        let mut req = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            req = req.timeout(timeout);
        }
        let response = req
            .send()
            .await
            .map_err(|source| EndpointError::Http { context, source })?;
        let status = response.status();
        let body = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                tracing::debug!(error = %e, "{}: failed to drain response body", context);
                Vec::new()
            }
        };
        Ok((status, body))
    }
}

fn context_for(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        _ => "HTTP request",
    }
}
