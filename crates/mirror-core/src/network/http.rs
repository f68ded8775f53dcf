//! HTTP transport on top of reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::Transport;
use crate::config::{ClientConfig, NetworkDefaults};
use crate::endpoint::{HttpMethod, RequestDescription};
use crate::error::{FetchError, MirrorError, Result};
use crate::session::Identity;

/// [`Transport`] that sends requests to a base URL with JSON bodies.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport for `base_url` with the default timeout.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, NetworkDefaults::REQUEST_TIMEOUT, NetworkDefaults::USER_AGENT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let base_url = parse_base(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| MirrorError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, base_url })
    }

    /// Build from a validated [`ClientConfig`]. Fails if it has no base URL.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| MirrorError::Config {
            message: "base_url is required for the HTTP transport".to_string(),
        })?;
        Self::with_timeout(base_url, config.request_timeout(), &config.user_agent)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL for `request`, query included.
    pub fn url_for(&self, request: &RequestDescription) -> std::result::Result<Url, FetchError> {
        let path = request.path.trim_start_matches('/');
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| {
                FetchError::network(format!("Invalid request path {}: {}", request.path, e))
            })?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &RequestDescription,
        identity: Option<&Identity>,
    ) -> std::result::Result<Value, FetchError> {
        let url = self.url_for(request)?;
        let mut builder = self.client.request(method(request.method), url.clone());
        if let Some(token) = identity.and_then(|identity| identity.access_token.as_deref()) {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!("{} {}", request.method, url);
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(format!("{} {} timed out", request.method, url))
            } else {
                FetchError::network(format!("{} {} failed: {}", request.method, url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!("{} {} returned {}", request.method, url, status);
            return Err(classify_status(status));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(format!("Reading body of {} timed out", url))
            } else {
                FetchError::network(format!("Reading body of {} failed: {}", url, e))
            }
        })?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::decode(format!("Invalid JSON from {}: {}", url, e)))
    }
}

fn parse_base(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).map_err(|e| MirrorError::Config {
        message: format!("Invalid base URL {}: {}", base_url, e),
    })?;
    // Without a trailing slash `join` would replace the last path segment.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn classify_status(status: StatusCode) -> FetchError {
    let reason = status.canonical_reason().unwrap_or("unknown status");
    match status {
        StatusCode::UNAUTHORIZED => {
            let mut error = FetchError::unauthenticated(reason);
            error.status = Some(status.as_u16());
            error
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            let mut error = FetchError::timeout(reason);
            error.status = Some(status.as_u16());
            error
        }
        _ => FetchError::status(status.as_u16(), reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;

    #[test]
    fn test_url_for_joins_under_base_path() {
        let transport = HttpTransport::new("https://api.example.com/v1").unwrap();
        let request = RequestDescription::get("/threads/42/messages").with_query("limit", "20");
        let url = transport.url_for(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/threads/42/messages?limit=20"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpTransport::new("not a url").unwrap_err();
        assert!(matches!(err, MirrorError::Config { .. }));
    }

    #[test]
    fn test_from_config_requires_base_url() {
        let err = HttpTransport::from_config(&ClientConfig::default()).unwrap_err();
        assert!(matches!(err, MirrorError::Config { .. }));

        let config = ClientConfig::default().with_base_url("http://localhost:8080");
        let transport = HttpTransport::from_config(&config).unwrap();
        assert_eq!(transport.base_url().as_str(), "http://localhost:8080/");
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED).kind,
            FetchErrorKind::Unauthenticated
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT).kind,
            FetchErrorKind::Timeout
        );
        let missing = classify_status(StatusCode::NOT_FOUND);
        assert_eq!(missing.kind, FetchErrorKind::Status);
        assert_eq!(missing.status, Some(404));
        assert!(!missing.is_retryable());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
    }

    #[tokio::test]
    async fn test_connection_failure_is_network_error() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let transport = HttpTransport::with_timeout(
            "http://127.0.0.1:9",
            Duration::from_secs(2),
            NetworkDefaults::USER_AGENT,
        )
        .unwrap();
        let err = transport
            .execute(&RequestDescription::get("/ping"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            FetchErrorKind::Network | FetchErrorKind::Timeout
        ));
    }
}
