//! HTTP remote store client.
//!
//! Mutations are posted as JSON to `{base}/v1/mutations` with the idempotency
//! key in an `Idempotency-Key` header. Reachability is `GET {base}/health`.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use super::remote::{RemoteError, RemoteRequest, RemoteResponse, RemoteResult, RemoteStore};
use crate::config::SyncConfig;
use crate::util::{compact_text, is_http_url, normalize_text_option};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            token: normalize_text_option(token),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// Build a client from `FURROW_REMOTE_*` configuration.
    pub fn from_config(config: &SyncConfig) -> RemoteResult<Self> {
        let base_url = config.remote_url.clone().ok_or_else(|| {
            RemoteError::Rejected("no remote store configured (FURROW_REMOTE_URL)".to_string())
        })?;
        Self::new(base_url, config.remote_token.clone(), config.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn is_reachable(&self) -> bool {
        let request = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT);

        match self.authorize(request).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!("Remote store unreachable: {error}");
                false
            }
        }
    }

    async fn apply(&self, request: &RemoteRequest) -> RemoteResult<RemoteResponse> {
        let http_request = self
            .client
            .post(format!("{}/v1/mutations", self.base_url))
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .header("Accept", "application/json")
            .json(request);

        let response = self.authorize(http_request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = parse_api_error(status, &body);
            return Err(if is_transient_status(status) {
                RemoteError::Transient(message)
            } else {
                RemoteError::Rejected(message)
            });
        }

        let echoed_key = response
            .headers()
            .get(IDEMPOTENCY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let mut payload = response.json::<RemoteResponse>().await?;
        if payload.idempotency_key.is_empty() {
            payload.idempotency_key = echoed_key.unwrap_or_default();
        }
        Ok(payload)
    }
}

/// Timeouts, throttling, and server errors are retryable; other 4xx are not.
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> RemoteResult<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| RemoteError::Rejected("remote url must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::Rejected(
            "remote url must include http:// or https://".to_string(),
        ))
    }
}
