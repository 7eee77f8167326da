//! Single signed HTTP POST attempts against subscriber endpoints.

use crate::config::WebhookConfig;
use crate::services::signer;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Maximum number of response-body characters kept in an error detail.
const ERROR_BODY_LIMIT: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP {status}{}", body_suffix(.body))]
    Status { status: u16, body: String },

    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(": {}", body)
    }
}

impl DeliveryError {
    /// Whether retrying cannot help. Only 4xx responses other than
    /// 408 and 429 qualify, plus requests that could not even be built.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                (400..500).contains(status)
                    && *status != StatusCode::REQUEST_TIMEOUT.as_u16()
                    && *status != StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            Self::InvalidRequest(_) => true,
            Self::Timeout(_) | Self::Transport(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Stateless webhook sender sharing one connection pool.
#[derive(Clone)]
pub struct DeliveryClient {
    http: Client,
    timeout: Duration,
}

impl DeliveryClient {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build webhook HTTP client: {}", e))?;

        Ok(Self {
            http,
            timeout: config.timeout(),
        })
    }

    /// POST `payload` to `url`, signed with `secret`. Any status below 400
    /// counts as delivered; the response body is not inspected.
    pub async fn deliver(
        &self,
        url: &str,
        secret: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Result<u16, DeliveryError> {
        let headers = build_headers(secret, event_type, payload)?;

        let started = Instant::now();
        let result = self
            .http
            .post(url)
            .headers(headers)
            .body(payload.to_vec())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                tracing::debug!(
                    url,
                    status = status.as_u16(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Webhook endpoint responded"
                );
                if status.as_u16() < 400 {
                    return Ok(status.as_u16());
                }
                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(ERROR_BODY_LIMIT)
                    .collect();
                Err(DeliveryError::Status {
                    status: status.as_u16(),
                    body: body.trim().to_string(),
                })
            }
            Err(e) if e.is_timeout() => Err(DeliveryError::Timeout(self.timeout)),
            Err(e) if e.is_builder() => Err(DeliveryError::InvalidRequest(e.to_string())),
            Err(e) => Err(DeliveryError::Transport(e.to_string())),
        }
    }
}

fn build_headers(
    secret: &str,
    event_type: &str,
    payload: &[u8],
) -> Result<HeaderMap, DeliveryError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let signature = HeaderValue::from_str(&signer::sign(secret, payload))
        .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))?;
    headers.insert(SIGNATURE_HEADER, signature);

    let event = HeaderValue::from_str(event_type)
        .map_err(|_| DeliveryError::InvalidRequest(format!("bad event type '{}'", event_type)))?;
    headers.insert(EVENT_TYPE_HEADER, event);

    Ok(headers)
}
