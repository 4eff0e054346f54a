//! HTTP client for the automation platform's REST API
//!
//! Request/response collaborator for invoking domain service calls and
//! the startup self-test. Transient failures are retried a few
//! times with exponential backoff internally; callers only see the final
//! success-or-failure outcome. The access token never appears in logs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use habot_core::EntityId;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Errors surfaced to callers of the API client
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Transport(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The seam through which user actions reach the platform.
///
/// The router depends on this trait, not on the concrete client, so tests
/// can count and fail calls at will.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Invoke `domain.service` with a JSON payload. `Ok` means the
    /// platform accepted the call; `Err` carries whatever detail it gave.
    async fn call_service(&self, domain: &str, service: &str, data: Value) -> ApiResult<()>;
}

/// REST client: one reused connection pool, bounded retry on transient
/// failures, no retry on definitive client errors.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> ApiResult<Value> {
        let url = format!("{}/{path}", self.base_url);
        let mut last_error = ApiError::Transport("no attempt made".into());

        for attempt in 1..=MAX_RETRIES {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token);
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json().await.unwrap_or(Value::Null));
                    }

                    let body_text: String =
                        resp.text().await.unwrap_or_default().chars().take(300).collect();
                    last_error = ApiError::Status {
                        status: status.as_u16(),
                        body: body_text,
                    };

                    // Client errors other than 429 are definitive
                    if status.is_client_error() && status.as_u16() != 429 {
                        error!(%method, path, %status, "API client error (no retry)");
                        return Err(last_error);
                    }
                    warn!(%method, path, %status, attempt, "API error");
                }
                Err(e) if e.is_timeout() => {
                    last_error = ApiError::Timeout;
                    warn!(%method, path, attempt, "API timeout");
                }
                Err(e) => {
                    last_error = ApiError::Transport(e.to_string());
                    warn!(%method, path, attempt, error = %e, "API connection error");
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(RETRY_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
        }

        error!(%method, path, error = %last_error, "API request failed after retries");
        Err(last_error)
    }

    /// Fetch the platform config block. Used for the startup self-test;
    /// the interesting field is `version`.
    pub async fn get_config(&self) -> ApiResult<Value> {
        self.request(reqwest::Method::GET, "config", None).await
    }
}

#[async_trait]
impl ActionExecutor for ApiClient {
    async fn call_service(&self, domain: &str, service: &str, data: Value) -> ApiResult<()> {
        let entity = data
            .get("entity_id")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        self.request(
            reqwest::Method::POST,
            &format!("services/{domain}/{service}"),
            Some(&data),
        )
        .await?;
        info!(domain, service, entity, "service called");
        Ok(())
    }
}

/// Convenience payload builder for the common single-entity case.
pub fn entity_payload(entity_id: &EntityId) -> Value {
    serde_json::json!({ "entity_id": entity_id.to_string() })
}

/// Payload builder with extra fields on top of `entity_id`.
pub fn entity_payload_with(
    entity_id: &EntityId,
    extra: HashMap<&str, Value>,
) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "entity_id".to_string(),
        Value::String(entity_id.to_string()),
    );
    for (k, v) in extra {
        map.insert(k.to_string(), v);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_payload() {
        let id: EntityId = "light.desk".parse().unwrap();
        assert_eq!(entity_payload(&id), json!({"entity_id": "light.desk"}));
    }

    #[test]
    fn test_entity_payload_with_extra() {
        let id: EntityId = "light.desk".parse().unwrap();
        let payload = entity_payload_with(&id, HashMap::from([("brightness", json!(179))]));
        assert_eq!(payload["entity_id"], "light.desk");
        assert_eq!(payload["brightness"], 179);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://supervisor/core/api/", "tok").unwrap();
        assert_eq!(client.base_url, "http://supervisor/core/api");
    }
}
