//! Backend API client.
//!
//! Provides authenticated HTTP communication with the POS backend: the
//! transaction submit used by the offline queue drain and the lightweight
//! health check that feeds the network monitor.

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::SubmitError;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const SUBMIT_PATH: &str = "/api/pos/transactions";
const HEALTH_PATH: &str = "/api/health";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise a backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
pub(crate) fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Backend endpoint not found".to_string(),
        409 => "Transaction already recorded".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Pull `error`/`message` out of a JSON error body, falling back to the
/// status description.
fn rejection_message(status: StatusCode, body_text: &str) -> String {
    serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_error(status))
}

// ---------------------------------------------------------------------------
// Submit seam
// ---------------------------------------------------------------------------

/// Anything that can hand a completed sale to the backend.
///
/// The offline queue is generic over this so drains can be exercised
/// against scripted backends.
pub trait TransactionSubmitter: Send + Sync {
    fn submit_transaction(
        &self,
        payload: &Value,
        line_items: &[Value],
        idempotency_key: &str,
    ) -> impl Future<Output = Result<Value, SubmitError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct BackendClient {
    http: Client,
    base_url: Option<String>,
    api_key: Zeroizing<String>,
}

impl BackendClient {
    pub fn new(base_url: Option<&str>, api_key: Zeroizing<String>) -> Result<Self, SubmitError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SubmitError::Network(format!("Failed to create HTTP client: {e}")))?;
        let base_url = base_url
            .map(normalize_base_url)
            .filter(|u| !u.is_empty());
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Lightweight reachability check. Any transport error or non-2xx
    /// response counts as offline.
    pub async fn check_health(&self) -> bool {
        let Some(base) = self.base_url.as_deref() else {
            return false;
        };
        let url = format!("{base}{HEALTH_PATH}");
        match self
            .http
            .head(&url)
            .timeout(HEALTH_TIMEOUT)
            .header("X-POS-API-Key", self.api_key.as_str())
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %friendly_error(base, &e), "health probe failed");
                false
            }
        }
    }
}

impl TransactionSubmitter for BackendClient {
    async fn submit_transaction(
        &self,
        payload: &Value,
        line_items: &[Value],
        idempotency_key: &str,
    ) -> Result<Value, SubmitError> {
        let base = self.base_url.as_deref().ok_or(SubmitError::NotConfigured)?;
        let url = format!("{base}{SUBMIT_PATH}");
        let body = serde_json::json!({
            "transaction": payload,
            "lineItems": line_items,
        });

        let resp = self
            .http
            .post(&url)
            .header("X-POS-API-Key", self.api_key.as_str())
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SubmitError::Network(friendly_error(base, &e)))?;

        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let message = rejection_message(status, &body_text);
            warn!(status = status.as_u16(), %message, "transaction submit rejected");
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        // Empty 201/204 responses carry no transaction body.
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| SubmitError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("pos.example.com/"), "https://pos.example.com");
        assert_eq!(normalize_base_url("localhost:3000/api/"), "http://localhost:3000");
        assert_eq!(normalize_base_url("  https://x.io/api  "), "https://x.io");
        assert_eq!(normalize_base_url(""), "");
    }

    #[test]
    fn test_rejection_message_prefers_body_error() {
        let msg = rejection_message(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"Unknown SKU","details":["SKU-9"]}"#,
        );
        assert_eq!(msg, "Unknown SKU");
        assert_eq!(
            rejection_message(StatusCode::BAD_GATEWAY, "<html>"),
            "Backend server error (HTTP 502)"
        );
    }

    #[tokio::test]
    async fn test_unconfigured_client_is_offline_and_cannot_submit() {
        let client = BackendClient::new(None, Zeroizing::new(String::new())).unwrap();
        assert!(!client.check_health().await);
        let err = client
            .submit_transaction(&serde_json::json!({}), &[], "k")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NotConfigured));
    }
}
