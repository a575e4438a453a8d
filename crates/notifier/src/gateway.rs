//! Push gateway capability.
//!
//! The gateway owns platform-specific envelopes and fan-out; this subsystem
//! only hands it a token (or topic) plus a rendered payload. The concrete
//! implementation is picked once at startup:
//! - `LiveGateway` when credentials are configured (JSON over HTTP)
//! - `SimulatedGateway` otherwise, logging every call and reporting synthetic success

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nudge_common::config::GatewayConfig;
use nudge_common::error::GatewayError;
use nudge_common::types::{Notification, Topic, token_prefix};

/// Error codes the gateway uses for tokens that will never succeed again.
const PERMANENT_ERROR_CODES: &[&str] = &[
    "UNREGISTERED",
    "INVALID_ARGUMENT",
    "NOT_FOUND",
    "registration-token-not-registered",
    "invalid-registration-token",
];

/// Payload handed to the gateway for a single delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Opaque client data; always carries `type` and `sent_at`.
    pub data: BTreeMap<String, String>,
}

impl PushPayload {
    pub fn render(notification: &Notification, sent_at: DateTime<Utc>) -> Self {
        let mut data = notification.data.clone();
        data.insert("type".to_string(), notification.kind.to_string());
        data.insert("sent_at".to_string(), sent_at.to_rfc3339());

        Self {
            title: notification.title.clone(),
            body: notification.body.clone(),
            image_url: notification.image_url.clone(),
            data,
        }
    }
}

/// Per-token result counts of a topic (un)subscribe call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipReport {
    pub success_count: usize,
    pub failure_count: usize,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// True for the credential-less fallback.
    fn is_simulated(&self) -> bool {
        false
    }

    /// Deliver to one device token. Returns the gateway's message id.
    async fn send_to_token(&self, token: &str, payload: &PushPayload)
    -> Result<String, GatewayError>;

    /// Broadcast to a topic; the gateway fans out server-side.
    async fn send_to_topic(&self, topic: Topic, payload: &PushPayload)
    -> Result<String, GatewayError>;

    async fn subscribe_tokens(
        &self,
        tokens: &[String],
        topic: Topic,
    ) -> Result<MembershipReport, GatewayError>;

    async fn unsubscribe_tokens(
        &self,
        tokens: &[String],
        topic: Topic,
    ) -> Result<MembershipReport, GatewayError>;
}

/// Pick the gateway implementation for the given configuration.
pub fn connect(config: Option<GatewayConfig>) -> anyhow::Result<Arc<dyn PushGateway>> {
    match config {
        Some(config) => {
            tracing::info!(endpoint = %config.endpoint, "Push gateway configured");
            Ok(Arc::new(LiveGateway::new(config)?))
        }
        None => {
            tracing::warn!("Push gateway credentials missing, running in simulated mode");
            Ok(Arc::new(SimulatedGateway))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

/// HTTP client for a live push gateway.
pub struct LiveGateway {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
    timeout: Duration,
}

impl LiveGateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            server_key: config.server_key,
            timeout: config.timeout,
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, GatewayError> {
        let response = self
            .client
            .post(format!("{}/{}", self.endpoint, path))
            .bearer_auth(&self.server_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout)
                } else {
                    GatewayError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| GatewayError::Transient(format!("invalid gateway response: {}", e)));
        }

        let detail = response
            .json::<ErrorResponse>()
            .await
            .unwrap_or_default()
            .error;
        Err(classify_failure(
            status.as_u16(),
            detail.code.as_deref(),
            detail.message.as_deref(),
        ))
    }
}

/// Map a failed gateway response onto a permanent or transient error.
pub fn classify_failure(status: u16, code: Option<&str>, message: Option<&str>) -> GatewayError {
    let description = match (code, message) {
        (Some(code), Some(message)) => format!("{} ({}): {}", code, status, message),
        (Some(code), None) => format!("{} ({})", code, status),
        (None, Some(message)) => format!("HTTP {}: {}", status, message),
        (None, None) => format!("HTTP {}", status),
    };

    let permanent_code = code.is_some_and(|c| PERMANENT_ERROR_CODES.contains(&c));
    if permanent_code || status == 404 || status == 410 {
        GatewayError::Permanent(description)
    } else {
        GatewayError::Transient(description)
    }
}

#[async_trait]
impl PushGateway for LiveGateway {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn send_to_token(
        &self,
        token: &str,
        payload: &PushPayload,
    ) -> Result<String, GatewayError> {
        let body = serde_json::json!({ "token": token, "notification": payload });
        let response: SendResponse = self.post("messages:send", &body).await?;
        Ok(response.message_id)
    }

    async fn send_to_topic(
        &self,
        topic: Topic,
        payload: &PushPayload,
    ) -> Result<String, GatewayError> {
        let body = serde_json::json!({ "topic": topic, "notification": payload });
        let response: SendResponse = self.post("messages:send", &body).await?;
        Ok(response.message_id)
    }

    async fn subscribe_tokens(
        &self,
        tokens: &[String],
        topic: Topic,
    ) -> Result<MembershipReport, GatewayError> {
        let body = serde_json::json!({ "topic": topic, "tokens": tokens });
        self.post("topics:subscribe", &body).await
    }

    async fn unsubscribe_tokens(
        &self,
        tokens: &[String],
        topic: Topic,
    ) -> Result<MembershipReport, GatewayError> {
        let body = serde_json::json!({ "topic": topic, "tokens": tokens });
        self.post("topics:unsubscribe", &body).await
    }
}

/// Stand-in used when no gateway credentials are configured.
pub struct SimulatedGateway;

impl SimulatedGateway {
    fn message_id() -> String {
        format!("simulated-{}", Uuid::new_v4())
    }
}

#[async_trait]
impl PushGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_simulated(&self) -> bool {
        true
    }

    async fn send_to_token(
        &self,
        token: &str,
        payload: &PushPayload,
    ) -> Result<String, GatewayError> {
        tracing::info!(
            token = token_prefix(token),
            title = %payload.title,
            "[simulated] push to token"
        );
        Ok(Self::message_id())
    }

    async fn send_to_topic(
        &self,
        topic: Topic,
        payload: &PushPayload,
    ) -> Result<String, GatewayError> {
        tracing::info!(topic = %topic, title = %payload.title, "[simulated] push to topic");
        Ok(Self::message_id())
    }

    async fn subscribe_tokens(
        &self,
        tokens: &[String],
        topic: Topic,
    ) -> Result<MembershipReport, GatewayError> {
        tracing::info!(topic = %topic, tokens = tokens.len(), "[simulated] topic subscribe");
        Ok(MembershipReport {
            success_count: tokens.len(),
            failure_count: 0,
        })
    }

    async fn unsubscribe_tokens(
        &self,
        tokens: &[String],
        topic: Topic,
    ) -> Result<MembershipReport, GatewayError> {
        tracing::info!(topic = %topic, tokens = tokens.len(), "[simulated] topic unsubscribe");
        Ok(MembershipReport {
            success_count: tokens.len(),
            failure_count: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_common::types::NotificationType;

    #[test]
    fn test_payload_carries_type_and_timestamp() {
        let notification = Notification::new("Title", "Body", NotificationType::HealthAlert)
            .with_data("metric", "glucose");
        let payload = PushPayload::render(&notification, Utc::now());

        assert_eq!(payload.data.get("type").map(String::as_str), Some("health_alert"));
        assert_eq!(payload.data.get("metric").map(String::as_str), Some("glucose"));
        assert!(payload.data.contains_key("sent_at"));
    }

    #[test]
    fn test_classify_permanent_codes() {
        assert!(classify_failure(400, Some("UNREGISTERED"), None).is_permanent());
        assert!(
            classify_failure(400, Some("invalid-registration-token"), Some("bad")).is_permanent()
        );
        assert!(classify_failure(410, None, None).is_permanent());
        assert!(classify_failure(404, None, Some("gone")).is_permanent());
    }

    #[test]
    fn test_classify_transient() {
        assert!(!classify_failure(503, Some("UNAVAILABLE"), None).is_permanent());
        assert!(!classify_failure(429, None, Some("quota")).is_permanent());
        assert!(!classify_failure(500, None, None).is_permanent());
    }

    #[test]
    fn test_connect_without_config_is_simulated() {
        let gateway = connect(None).unwrap();
        assert!(gateway.is_simulated());
        assert_eq!(gateway.name(), "simulated");
    }

    #[tokio::test]
    async fn test_simulated_gateway_reports_success() {
        let gateway = SimulatedGateway;
        let notification = Notification::new("t", "b", NotificationType::General);
        let payload = PushPayload::render(&notification, Utc::now());

        let id = gateway.send_to_token("token", &payload).await.unwrap();
        assert!(id.starts_with("simulated-"));

        let tokens = vec!["a".to_string(), "b".to_string()];
        let report = gateway.subscribe_tokens(&tokens, Topic::HealthTips).await.unwrap();
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 0);
    }
}
