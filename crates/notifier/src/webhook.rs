//! Webhook transport: POSTs the rendered payload to the URL configured for
//! the channel.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};

use herald_common::config::WebhookConfig;
use herald_common::error::AppError;

use crate::channel::{ChannelClient, DeliveryResult};

/// Longest response body excerpt kept in `last_error`.
const ERROR_BODY_LIMIT: usize = 200;

pub struct WebhookClient {
    client: Client,
    endpoints: HashMap<String, String>,
    default_url: Option<String>,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
            default_url: config.default_url.clone(),
        })
    }

    /// Resolve the URL for a channel. The default URL is shared, so the
    /// payload is tagged with the channel it is meant for.
    fn target(
        &self,
        channel_target: &str,
        payload: &serde_json::Value,
    ) -> Option<(String, serde_json::Value)> {
        if let Some(url) = self.endpoints.get(channel_target) {
            return Some((url.clone(), payload.clone()));
        }

        let url = self.default_url.as_ref()?;
        let mut body = payload.clone();
        if let Some(object) = body.as_object_mut() {
            object
                .entry("channel")
                .or_insert_with(|| serde_json::Value::String(channel_target.to_string()));
        }
        Some((url.clone(), body))
    }
}

#[async_trait]
impl ChannelClient for WebhookClient {
    async fn send(&self, channel_target: &str, payload: &serde_json::Value) -> DeliveryResult {
        let Some((url, body)) = self.target(channel_target, payload) else {
            return DeliveryResult::PermanentError(format!(
                "no webhook configured for channel '{}'",
                channel_target
            ));
        };

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return DeliveryResult::PermanentError(format!("invalid webhook request: {}", e));
            }
            Err(e) => return DeliveryResult::TransientError(format!("request failed: {}", e)),
        };

        let status = response.status();
        if status.is_success() {
            return DeliveryResult::Success;
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        classify(status, retry_after, &body)
    }
}

/// Map a non-2xx response to a delivery result.
fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> DeliveryResult {
    let message = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        format!("HTTP {}: {}", status.as_u16(), excerpt)
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => DeliveryResult::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => DeliveryResult::TransientError(message),
        s if s.is_server_error() => DeliveryResult::TransientError(message),
        _ => DeliveryResult::PermanentError(message),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn client_for(server: &MockServer) -> WebhookClient {
        let config = WebhookConfig {
            endpoints: HashMap::from([("ops".to_string(), format!("{}/ops", server.uri()))]),
            default_url: Some(format!("{}/default", server.uri())),
        };
        WebhookClient::new(&config, Duration::from_secs(5)).unwrap()
    }

    async fn respond(status: u16) -> (MockServer, WebhookClient) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ops"))
            .respond_with(ResponseTemplate::new(status).set_body_string("upstream says no"))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        (server, client)
    }

    #[tokio::test]
    async fn test_success() {
        let (_server, client) = respond(200).await;
        let result = client.send("ops", &serde_json::json!({"text": "hi"})).await;
        assert_eq!(result, DeliveryResult::Success);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (_server, client) = respond(503).await;
        let result = client.send("ops", &serde_json::json!({"text": "hi"})).await;
        assert_eq!(
            result,
            DeliveryResult::TransientError("HTTP 503: upstream says no".into())
        );
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let (_server, client) = respond(404).await;
        let result = client.send("ops", &serde_json::json!({"text": "hi"})).await;
        assert!(matches!(result, DeliveryResult::PermanentError(_)));
    }

    #[tokio::test]
    async fn test_request_timeout_is_transient() {
        let (_server, client) = respond(408).await;
        let result = client.send("ops", &serde_json::json!({"text": "hi"})).await;
        assert!(matches!(result, DeliveryResult::TransientError(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;
        let client = client_for(&server).await;

        let result = client.send("ops", &serde_json::json!({"text": "hi"})).await;
        assert_eq!(
            result,
            DeliveryResult::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[tokio::test]
    async fn test_default_url_tags_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/default"))
            .and(body_json(serde_json::json!({"text": "hi", "channel": "#updates"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server).await;

        let result = client
            .send("#updates", &serde_json::json!({"text": "hi"}))
            .await;
        assert_eq!(result, DeliveryResult::Success);
    }

    #[tokio::test]
    async fn test_unknown_channel_without_default_is_permanent() {
        let client = WebhookClient::new(&WebhookConfig::default(), Duration::from_secs(5)).unwrap();
        let result = client.send("nowhere", &serde_json::json!({})).await;
        assert!(matches!(result, DeliveryResult::PermanentError(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let config = WebhookConfig {
            endpoints: HashMap::from([("ops".to_string(), "http://127.0.0.1:9/hook".to_string())]),
            default_url: None,
        };
        let client = WebhookClient::new(&config, Duration::from_secs(2)).unwrap();
        let result = client.send("ops", &serde_json::json!({})).await;
        assert!(matches!(result, DeliveryResult::TransientError(_)));
    }
}
