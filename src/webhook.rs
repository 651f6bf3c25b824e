//! Webhook rendering and delivery
//!
//! The payload template is arbitrary JSON whose string values may contain
//! `$MSG`; rendering substitutes the message everywhere it appears, then the
//! body is encoded according to the configured payload type.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::form_urlencoded;

use crate::config::{PayloadType, WebhookConfig};
use crate::io::HttpClient;
use crate::notifier::{Notification, Notifier};

/// Webhook-backed notifier.
pub struct WebhookNotifier {
    webhook: WebhookConfig,
    http: Arc<dyn HttpClient>,
}

impl WebhookNotifier {
    pub fn new(webhook: WebhookConfig, http: Arc<dyn HttpClient>) -> Self {
        Self { webhook, http }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> crate::Result<()> {
        deliver(&self.webhook, &notification.message, self.http.as_ref()).await
    }
}

/// Substitute `$MSG` in every string value of the template.
pub fn render(template: &Value, message: &str) -> Value {
    match template {
        Value::String(s) => Value::String(s.replace("$MSG", message)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, message)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, message)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Flatten a top-level JSON object into `k=v&...` form encoding. Non-string
/// values are serialized as JSON.
pub fn form_encode(payload: &Value) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    if let Value::Object(map) = payload {
        for (key, value) in map {
            match value {
                Value::String(s) => serializer.append_pair(key, s),
                other => serializer.append_pair(key, &other.to_string()),
            };
        }
    }
    serializer.finish()
}

/// Deliver one message to the webhook. Non-2xx responses count as failures
/// so the caller can log them; nothing is retried.
pub async fn deliver(
    webhook: &WebhookConfig,
    message: &str,
    http: &dyn HttpClient,
) -> crate::Result<()> {
    let rendered = render(&webhook.payload, message);
    let mut headers: BTreeMap<String, String> = webhook.headers.clone().unwrap_or_default();

    let (url, body) = match webhook.payload_type {
        PayloadType::Json => {
            headers
                .entry("Content-Type".to_string())
                .or_insert_with(|| "application/json".to_string());
            (webhook.url.clone(), Some(rendered.to_string()))
        }
        PayloadType::FormUrlencoded => {
            headers
                .entry("Content-Type".to_string())
                .or_insert_with(|| "application/x-www-form-urlencoded".to_string());
            (webhook.url.clone(), Some(form_encode(&rendered)))
        }
        PayloadType::Param => {
            let query = form_encode(&rendered);
            let separator = if webhook.url.contains('?') { '&' } else { '?' };
            (format!("{}{}{}", webhook.url, separator, query), None)
        }
    };

    let response = http
        .request(
            &webhook.method,
            &url,
            &headers,
            body,
            Duration::from_millis(webhook.timeout_ms),
        )
        .await?;

    if response.status >= 400 {
        return Err(crate::LookoutError::Notifier(format!(
            "Webhook returned status {}: {}",
            response.status, response.body
        )));
    }
    Ok(())
}
