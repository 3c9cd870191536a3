//! Notification sinks: webhook delivery and a log-only fallback.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{bail, Context, Result};
use argus_core::ChangeEvent;
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// Delivery seam for classified change events. Implementations must be
/// cheap to share across sessions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, event: &ChangeEvent) -> Result<()>;
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    cluster: &'a str,
    #[serde(flatten)]
    event: &'a ChangeEvent,
}

/// POSTs each event as JSON to a single endpoint. Non-2xx responses count
/// as delivery failures.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    cluster: String,
}

impl WebhookNotifier {
    pub fn new(url: String, cluster: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook http client")?;
        Ok(Self {
            client,
            url,
            cluster,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, event: &ChangeEvent) -> Result<()> {
        let payload = WebhookPayload {
            cluster: &self.cluster,
            event,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("posting webhook")?;
        if !resp.status().is_success() {
            bail!("webhook endpoint returned {}", resp.status());
        }
        Ok(())
    }
}

/// Writes events to the log stream. Used when no webhook is configured so
/// the engine always has a sink.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, event: &ChangeEvent) -> Result<()> {
        info!(
            event = %event.event_type,
            kind = %event.kind,
            ns = %event.namespace,
            name = %event.name,
            actor = %event.actor,
            rv = %event.resource_version,
            "resource change"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::EventType;
    use chrono::TimeZone;

    #[test]
    fn webhook_payload_uses_wire_field_names() {
        let event = ChangeEvent {
            event_type: EventType::Modified,
            kind: "Deployment".into(),
            namespace: "prod".into(),
            name: "web".into(),
            actor: "kubectl".into(),
            observed_at: chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            resource_version: "3141".into(),
        };
        let payload = WebhookPayload {
            cluster: "staging",
            event: &event,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["cluster"], "staging");
        assert_eq!(json["type"], "MODIFIED");
        assert_eq!(json["resourceVersion"], "3141");
        assert!(json["observedAt"].is_string());
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let event = ChangeEvent {
            event_type: EventType::Deleted,
            kind: "ConfigMap".into(),
            namespace: "default".into(),
            name: "settings".into(),
            actor: "unknown".into(),
            observed_at: chrono::Utc::now(),
            resource_version: "9".into(),
        };
        assert!(LogNotifier.deliver(&event).await.is_ok());
    }
}
