//! Incident reporting for unexpected failures.
//!
//! Reporting is fire-and-forget: `report` returns immediately and a failing
//! sink is only logged, never surfaced to the session that raised it.

use crate::config::MonitorSection;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Receives structured incident reports.
pub trait FailureReporter: Send + Sync {
    fn report(&self, summary: &str, detail: &str);
}

/// Writes incidents to the log only.
pub struct LogReporter;

impl FailureReporter for LogReporter {
    fn report(&self, summary: &str, detail: &str) {
        error!(summary = %summary, detail = %detail, "incident");
    }
}

/// Posts incidents to a chat-style incoming webhook (`{"text": ...}`).
pub struct WebhookReporter {
    url: String,
    source: String,
    http_client: reqwest::Client,
}

impl WebhookReporter {
    pub fn new(url: &str, source: &str) -> Self {
        Self {
            url: url.to_string(),
            source: source.to_string(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn message(&self, summary: &str, detail: &str) -> serde_json::Value {
        json!({
            "text": format!("{} incident: {}\n{}", self.source, summary, detail),
        })
    }
}

impl FailureReporter for WebhookReporter {
    fn report(&self, summary: &str, detail: &str) {
        error!(summary = %summary, detail = %detail, "incident");

        let body = self.message(summary, detail);
        let request = self.http_client.post(&self.url).json(&body);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available, incident not posted");
            return;
        };
        runtime.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => debug!("incident posted"),
                Ok(resp) => warn!(status = %resp.status(), "incident webhook rejected report"),
                Err(e) => warn!(error = %e, "incident webhook unreachable"),
            }
        });
    }
}

/// Build the configured reporter.
pub fn build_reporter(config: &MonitorSection) -> Arc<dyn FailureReporter> {
    match config.webhook_url.as_deref() {
        Some(url) if !url.is_empty() => Arc::new(WebhookReporter::new(url, &config.source)),
        _ => Arc::new(LogReporter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_message_format() {
        let reporter = WebhookReporter::new("http://127.0.0.1:9/hook", "zone-relay");
        let msg = reporter.message("upstream unavailable", "connect failed: refused");
        assert_eq!(
            msg["text"],
            "zone-relay incident: upstream unavailable\nconnect failed: refused"
        );
    }

    #[tokio::test]
    async fn unreachable_webhook_does_not_block_or_panic() {
        let reporter = WebhookReporter::new("http://127.0.0.1:9/hook", "zone-relay");
        let started = std::time::Instant::now();
        reporter.report("summary", "detail");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn report_outside_runtime_is_dropped() {
        let reporter = WebhookReporter::new("http://127.0.0.1:9/hook", "zone-relay");
        reporter.report("summary", "detail");
    }

    #[test]
    fn picks_reporter_from_config() {
        // Both variants must be constructible from config alone.
        let _ = build_reporter(&MonitorSection::default());
        let _ = build_reporter(&MonitorSection {
            webhook_url: Some("https://hooks.example.com/x".into()),
            source: "zone-relay".into(),
        });
    }
}
