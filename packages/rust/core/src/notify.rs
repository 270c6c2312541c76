//! Best-effort job notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use adaptcrawl_shared::{AdaptError, JobSummary, Notifier, NotifyConfig, Result};

/// Writes the summary to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &JobSummary) -> Result<()> {
        info!(
            job_id = %summary.job_id,
            name = %summary.name,
            phase = %summary.phase,
            new_items = summary.new_items,
            accepted = summary.accepted,
            errors = summary.error_count,
            "job finished with new items"
        );
        Ok(())
    }
}

/// POSTs the summary as JSON to a webhook.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdaptError::config(format!("failed to build webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, summary: &JobSummary) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(summary)
            .send()
            .await
            .map_err(|e| AdaptError::transient(&self.url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdaptError::permanent(
                &self.url,
                Some(status.as_u16()),
                "webhook rejected notification",
            ));
        }
        debug!(url = %self.url, "webhook notified");
        Ok(())
    }
}

/// The configured notifier: webhook when a URL is set, log otherwise.
pub fn notifier_from_config(config: &NotifyConfig, timeout: Duration) -> Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url.clone(), timeout)?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptcrawl_shared::{JobId, JobPhase, JobState};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn summary() -> JobSummary {
        let mut state = JobState::new(JobId::new(), "site-a", "site-a.example/list", 10);
        state.phase = JobPhase::Done;
        state.new_item_count = 3;
        state.summary()
    }

    #[tokio::test]
    async fn webhook_posts_summary_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({ "name": "site-a", "new_items": 3 })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/hook", server.uri()), Duration::from_secs(5)).unwrap();
        notifier.notify(&summary()).await.expect("delivered");
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = notifier.notify(&summary()).await.unwrap_err();
        assert!(matches!(err, AdaptError::PermanentFetch { status: Some(500), .. }));
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        assert!(LogNotifier.notify(&summary()).await.is_ok());
    }

    #[test]
    fn config_selects_notifier() {
        let none = NotifyConfig { webhook_url: None };
        assert!(notifier_from_config(&none, Duration::from_secs(1)).is_ok());
        let hook = NotifyConfig {
            webhook_url: Some("https://hooks.example/x".into()),
        };
        assert!(notifier_from_config(&hook, Duration::from_secs(1)).is_ok());
    }
}
