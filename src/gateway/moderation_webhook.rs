use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;

use super::config::ModerationConfig;
use super::moderation::ModerationDetails;
use super::observability::AdmissionCounters;
use super::redaction::ReportRedactor;
use super::tasks::TaskPool;

/// Body POSTed to the operator webhook when a prompt is blocked.
#[derive(Clone, Debug, Serialize)]
pub struct ViolationReport {
    pub timestamp: String,
    pub username: String,
    pub user_id: i64,
    pub group: String,
    pub model: String,
    pub categories: Vec<String>,
    pub last_user_message: String,
    pub messages: Value,
    pub request_body: String,
    pub request: Value,
    pub combined_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ViolationReport {
    pub fn new(details: &ModerationDetails, categories: &[String], at: OffsetDateTime) -> Self {
        Self {
            timestamp: at.format(&Rfc3339).unwrap_or_default(),
            username: details.username.clone(),
            user_id: details.user_id,
            group: details.group.clone(),
            model: details.model.clone(),
            categories: categories.to_vec(),
            last_user_message: details.last_user_message.clone(),
            messages: details.messages.clone(),
            request_body: details.request_body.clone(),
            request: details.request_dump.clone(),
            combined_text: details.combined_text.clone(),
            request_id: (!details.request_id.is_empty()).then(|| details.request_id.clone()),
        }
    }
}

/// Delivers violation reports in the background. Delivery never blocks or
/// changes the verdict already returned to the client.
#[derive(Clone, Debug)]
pub struct ModerationWebhook {
    http: reqwest::Client,
    url: Option<String>,
    timeout: Duration,
    redactor: Arc<ReportRedactor>,
    tasks: TaskPool,
    counters: Arc<AdmissionCounters>,
}

impl ModerationWebhook {
    pub fn new(
        http: reqwest::Client,
        config: &ModerationConfig,
        redactor: Arc<ReportRedactor>,
        tasks: TaskPool,
        counters: Arc<AdmissionCounters>,
    ) -> Self {
        let url = config
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        Self {
            http,
            url,
            timeout: Duration::from_secs(config.webhook_timeout_secs.max(1)),
            redactor,
            tasks,
            counters,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Returns `None` when no webhook is configured or the report could not
    /// be serialized.
    pub fn report(
        &self,
        details: &ModerationDetails,
        categories: &[String],
    ) -> Option<JoinHandle<()>> {
        let url = self.url.clone()?;
        let report = ViolationReport::new(details, categories, OffsetDateTime::now_utc());
        let payload = match serde_json::to_value(&report) {
            Ok(payload) => self.redactor.redact(payload),
            Err(err) => {
                tracing::error!(
                    request_id = %details.request_id,
                    error = %err,
                    "failed to serialize moderation webhook payload"
                );
                return None;
            }
        };

        let http = self.http.clone();
        let timeout = self.timeout;
        let counters = self.counters.clone();
        let request_id = details.request_id.clone();
        Some(self.tasks.submit("moderation_webhook", async move {
            let result = http
                .post(&url)
                .timeout(timeout)
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(response) if response.status().as_u16() >= 400 => {
                    counters.record_webhook_failed();
                    tracing::warn!(
                        request_id = %request_id,
                        status = response.status().as_u16(),
                        "moderation webhook returned error status"
                    );
                }
                Ok(_) => counters.record_webhook_delivered(),
                Err(err) => {
                    counters.record_webhook_failed();
                    tracing::error!(
                        request_id = %request_id,
                        error = %err,
                        "moderation webhook request failed"
                    );
                }
            }
        }))
    }
}
