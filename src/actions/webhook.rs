//! Spreadsheet webhook sync
//!
//! Best-effort: rows are posted as `text/plain` JSON, the response body is
//! never read and failures are only logged.

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::Value;

use super::ActionEvent;
use crate::Result;

/// Row appended to the spreadsheet for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetRow {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub details: Value,
    /// ISO 8601 time of the sync
    pub timestamp: String,
}

impl SheetRow {
    /// Build the row for `event`, stamped with the current time
    #[must_use]
    pub fn from_event(event: &ActionEvent) -> Self {
        Self {
            kind: event.kind.as_str().to_string(),
            title: event.title.clone(),
            details: event.details.clone(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Posts action rows to a spreadsheet web app
#[derive(Debug, Clone)]
pub struct SheetWebhook {
    client: reqwest::Client,
    url: Option<String>,
}

impl SheetWebhook {
    /// Create a webhook; `None` makes every post a no-op
    #[must_use]
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Whether a URL is configured
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// Post a row and wait for the request to complete
    ///
    /// Returns `Ok(false)` without sending when no URL is configured.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent
    pub async fn send(&self, row: &SheetRow) -> Result<bool> {
        let Some(url) = &self.url else {
            return Ok(false);
        };

        let body = serde_json::to_string(row)?;
        self.client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;

        Ok(true)
    }

    /// Fire-and-forget sync of `event`
    pub fn post(&self, event: &ActionEvent) {
        if !self.is_configured() {
            tracing::debug!(id = %event.id, "sheet webhook not configured, skipping sync");
            return;
        }

        let row = SheetRow::from_event(event);
        let webhook = self.clone();
        let id = event.id;
        drop(tokio::spawn(async move {
            match webhook.send(&row).await {
                Ok(_) => tracing::debug!(%id, "sheet sync request sent"),
                Err(e) => tracing::warn!(%id, error = %e, "sheet sync failed"),
            }
        }));
    }
}
