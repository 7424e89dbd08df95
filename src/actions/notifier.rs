//! Drives logged actions from `pending` to a terminal status

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use super::{ActionEvent, ActionLog, ActionStatus, EmailDraft, SheetWebhook};
use crate::Result;
use crate::config::NotificationConfig;

/// Capacity of the status broadcast channel
const UPDATE_CAPACITY: usize = 64;

/// Delivers drafted emails
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send `draft`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Notification`] if delivery fails
    async fn send(&self, draft: &EmailDraft) -> Result<()>;
}

/// Mailer that records drafts in the log instead of sending them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, draft: &EmailDraft) -> Result<()> {
        tracing::info!(
            recipient = %draft.recipient,
            subject = %draft.subject,
            body = %draft.body,
            "email queued"
        );
        Ok(())
    }
}

/// Status change broadcast to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub id: Uuid,
    pub status: ActionStatus,
}

/// Consumes action events and walks them through delivery
pub struct Notifier {
    log: Arc<RwLock<ActionLog>>,
    mailer: Arc<dyn Mailer>,
    webhook: SheetWebhook,
    delay: Duration,
    updates: broadcast::Sender<StatusUpdate>,
}

impl Notifier {
    /// Create a notifier using [`LogMailer`]
    #[must_use]
    pub fn new(config: &NotificationConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            log: Arc::new(RwLock::new(ActionLog::new())),
            mailer: Arc::new(LogMailer),
            webhook: SheetWebhook::new(config.webhook_url.clone()),
            delay: config.processing_delay,
            updates,
        }
    }

    /// Replace the mailer
    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    /// Shared handle to the action log
    #[must_use]
    pub fn log(&self) -> Arc<RwLock<ActionLog>> {
        Arc::clone(&self.log)
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    /// Record a new event and start processing everything pending
    pub async fn intake(&self, event: ActionEvent) {
        let id = event.id;
        if self.log.write().await.insert(event) {
            self.announce(id, ActionStatus::Pending);
        }
        self.process_pending().await;
    }

    /// Start delivery of every pending entry exactly once
    pub async fn process_pending(&self) {
        let batch = self.log.write().await.take_pending();

        for event in batch {
            self.announce(event.id, ActionStatus::Sending);

            let delivered = match &event.email_draft {
                Some(draft) => match self.mailer.send(draft).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(id = %event.id, error = %e, "email delivery failed");
                        false
                    }
                },
                None => true,
            };

            self.webhook.post(&event);

            let log = Arc::clone(&self.log);
            let updates = self.updates.clone();
            let delay = self.delay;
            let id = event.id;
            drop(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let status = if delivered {
                    ActionStatus::Success
                } else {
                    ActionStatus::Error
                };
                match log.write().await.advance(&id, status) {
                    Ok(_) => {
                        tracing::info!(%id, %status, "action processed");
                        let _ = updates.send(StatusUpdate { id, status });
                    }
                    Err(e) => tracing::warn!(%id, error = %e, "failed to finish action"),
                }
            }));
        }
    }

    /// Process events until the sender side closes
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ActionEvent>) {
        while let Some(event) = events.recv().await {
            self.intake(event).await;
        }
        tracing::debug!("action channel closed, notifier stopping");
    }

    fn announce(&self, id: Uuid, status: ActionStatus) {
        tracing::debug!(%id, %status, "action status");
        // no subscribers is fine
        let _ = self.updates.send(StatusUpdate { id, status });
    }
}
