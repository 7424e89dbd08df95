//! Side-effect actions raised by the model's tool calls
//!
//! A [`ToolInvocation`] becomes at most one [`ActionEvent`] (a booking or a
//! support ticket with a drafted email) and exactly one tool result. Events
//! then move through `pending -> sending -> success | error` in the
//! [`ActionLog`], driven by the [`Notifier`].

mod notifier;
mod webhook;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::live::{BOOK_APPOINTMENT_TOOL, FunctionResponse, LOG_TICKET_TOOL, ToolInvocation};
use crate::{Error, Result};

pub use notifier::{LogMailer, Mailer, Notifier, StatusUpdate};
pub use webhook::{SheetRow, SheetWebhook};

/// Result text for invocations that produced no action
pub const ACTION_FAILED: &str = "Action failed";

/// Placeholder for optional fields the model left out
const NOT_PROVIDED: &str = "N/A";

/// Kind of action shown in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Booking,
    Ticket,
    Info,
    Error,
}

impl ActionKind {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Booking => "booking",
            Self::Ticket => "ticket",
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

/// Delivery status of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Sending,
    Success,
    Error,
}

impl ActionStatus {
    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sending) | (Self::Sending, Self::Success | Self::Error)
        )
    }

    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Success => "success",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Email prepared for the support inbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// A user-visible record of a side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Tool arguments as received
    pub details: Value,
    #[serde(rename = "emailDraft", skip_serializing_if = "Option::is_none")]
    pub email_draft: Option<EmailDraft>,
    pub status: ActionStatus,
}

#[derive(Debug, Deserialize)]
struct BookingArgs {
    name: String,
    phone: String,
    company: Option<String>,
    interest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TicketArgs {
    client_name: String,
    phone_number: String,
    issue_description: String,
    urgency: Option<String>,
}

fn or_na(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or(NOT_PROVIDED)
}

/// Outcome of handling one tool invocation
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Action to log, if the invocation was understood
    pub event: Option<ActionEvent>,
    /// Reply for the model, keyed by the invocation's call id
    pub response: FunctionResponse,
}

/// Turn a tool invocation into an action and its tool result
///
/// Unknown tools and arguments missing required fields produce no action
/// and an [`ACTION_FAILED`] result.
#[must_use]
pub fn dispatch(invocation: &ToolInvocation, support_email: &str) -> Dispatched {
    let built = match invocation.name.as_str() {
        BOOK_APPOINTMENT_TOOL => booking(invocation, support_email),
        LOG_TICKET_TOOL => ticket(invocation, support_email),
        other => Err(Error::InvalidState(format!("unknown tool: {other}"))),
    };

    match built {
        Ok((event, result)) => {
            tracing::info!(
                tool = %invocation.name,
                call_id = %invocation.call_id,
                action_id = %event.id,
                "tool call produced action"
            );
            Dispatched {
                event: Some(event),
                response: FunctionResponse::new(invocation, result),
            }
        }
        Err(e) => {
            tracing::warn!(
                tool = %invocation.name,
                call_id = %invocation.call_id,
                error = %e,
                "tool call rejected"
            );
            Dispatched {
                event: None,
                response: FunctionResponse::new(invocation, ACTION_FAILED),
            }
        }
    }
}

fn booking(invocation: &ToolInvocation, support_email: &str) -> Result<(ActionEvent, &'static str)> {
    let args: BookingArgs = serde_json::from_value(invocation.arguments.clone())?;
    let body = format!(
        "Customer: {}\nCompany: {}\nPhone: {}\nInterest: {}\n\nGenerated by Riyadah AI Assistant.",
        args.name,
        or_na(args.company.as_deref()),
        args.phone,
        or_na(args.interest.as_deref()),
    );

    let event = ActionEvent {
        id: Uuid::new_v4(),
        kind: ActionKind::Booking,
        title: "Appointment Scheduled".to_string(),
        message: format!("Appointment created for {}. Processing...", args.name),
        timestamp: Utc::now(),
        details: invocation.arguments.clone(),
        email_draft: Some(EmailDraft {
            recipient: support_email.to_string(),
            subject: format!("New Appointment Request: {}", args.name),
            body,
        }),
        status: ActionStatus::Pending,
    };
    Ok((event, "Success. Appointment logged and processing."))
}

fn ticket(invocation: &ToolInvocation, support_email: &str) -> Result<(ActionEvent, &'static str)> {
    let args: TicketArgs = serde_json::from_value(invocation.arguments.clone())?;
    let urgency = or_na(args.urgency.as_deref());
    let body = format!(
        "Client: {}\nPhone: {}\nUrgency: {}\nIssue: {}\n\nGenerated by Riyadah AI Assistant.",
        args.client_name, args.phone_number, urgency, args.issue_description,
    );

    let event = ActionEvent {
        id: Uuid::new_v4(),
        kind: ActionKind::Ticket,
        title: "Support Ticket Logged".to_string(),
        message: format!("Ticket created for {}. Processing...", args.client_name),
        timestamp: Utc::now(),
        details: invocation.arguments.clone(),
        email_draft: Some(EmailDraft {
            recipient: support_email.to_string(),
            subject: format!("Support Ticket [{urgency}]: {}", args.client_name),
            body,
        }),
        status: ActionStatus::Pending,
    };
    Ok((event, "Success. Ticket logged and processing."))
}

/// Insertion-ordered action log with guarded status transitions
#[derive(Debug, Default)]
pub struct ActionLog {
    entries: IndexMap<Uuid, ActionEvent>,
}

impl ActionLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event; an event with an existing id is ignored
    pub fn insert(&mut self, event: ActionEvent) -> bool {
        if self.entries.contains_key(&event.id) {
            tracing::debug!(id = %event.id, "duplicate action ignored");
            return false;
        }
        self.entries.insert(event.id, event);
        true
    }

    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<&ActionEvent> {
        self.entries.get(id)
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &ActionEvent> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move an entry to `to`
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionNotFound`] for an unknown id and
    /// [`Error::InvalidTransition`] if the move is not allowed
    pub fn advance(&mut self, id: &Uuid, to: ActionStatus) -> Result<&ActionEvent> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::ActionNotFound(id.to_string()))?;

        if !entry.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: entry.status,
                to,
            });
        }

        entry.status = to;
        Ok(entry)
    }

    /// Move every pending entry to sending and return them
    ///
    /// Each entry is returned at most once over the log's lifetime.
    pub fn take_pending(&mut self) -> Vec<ActionEvent> {
        self.entries
            .values_mut()
            .filter(|e| e.status == ActionStatus::Pending)
            .map(|e| {
                e.status = ActionStatus::Sending;
                e.clone()
            })
            .collect()
    }
}
