//! Renders a [`TicketRecord`] into the strings a Bitrix24 task is made of.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use crate::error::RelayError;
use crate::models::freshdesk::TicketRecord;

pub const SOURCE_SYSTEM: &str = "Freshdesk";
/// Bitrix24 rejects longer task titles.
pub const TITLE_MAX_CHARS: usize = 255;

pub const NOT_INFORMED: &str = "Not informed";
pub const NONE: &str = "None";
pub const NO_DESCRIPTION: &str = "No description";
pub const UNTITLED: &str = "Untitled ticket";

#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    pub deadline: String,
}

impl TaskDraft {
    pub fn render(
        ticket: &TicketRecord,
        deadline_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, RelayError> {
        let due = deadline(now, deadline_days).ok_or_else(|| {
            RelayError::Internal(format!("deadline offset of {deadline_days} days is out of range"))
        })?;
        Ok(Self {
            title: title(ticket),
            description: description(ticket),
            deadline: format_deadline(due),
        })
    }
}

pub fn title(ticket: &TicketRecord) -> String {
    let subject = ticket.subject.as_deref().unwrap_or(UNTITLED);
    format!("{SOURCE_SYSTEM} #{} – {subject}", ticket.ticket_id)
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect()
}

/// `None` when the offset does not fit a calendar date.
pub fn deadline(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_days(days).and_then(|offset| now.checked_add_signed(offset))
}

/// `2026-10-22T14:00:00.000Z`
pub fn format_deadline(deadline: DateTime<Utc>) -> String {
    deadline.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn description(ticket: &TicketRecord) -> String {
    let or_default = |value: &Option<String>| value.as_deref().unwrap_or(NOT_INFORMED).to_string();

    let tags = if ticket.tags.is_empty() {
        NONE.to_string()
    } else {
        ticket.tags.join(", ")
    };

    let attachments = if ticket.attachments.is_empty() {
        NONE.to_string()
    } else {
        ticket
            .attachments
            .iter()
            .enumerate()
            .map(|(idx, attachment)| format!("{}. {}: {}", idx + 1, attachment.name, attachment.url))
            .collect::<Vec<_>>()
            .join("\n")
    };

    [
        "=== DESCRIPTION ===".to_string(),
        ticket.description.as_deref().unwrap_or(NO_DESCRIPTION).to_string(),
        String::new(),
        "=== TICKET METADATA ===".to_string(),
        format!("Requester: {}", or_default(&ticket.requester_email)),
        format!("Requester name: {}", or_default(&ticket.requester_name)),
        format!("Company: {}", or_default(&ticket.company_name)),
        format!("Status: {}", or_default(&ticket.status)),
        format!("Priority: {}", or_default(&ticket.priority)),
        format!("Tags: {tags}"),
        String::new(),
        "=== ATTACHMENTS ===".to_string(),
        attachments,
        String::new(),
        format!("Origin: {SOURCE_SYSTEM}"),
    ]
    .join("\n")
}

pub fn notification_message(ticket: &TicketRecord, task_id: Option<&str>) -> String {
    let subject = ticket.subject.as_deref().unwrap_or(UNTITLED);
    let mut message = format!(
        "New task created from {SOURCE_SYSTEM} ticket #{}: {subject}",
        ticket.ticket_id
    );
    if let Some(task_id) = task_id {
        message.push_str(&format!(" (task {task_id})"));
    }
    message
}
