//! The per-request pipeline: normalize, format, deliver.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::error::{DeliveryError, RelayError};
use crate::formatter::{self, TaskDraft};
use crate::models::{
    bitrix::{self, FileRef, TaskFields},
    destination::TaskDestination,
    freshdesk::{self, TicketRecord},
};

/// Body of a successful relay response.
#[derive(Debug, Serialize)]
pub struct RelayOutcome {
    pub ok: bool,
    /// Destination response to the task creation, passed through untouched
    pub result: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uploaded_files: Vec<FileRef>,
    /// Follow-on steps that failed after or around a successful task creation
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct Relay {
    config: RelayConfig,
    destination: Arc<dyn TaskDestination>,
}

impl Relay {
    pub fn new(config: RelayConfig, destination: Arc<dyn TaskDestination>) -> Self {
        Self {
            config,
            destination,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Relays one webhook body. `now` anchors the task deadline.
    pub async fn handle(&self, body: Value, now: DateTime<Utc>) -> Result<RelayOutcome, RelayError> {
        let payload = freshdesk::unwrap_envelope(body);
        let ticket = freshdesk::normalize(&payload)?;
        tracing::Span::current().record("ticket_id", ticket.ticket_id.as_str());
        info!("relaying ticket to {}", self.destination.name());

        let draft = TaskDraft::render(&ticket, self.config.deadline_days, now)?;

        let mut warnings = Vec::new();
        let files = self.upload_attachments(&ticket, &mut warnings).await;
        let fields = self.task_fields(&ticket, draft, files.clone());

        let destination = self.destination.as_ref();
        let fields = &fields;
        let result = deliver_with_retry(
            self.config.max_attempts,
            self.config.retry_delay,
            move |_attempt| destination.create_task(fields),
        )
        .await?;

        let task_id = bitrix::created_task_id(&result);
        info!(task_id = task_id.as_deref().unwrap_or("unknown"), "task created");

        if let Some(user_id) = self.config.notify_user_id {
            let message = formatter::notification_message(&ticket, task_id.as_deref());
            if let Err(e) = self.destination.notify(user_id, &message).await {
                warn!(error = %e, user_id, "task created but notification failed");
                warnings.push(format!("notification to user {user_id} failed: {e}"));
            }
        }

        Ok(RelayOutcome {
            ok: true,
            result,
            uploaded_files: files,
            warnings,
        })
    }

    /// One upload at a time; a failed upload is skipped and reported as a warning.
    async fn upload_attachments(
        &self,
        ticket: &TicketRecord,
        warnings: &mut Vec<String>,
    ) -> Vec<FileRef> {
        let Some(folder_id) = self.config.upload_folder_id else {
            return Vec::new();
        };

        let mut files = Vec::with_capacity(ticket.attachments.len());
        for attachment in &ticket.attachments {
            match self.destination.upload_attachment(folder_id, attachment).await {
                Ok(file) => files.push(file),
                Err(e) => {
                    warn!(error = %e, attachment = %attachment.name, "skipping attachment");
                    warnings.push(format!(
                        "attachment '{}' was not uploaded: {e}",
                        attachment.name
                    ));
                }
            }
        }
        files
    }

    fn task_fields(&self, ticket: &TicketRecord, draft: TaskDraft, files: Vec<FileRef>) -> TaskFields {
        TaskFields {
            title: draft.title,
            description: draft.description,
            responsible_id: self.config.responsible_id,
            accomplices: self.config.accomplices.clone(),
            auditors: self.config.auditors.clone(),
            deadline: draft.deadline,
            priority: bitrix::convert_freshdesk_priority(
                ticket.priority.as_deref(),
                self.config.default_priority,
            ),
            status: self.config.task_status,
            files,
        }
    }
}

/// Calls `call` until it succeeds or `max_attempts` calls have failed.
///
/// Every failure is logged with its attempt number; only the last one is
/// returned. `delay` is awaited between attempts.
pub async fn deliver_with_retry<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut call: F,
) -> Result<T, RelayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DeliveryError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "delivery succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts => {
                warn!(attempt, max_attempts, error = %e, "delivery attempt failed, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => {
                error!(attempt, max_attempts, error = %e, "delivery attempt failed, giving up");
                return Err(RelayError::Upstream {
                    attempts: attempt,
                    source: e,
                });
            }
        }
    }
}
