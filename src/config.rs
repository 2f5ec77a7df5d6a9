use anyhow::{Result, bail};
use std::time::Duration;

use crate::models::bitrix::{TaskPriority, TaskStatus};

/// Ten years; anything further out is a misconfiguration.
pub const MAX_DEADLINE_DAYS: i64 = 3650;

/// Everything the relay needs to know about its destination, resolved once
/// at startup and handed to [`crate::relay::Relay`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bitrix24 inbound webhook base, e.g. `https://acme.bitrix24.com/rest/13/<token>`
    pub bitrix_url: String,
    pub responsible_id: u64,
    pub accomplices: Vec<u64>,
    pub auditors: Vec<u64>,
    /// Days added to "now" to compute the task deadline
    pub deadline_days: i64,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub task_status: TaskStatus,
    /// Used when the ticket carries no recognizable priority
    pub default_priority: TaskPriority,
    /// Attachments are uploaded to this Bitrix24 Drive folder when set
    pub upload_folder_id: Option<u64>,
    /// A system notification goes to this user after each created task when set
    pub notify_user_id: Option<u64>,
    /// Expected value of the `X-Shared-Secret` header
    pub shared_secret: Option<String>,
}

impl RelayConfig {
    pub fn new(bitrix_url: impl Into<String>, responsible_id: u64) -> Self {
        Self {
            bitrix_url: bitrix_url.into(),
            responsible_id,
            accomplices: Vec::new(),
            auditors: Vec::new(),
            deadline_days: 3,
            max_attempts: 3,
            retry_delay: Duration::ZERO,
            timeout: Duration::from_secs(15),
            task_status: TaskStatus::Pending,
            default_priority: TaskPriority::Normal,
            upload_folder_id: None,
            notify_user_id: None,
            shared_secret: None,
        }
    }

    pub fn validate(self) -> Result<Self> {
        if self.bitrix_url.trim().is_empty() {
            bail!("BITRIX_WEBHOOK_URL must not be empty");
        }
        if !self.bitrix_url.starts_with("http://") && !self.bitrix_url.starts_with("https://") {
            bail!("BITRIX_WEBHOOK_URL must be an http(s) URL, got {}", self.bitrix_url);
        }
        if self.max_attempts == 0 {
            bail!("MAX_RETRIES must be at least 1");
        }
        if !(0..=MAX_DEADLINE_DAYS).contains(&self.deadline_days) {
            bail!(
                "DEADLINE_DAYS must be between 0 and {MAX_DEADLINE_DAYS}, got {}",
                self.deadline_days
            );
        }
        if self.timeout.is_zero() {
            bail!("HTTP_TIMEOUT_SECS must be at least 1");
        }
        if self.shared_secret.as_deref().is_some_and(str::is_empty) {
            bail!("SHARED_SECRET is set but empty");
        }
        Ok(self)
    }
}
