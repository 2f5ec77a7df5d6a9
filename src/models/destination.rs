use async_trait::async_trait;
use serde_json::Value;

use super::bitrix::{FileRef, TaskFields};
use super::freshdesk::Attachment;
use crate::error::DeliveryError;

/// Trait defining what the relay needs from the system tasks are created in.
///
/// Each method performs exactly one attempt; retrying is the caller's job.
#[async_trait]
pub trait TaskDestination: Send + Sync {
    /// Get the name of the destination system
    fn name(&self) -> &'static str;

    /// Create a task, returning the destination's response body
    async fn create_task(&self, fields: &TaskFields) -> Result<Value, DeliveryError>;

    /// Fetch an attachment from its source and store it in `folder_id`
    async fn upload_attachment(
        &self,
        folder_id: u64,
        attachment: &Attachment,
    ) -> Result<FileRef, DeliveryError>;

    async fn notify(&self, user_id: u64, message: &str) -> Result<(), DeliveryError>;
}
