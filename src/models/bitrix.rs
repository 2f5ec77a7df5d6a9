use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;

/// Bitrix24 task priority as sent in `PRIORITY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl TryFrom<u8> for TaskPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskPriority::Low),
            1 => Ok(TaskPriority::Normal),
            2 => Ok(TaskPriority::High),
            other => Err(format!("unknown Bitrix24 task priority {other}")),
        }
    }
}

/// Bitrix24 task status as sent in `STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum TaskStatus {
    New = 1,
    Pending = 2,
    InProgress = 3,
    SupposedlyCompleted = 4,
    Completed = 5,
    Deferred = 6,
    Declined = 7,
}

impl TryFrom<u8> for TaskStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TaskStatus::New),
            2 => Ok(TaskStatus::Pending),
            3 => Ok(TaskStatus::InProgress),
            4 => Ok(TaskStatus::SupposedlyCompleted),
            5 => Ok(TaskStatus::Completed),
            6 => Ok(TaskStatus::Deferred),
            7 => Ok(TaskStatus::Declined),
            other => Err(format!("unknown Bitrix24 task status {other}")),
        }
    }
}

/// Maps a Freshdesk priority (numeric code or its label) onto Bitrix24.
pub fn convert_freshdesk_priority(priority: Option<&str>, fallback: TaskPriority) -> TaskPriority {
    let Some(priority) = priority else {
        return fallback;
    };
    match priority.trim().to_lowercase().as_str() {
        "1" | "low" => TaskPriority::Low,
        "2" | "medium" => TaskPriority::Normal,
        "3" | "high" | "4" | "urgent" => TaskPriority::High,
        _ => fallback,
    }
}

/// Reference to a Bitrix24 Drive file as accepted by `UF_TASK_WEBDAV_FILES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FileRef(String);

impl FileRef {
    pub fn disk_file(id: u64) -> Self {
        Self(format!("n{id}"))
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize)]
pub struct TaskAddRequest<'a> {
    pub fields: &'a TaskFields,
}

/// The `fields` map of `tasks.task.add`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TaskFields {
    pub title: String,
    pub description: String,
    pub responsible_id: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accomplices: Vec<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auditors: Vec<u64>,
    /// ISO-8601 UTC instant
    pub deadline: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(rename = "UF_TASK_WEBDAV_FILES", skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
}

#[derive(Debug, Serialize)]
pub struct NotifyRequest<'a> {
    #[serde(rename = "USER_ID")]
    pub user_id: u64,
    #[serde(rename = "MESSAGE")]
    pub message: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct UploadFileResponse {
    pub result: UploadedFile,
}

#[derive(Debug, Deserialize)]
pub struct UploadedFile {
    #[serde(rename = "ID", deserialize_with = "number_or_string")]
    pub id: u64,
}

/// Bitrix24 sends ids as numbers in some methods and as strings in others.
fn number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid id {n}"))),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected number or string, got {other}"
        ))),
    }
}

/// Pulls the created task's id out of a `tasks.task.add` response.
pub fn created_task_id(response: &Value) -> Option<String> {
    match response.pointer("/result/task/id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
