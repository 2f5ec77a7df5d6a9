use async_trait::async_trait;
use reqwest::{Client, Response, multipart};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use super::{
    bitrix::{FileRef, NotifyRequest, TaskAddRequest, TaskFields, UploadFileResponse},
    destination::TaskDestination,
    freshdesk::Attachment,
};
use crate::error::DeliveryError;

const TASK_ADD: &str = "tasks.task.add";
const FOLDER_UPLOAD: &str = "disk.folder.uploadfile";
const NOTIFY: &str = "im.notify.system.add";

/// Default cap on a single attachment download.
pub const MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

/// Talks to a Bitrix24 inbound webhook (`https://<portal>/rest/<user>/<token>`).
#[derive(Clone)]
pub struct BitrixClient {
    client: Client,
    base_url: String,
    max_attachment_bytes: u64,
}

impl BitrixClient {
    /// `client` carries the request timeout; it is shared by every call.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            max_attachment_bytes: MAX_ATTACHMENT_BYTES,
        }
    }

    pub fn with_max_attachment_bytes(mut self, limit: u64) -> Self {
        self.max_attachment_bytes = limit;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        method: &str,
        body: &T,
    ) -> Result<Value, DeliveryError> {
        let url = self.method_url(method);
        info!("Bitrix24 Request URL: {}", url);

        let resp = self.client.post(&url).json(body).send().await?;
        read_response(resp).await
    }
}

#[async_trait]
impl TaskDestination for BitrixClient {
    fn name(&self) -> &'static str {
        "Bitrix24"
    }

    async fn create_task(&self, fields: &TaskFields) -> Result<Value, DeliveryError> {
        debug!("Bitrix24 Request: {:?}", fields);
        let resp = self.post_json(TASK_ADD, &TaskAddRequest { fields }).await?;
        info!("Bitrix24 Response: {}", resp);
        Ok(resp)
    }

    async fn upload_attachment(
        &self,
        folder_id: u64,
        attachment: &Attachment,
    ) -> Result<FileRef, DeliveryError> {
        debug!("Fetching attachment {} from {}", attachment.name, attachment.url);
        let resp = self
            .client
            .get(&attachment.url)
            .send()
            .await?
            .error_for_status()?;
        let bytes = read_limited(resp, self.max_attachment_bytes).await?;

        let form = multipart::Form::new()
            .text("id", folder_id.to_string())
            .part(
                "file",
                multipart::Part::bytes(bytes).file_name(attachment.name.clone()),
            );

        let url = self.method_url(FOLDER_UPLOAD);
        info!("Bitrix24 Request URL: {}", url);
        let resp = self.client.post(&url).multipart(form).send().await?;
        let body = read_response(resp).await?;

        let uploaded: UploadFileResponse = decode(body)?;
        info!(file_id = uploaded.result.id, "uploaded {}", attachment.name);
        Ok(FileRef::disk_file(uploaded.result.id))
    }

    async fn notify(&self, user_id: u64, message: &str) -> Result<(), DeliveryError> {
        let resp = self
            .post_json(NOTIFY, &NotifyRequest { user_id, message })
            .await?;
        debug!("Bitrix24 Response: {}", resp);
        Ok(())
    }
}

/// Reads the body once; non-2xx statuses and `error` payloads both fail.
async fn read_response(resp: Response) -> Result<Value, DeliveryError> {
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        return Err(DeliveryError::Status {
            status: status.as_u16(),
            body: text,
        });
    }

    let mut deserializer = serde_json::Deserializer::from_str(&text);
    let body: Value = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|e| DeliveryError::Decode(e.to_string()))?;
    deserializer
        .end()
        .map_err(|e| DeliveryError::Decode(e.to_string()))?;

    if body.get("error").is_some() {
        return Err(DeliveryError::Destination(body));
    }
    Ok(body)
}

/// Buffers at most `limit` bytes; the declared length is checked before reading.
async fn read_limited(mut resp: Response, limit: u64) -> Result<Vec<u8>, DeliveryError> {
    if resp.content_length().is_some_and(|len| len > limit) {
        return Err(DeliveryError::TooLarge { limit });
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if (bytes.len() + chunk.len()) as u64 > limit {
            return Err(DeliveryError::TooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, DeliveryError> {
    serde_path_to_error::deserialize(body).map_err(|e| DeliveryError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::bitrix::{TaskPriority, TaskStatus};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WEBHOOK: &str = "/rest/13/secret-token";

    fn client_for(server: &MockServer) -> BitrixClient {
        let client = Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        BitrixClient::new(client, format!("{}{}/", server.uri(), WEBHOOK))
    }

    fn fields() -> TaskFields {
        TaskFields {
            title: "Freshdesk #42 – Login issue".into(),
            description: "body".into(),
            responsible_id: 13,
            accomplices: vec![1],
            auditors: vec![],
            deadline: "2026-10-22T14:00:00.000Z".into(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            files: vec![],
        }
    }

    #[tokio::test]
    async fn create_task_posts_fields_to_task_add() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{WEBHOOK}/tasks.task.add")))
            .and(body_json(json!({
                "fields": {
                    "TITLE": "Freshdesk #42 – Login issue",
                    "DESCRIPTION": "body",
                    "RESPONSIBLE_ID": 13,
                    "ACCOMPLICES": [1],
                    "DEADLINE": "2026-10-22T14:00:00.000Z",
                    "PRIORITY": 1,
                    "STATUS": 2
                }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "result": { "task": { "id": "555" } } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resp = client_for(&server).create_task(&fields()).await.unwrap();
        assert_eq!(resp["result"]["task"]["id"], "555");
    }

    #[tokio::test]
    async fn error_payload_with_200_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": "ERROR_CORE",
                "error_description": "TITLE is empty"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).create_task(&fields()).await.unwrap_err();
        match err {
            DeliveryError::Destination(body) => assert_eq!(body["error"], "ERROR_CORE"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_status_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client_for(&server).create_task(&fields()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn non_json_body_is_a_decode_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server).create_task(&fields()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Decode(_)));
    }

    #[tokio::test]
    async fn trailing_garbage_after_json_is_a_decode_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"result":1} junk"#))
            .mount(&server)
            .await;

        let err = client_for(&server).create_task(&fields()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Decode(_)));
    }

    #[tokio::test]
    async fn slow_destination_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "result": {} }))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).create_task(&fields()).await.unwrap_err();
        match err {
            DeliveryError::Transport(e) => assert!(e.is_timeout()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn attachment_is_fetched_then_uploaded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/report.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{WEBHOOK}/disk.folder.uploadfile")))
            .and(body_string_contains("%PDF-1.4"))
            .and(body_string_contains("report.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "result": { "ID": 77, "NAME": "report.pdf" } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let attachment = Attachment {
            url: format!("{}/files/report.pdf", server.uri()),
            name: "report.pdf".into(),
        };
        let file = client_for(&server)
            .upload_attachment(9, &attachment)
            .await
            .unwrap();
        assert_eq!(file.to_string(), "n77");
    }

    #[tokio::test]
    async fn missing_attachment_source_fails_the_upload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let attachment = Attachment {
            url: format!("{}/files/gone.txt", server.uri()),
            name: "gone.txt".into(),
        };
        let err = client_for(&server)
            .upload_attachment(9, &attachment)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }

    #[tokio::test]
    async fn oversized_attachment_is_not_uploaded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 2048]))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let attachment = Attachment {
            url: format!("{}/files/huge.bin", server.uri()),
            name: "huge.bin".into(),
        };
        let err = client_for(&server)
            .with_max_attachment_bytes(1024)
            .upload_attachment(9, &attachment)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::TooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn attachment_at_the_limit_is_uploaded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 1024]))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{WEBHOOK}/disk.folder.uploadfile")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "result": { "ID": 5 } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let attachment = Attachment {
            url: format!("{}/files/exact.bin", server.uri()),
            name: "exact.bin".into(),
        };
        let file = client_for(&server)
            .with_max_attachment_bytes(1024)
            .upload_attachment(9, &attachment)
            .await
            .unwrap();
        assert_eq!(file.to_string(), "n5");
    }

    #[tokio::test]
    async fn notify_sends_user_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{WEBHOOK}/im.notify.system.add")))
            .and(body_json(json!({ "USER_ID": 13, "MESSAGE": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 12 })))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).notify(13, "hello").await.unwrap();
    }
}
