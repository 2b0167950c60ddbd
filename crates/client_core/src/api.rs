use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

use shared::{
    domain::{AttachmentKind, ConversationId, UserId},
    error::{ApiError, ApiException},
    protocol::{AttachmentPayload, ConversationSummary, MessagePayload},
};

use crate::capture::coarse_kind;

/// Non-2xx responses carry the JSON error envelope; surface it as a typed
/// error when it parses, or fall back to the bare status.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(envelope) => Err(ApiException::from(envelope).into()),
        Err(_) => Err(anyhow!("request failed with status {status}")),
    }
}

/// Fraction-complete callback for uploads, 0.0 through 1.0.
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub body: Option<String>,
    pub attachment: Option<AttachmentPayload>,
}

/// Reliable request/response collaborators of the conversation engine.
/// Message sending lives here rather than on the socket: a send must fail
/// loudly, never be dropped by transport flakiness.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
    async fn fetch_history(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>>;
    async fn send_message(&self, outgoing: OutgoingMessage) -> Result<MessagePayload>;
    async fn mark_as_read(&self, conversation_id: ConversationId) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub mime_type: Option<String>,
    pub folder: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UploadedAsset {
    pub url: String,
    pub filename: String,
    pub kind: AttachmentKind,
}

#[async_trait]
pub trait UploadService: Send + Sync {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressCallback,
    ) -> Result<UploadedAsset>;
}

pub struct HttpConversationApi {
    http: Client,
    server_url: String,
    user_id: UserId,
}

impl HttpConversationApi {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            user_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendMessageHttpRequest {
    user_id: i64,
    conversation_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment: Option<AttachmentPayload>,
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let response = self
            .http
            .get(format!("{}/conversations", self.server_url))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?;
        let conversations = ensure_success(response).await?.json().await?;
        Ok(conversations)
    }

    async fn fetch_history(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation_id.0
            ))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?;
        let messages = ensure_success(response).await?.json().await?;
        Ok(messages)
    }

    async fn send_message(&self, outgoing: OutgoingMessage) -> Result<MessagePayload> {
        let payload = SendMessageHttpRequest {
            user_id: self.user_id.0,
            conversation_id: outgoing.conversation_id.0,
            body: outgoing.body,
            attachment: outgoing.attachment,
        };
        let response = self
            .http
            .post(format!("{}/messages", self.server_url))
            .json(&payload)
            .send()
            .await?;
        let message = ensure_success(response).await?.json().await?;
        Ok(message)
    }

    async fn mark_as_read(&self, conversation_id: ConversationId) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/read",
                self.server_url, conversation_id.0
            ))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

pub struct HttpUploadService {
    http: Client,
    server_url: String,
    user_id: UserId,
}

impl HttpUploadService {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            user_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    url: String,
    #[serde(default)]
    filename: Option<String>,
}

#[async_trait]
impl UploadService for HttpUploadService {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressCallback,
    ) -> Result<UploadedAsset> {
        let UploadRequest {
            filename,
            mime_type,
            folder,
            bytes,
        } = request;

        let total = bytes.len();
        let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Vec<u8>>>(4);
        let feeder_progress = Arc::clone(&progress);
        let feeder = tokio::spawn(async move {
            let mut sent = 0usize;
            for chunk in bytes.chunks(UPLOAD_CHUNK_BYTES) {
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    return;
                }
                sent += chunk.len();
                if total > 0 {
                    feeder_progress(sent as f32 / total as f32);
                }
            }
        });

        let response = self
            .http
            .post(format!("{}/files/upload", self.server_url))
            .query(&[
                ("user_id", self.user_id.0.to_string()),
                ("folder", folder),
                ("filename", filename.clone()),
                (
                    "mime_type",
                    mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                ),
            ])
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
            .send()
            .await?;
        let response: FileUploadResponse = ensure_success(response).await?.json().await?;
        let _ = feeder.await;
        progress(1.0);

        let kind = coarse_kind(mime_type.as_deref(), &filename);
        Ok(UploadedAsset {
            url: response.url,
            filename: response.filename.unwrap_or(filename),
            kind,
        })
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
