mod client;
mod direct;
mod oauth;
mod vertex;

pub use client::{UpstreamClientConfig, build_http_client};
pub use direct::DirectBackend;
pub use vertex::VertexBackend;

use bytes::Bytes;
use http::StatusCode;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use grelay_protocol::gemini::embed_content::EmbedContentResponse;
use grelay_protocol::gemini::generate_content::GenerateContentRequest;

/// Upstream response body: buffered JSON or a channel of raw body chunks.
/// Stream chunks are fed to the JSON object decoder downstream, so both
/// backends may frame them however their wire protocol does.
#[derive(Debug)]
pub enum BackendBody {
    Json(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct BackendReply {
    /// Credential identifier surfaced as `X-Selected-Key-ID`.
    pub selected_key_id: String,
    pub body: BackendBody,
}

#[derive(Debug, thiserror::Error)]
#[error("upstream error {status}: {message}")]
pub struct BackendError {
    pub status: StatusCode,
    pub message: String,
    pub selected_key_id: Option<String>,
}

impl BackendError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            selected_key_id: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

/// Backend speaking the Gemini generate-content dialect.
#[async_trait::async_trait]
pub trait GenerateBackend: Send + Sync {
    async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        stream: bool,
    ) -> Result<BackendReply, BackendError>;

    async fn embed_content(
        &self,
        model: &str,
        texts: Vec<String>,
    ) -> Result<(String, EmbedContentResponse), BackendError>;
}

/// Backend that already speaks the OpenAI chat-completions dialect and
/// receives the client body unchanged apart from the model rewrite.
#[async_trait::async_trait]
pub trait OpenAiCompatBackend: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn supported_models(&self) -> Vec<String>;

    async fn chat_completions(
        &self,
        body: JsonValue,
        stream: bool,
    ) -> Result<BackendReply, BackendError>;
}
