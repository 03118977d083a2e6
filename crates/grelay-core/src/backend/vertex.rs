//! Vertex AI backend via its OpenAI-compatible chat endpoint.
//!
//! Requests pass through in the OpenAI dialect. Streamed replies arrive as
//! SSE; they are re-framed into bare JSON records plus a terminal
//! `{"done":true}` marker, which the stream translator consumes.

use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::debug;

use grelay_protocol::sse::SseParser;

use crate::backend::oauth::{self, TokenCache};
use crate::backend::{BackendBody, BackendError, BackendReply, OpenAiCompatBackend};
use crate::settings::VertexSettings;

const STREAM_CHANNEL_CAPACITY: usize = 32;
const DONE_SENTINEL: &[u8] = b"{\"done\":true}";

pub struct VertexBackend {
    client: reqwest::Client,
    config: VertexSettings,
    token_cache: TokenCache,
}

impl VertexBackend {
    pub fn new(client: reqwest::Client, config: VertexSettings) -> Self {
        Self {
            client,
            config,
            token_cache: TokenCache::default(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/endpoints/openapi/chat/completions",
            location = self.config.location,
            project = self.config.project_id,
        )
    }
}

#[async_trait::async_trait]
impl OpenAiCompatBackend for VertexBackend {
    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn supported_models(&self) -> Vec<String> {
        self.config.models.clone()
    }

    async fn chat_completions(
        &self,
        body: JsonValue,
        stream: bool,
    ) -> Result<BackendReply, BackendError> {
        let token = oauth::fetch_access_token(
            &self.client,
            &self.token_cache,
            &self.config.service_account,
        )
        .await?;
        let key_id = self.config.service_account.client_email.clone();

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| BackendError {
                status: StatusCode::BAD_GATEWAY,
                message: err.to_string(),
                selected_key_id: Some(key_id.clone()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError {
                status,
                message: text,
                selected_key_id: Some(key_id),
            });
        }

        if !stream {
            let bytes = response.bytes().await.map_err(|err| BackendError {
                status: StatusCode::BAD_GATEWAY,
                message: err.to_string(),
                selected_key_id: Some(key_id.clone()),
            })?;
            return Ok(BackendReply {
                selected_key_id: key_id,
                body: BackendBody::Json(bytes),
            });
        }

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut upstream = response.bytes_stream();
            'outer: while let Some(item) = upstream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!(error = %err, "vertex stream ended with error");
                        break;
                    }
                };
                for data in parser.push_bytes(&chunk) {
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    if tx.send(Bytes::from(data)).await.is_err() {
                        break 'outer;
                    }
                }
            }
            for data in parser.finish() {
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                if tx.send(Bytes::from(data)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Bytes::from_static(DONE_SENTINEL)).await;
        });

        Ok(BackendReply {
            selected_key_id: key_id,
            body: BackendBody::Stream(rx),
        })
    }
}
