//! Direct Gemini API backend, authenticated per request from the key pool.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use grelay_protocol::gemini::embed_content::{
    BatchEmbedContentsRequest, EmbedContentRequest, EmbedContentResponse,
};
use grelay_protocol::gemini::generate_content::GenerateContentRequest;
use grelay_protocol::gemini::types::{Content, Part};

use crate::backend::{BackendBody, BackendError, BackendReply, GenerateBackend};
use crate::keypool::KeyPool;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const STREAM_CHANNEL_CAPACITY: usize = 32;

pub struct DirectBackend {
    client: reqwest::Client,
    pool: Arc<KeyPool>,
    base_url: String,
}

impl DirectBackend {
    pub fn new(client: reqwest::Client, pool: Arc<KeyPool>) -> Self {
        Self::with_base_url(client, pool, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        client: reqwest::Client,
        pool: Arc<KeyPool>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            pool,
            base_url: base_url.into(),
        }
    }

    async fn post_with_rotation(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<(String, reqwest::Response), BackendError> {
        let attempts = self.pool.len().await.max(1);
        let mut last_error = BackendError::unavailable("no active upstream keys");

        for _ in 0..attempts {
            let Some(key) = self.pool.acquire().await else {
                return Err(last_error);
            };

            let url = format!("{}{}", self.base_url, path);
            let result = self
                .client
                .post(&url)
                .header("x-goog-api-key", &key.secret)
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.pool.report_success(&key.id).await;
                        return Ok((key.id, response));
                    }
                    let body = response.text().await.unwrap_or_default();
                    if retryable(status) {
                        // Quota or auth trouble on this key; park it and
                        // move on to the next one.
                        self.pool.report_failure(&key.id).await;
                        warn!(key_id = %key.id, status = %status, "upstream rejected key, rotating");
                        last_error = BackendError {
                            status,
                            message: truncate(&body),
                            selected_key_id: Some(key.id),
                        };
                        continue;
                    }
                    return Err(BackendError {
                        status,
                        message: truncate(&body),
                        selected_key_id: Some(key.id),
                    });
                }
                Err(err) => {
                    self.pool.report_failure(&key.id).await;
                    warn!(key_id = %key.id, error = %err, "upstream transport failure, rotating");
                    last_error = BackendError {
                        status: StatusCode::BAD_GATEWAY,
                        message: err.to_string(),
                        selected_key_id: Some(key.id),
                    };
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait::async_trait]
impl GenerateBackend for DirectBackend {
    async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        stream: bool,
    ) -> Result<BackendReply, BackendError> {
        let action = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let path = format!("/v1beta/models/{model}:{action}");
        let payload = serde_json::to_value(request)
            .map_err(|err| BackendError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

        let (key_id, response) = self.post_with_rotation(&path, &payload).await?;

        if !stream {
            let body = response.bytes().await.map_err(|err| BackendError {
                status: StatusCode::BAD_GATEWAY,
                message: err.to_string(),
                selected_key_id: Some(key_id.clone()),
            })?;
            return Ok(BackendReply {
                selected_key_id: key_id,
                body: BackendBody::Json(body),
            });
        }

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            while let Some(item) = body.next().await {
                match item {
                    Ok(chunk) => {
                        if tx.send(chunk).await.is_err() {
                            // Client disconnected; stop pulling from upstream.
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "upstream stream ended with error");
                        break;
                    }
                }
            }
        });

        Ok(BackendReply {
            selected_key_id: key_id,
            body: BackendBody::Stream(rx),
        })
    }

    async fn embed_content(
        &self,
        model: &str,
        texts: Vec<String>,
    ) -> Result<(String, EmbedContentResponse), BackendError> {
        let (path, payload) = if texts.len() == 1 {
            let request = EmbedContentRequest {
                content: text_content(&texts[0]),
            };
            (
                format!("/v1beta/models/{model}:embedContent"),
                serde_json::to_value(request),
            )
        } else {
            let request = BatchEmbedContentsRequest {
                requests: texts
                    .iter()
                    .map(|text| EmbedContentRequest {
                        content: text_content(text),
                    })
                    .collect(),
            };
            (
                format!("/v1beta/models/{model}:batchEmbedContents"),
                serde_json::to_value(request),
            )
        };
        let payload = payload
            .map_err(|err| BackendError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

        let (key_id, response) = self.post_with_rotation(&path, &payload).await?;
        let parsed = response
            .json::<EmbedContentResponse>()
            .await
            .map_err(|err| BackendError {
                status: StatusCode::BAD_GATEWAY,
                message: err.to_string(),
                selected_key_id: Some(key_id.clone()),
            })?;
        Ok((key_id, parsed))
    }
}

fn text_content(text: &str) -> Content {
    Content {
        role: None,
        parts: vec![Part::text(text)],
    }
}

fn retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::UNAUTHORIZED
        || status.is_server_error()
}

fn truncate(body: &str) -> String {
    const MAX: usize = 2048;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    }
}
