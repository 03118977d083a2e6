//! End-to-end gateway tests against a live listener with fake upstreams.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;

use grelay_core::backend::{
    BackendBody, BackendError, BackendReply, GenerateBackend, OpenAiCompatBackend,
};
use grelay_core::settings::{
    ClientKeySettings, ModelCategory, ModelEntry, Settings, SettingsStore,
};
use grelay_protocol::gemini::embed_content::{ContentEmbedding, EmbedContentResponse};
use grelay_protocol::gemini::generate_content::GenerateContentRequest;
use grelay_router::{AppState, router};

#[derive(Debug, Clone)]
struct CapturedCall {
    model: String,
    request: GenerateContentRequest,
    stream: bool,
}

struct FakeDirect {
    captured: Mutex<Vec<CapturedCall>>,
    json_reply: JsonValue,
    stream_chunks: Vec<Bytes>,
    reply_delay: Duration,
}

impl FakeDirect {
    fn with_json(reply: JsonValue) -> Self {
        Self {
            captured: Mutex::new(Vec::new()),
            json_reply: reply,
            stream_chunks: Vec::new(),
            reply_delay: Duration::ZERO,
        }
    }

    fn with_stream(chunks: Vec<Bytes>) -> Self {
        Self {
            captured: Mutex::new(Vec::new()),
            json_reply: json!({}),
            stream_chunks: chunks,
            reply_delay: Duration::ZERO,
        }
    }

    fn calls(&self) -> Vec<CapturedCall> {
        self.captured.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl GenerateBackend for FakeDirect {
    async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        stream: bool,
    ) -> Result<BackendReply, BackendError> {
        self.captured.lock().unwrap().push(CapturedCall {
            model: model.to_string(),
            request: request.clone(),
            stream,
        });
        if !self.reply_delay.is_zero() {
            tokio::time::sleep(self.reply_delay).await;
        }

        if stream {
            let (tx, rx) = mpsc::channel(8);
            let chunks = self.stream_chunks.clone();
            tokio::spawn(async move {
                for chunk in chunks {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
            return Ok(BackendReply {
                selected_key_id: "gk-1".to_string(),
                body: BackendBody::Stream(rx),
            });
        }

        Ok(BackendReply {
            selected_key_id: "gk-1".to_string(),
            body: BackendBody::Json(Bytes::from(self.json_reply.to_string())),
        })
    }

    async fn embed_content(
        &self,
        _model: &str,
        texts: Vec<String>,
    ) -> Result<(String, EmbedContentResponse), BackendError> {
        let embeddings = texts
            .iter()
            .enumerate()
            .map(|(index, _)| ContentEmbedding {
                values: vec![index as f64, 0.5],
            })
            .collect();
        Ok((
            "gk-1".to_string(),
            EmbedContentResponse {
                embedding: None,
                embeddings: Some(embeddings),
            },
        ))
    }
}

struct FakeVertex {
    captured: Mutex<Vec<(JsonValue, bool)>>,
}

#[async_trait::async_trait]
impl OpenAiCompatBackend for FakeVertex {
    fn is_enabled(&self) -> bool {
        true
    }

    fn supported_models(&self) -> Vec<String> {
        vec!["gemini-2.5-pro".to_string()]
    }

    async fn chat_completions(
        &self,
        body: JsonValue,
        stream: bool,
    ) -> Result<BackendReply, BackendError> {
        self.captured.lock().unwrap().push((body, stream));
        Ok(BackendReply {
            selected_key_id: "sa@test".to_string(),
            body: BackendBody::Json(Bytes::from(
                json!({"id": "chatcmpl-vertex", "object": "chat.completion"}).to_string(),
            )),
        })
    }
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings
        .client_keys
        .insert("sk-test".to_string(), ClientKeySettings::default());
    settings.client_keys.insert(
        "sk-raw".to_string(),
        ClientKeySettings {
            safety_filtering: Some(false),
        },
    );
    settings.models.insert(
        "gemini-2.5-flash-preview".to_string(),
        ModelEntry {
            category: ModelCategory::Flash,
            daily_quota: None,
            individual_quota: None,
        },
    );
    settings.web_search_enabled = true;
    settings
}

async fn serve(
    settings: Settings,
    direct: Arc<dyn GenerateBackend>,
    vertex: Option<Arc<dyn OpenAiCompatBackend>>,
) -> String {
    let state = Arc::new(AppState::new(
        Arc::new(SettingsStore::new(settings)),
        direct,
        vertex,
    ));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn upstream_hello() -> JsonValue {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": "hello"}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 1, "totalTokenCount": 2}
    })
}

#[tokio::test]
async fn requests_without_key_are_rejected() {
    let direct = Arc::new(FakeDirect::with_json(upstream_hello()));
    let base = serve(test_settings(), direct, None).await;

    let response = reqwest::get(format!("{base}/v1/models")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let value: JsonValue = response.json().await.unwrap();
    assert_eq!(value["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn models_listing_includes_virtual_ids() {
    let direct = Arc::new(FakeDirect::with_json(upstream_hello()));
    let base = serve(test_settings(), direct, None).await;

    let response = reqwest::Client::new()
        .get(format!("{base}/v1/models"))
        .bearer_auth("sk-test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value: JsonValue = response.json().await.unwrap();
    assert_eq!(value["object"], "list");

    let ids: Vec<&str> = value["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"gemini-2.5-flash-preview"));
    assert!(ids.contains(&"gemini-2.5-flash-preview-search"));
    assert!(ids.contains(&"gemini-2.5-flash-preview:non-thinking"));
    assert!(
        value["data"]
            .as_array()
            .unwrap()
            .iter()
            .all(|item| item["owned_by"] == "google" && item["object"] == "model")
    );
}

#[tokio::test]
async fn simple_chat_round_trip() {
    let direct = Arc::new(FakeDirect::with_json(upstream_hello()));
    let base = serve(test_settings(), direct.clone(), None).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth("sk-test")
        .json(&json!({
            "model": "gemini-2.5-flash-preview",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-proxied-by").unwrap(),
        "grelay"
    );
    assert_eq!(
        response.headers().get("x-selected-key-id").unwrap(),
        "gk-1"
    );

    let value: JsonValue = response.json().await.unwrap();
    assert_eq!(value["object"], "chat.completion");
    assert_eq!(value["model"], "gemini-2.5-flash-preview");
    assert_eq!(value["choices"][0]["message"]["content"], "hello");
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
    assert_eq!(value["usage"]["prompt_tokens"], 1);
    assert_eq!(value["usage"]["completion_tokens"], 1);
    assert_eq!(value["usage"]["total_tokens"], 2);

    let calls = direct.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].model, "gemini-2.5-flash-preview");
    assert!(!calls[0].stream);
}

#[tokio::test]
async fn unknown_models_get_invalid_request() {
    let direct = Arc::new(FakeDirect::with_json(upstream_hello()));
    let base = serve(test_settings(), direct, None).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth("sk-test")
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value: JsonValue = response.json().await.unwrap();
    assert_eq!(value["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn non_thinking_suffix_rewrites_upstream_call() {
    let direct = Arc::new(FakeDirect::with_json(upstream_hello()));
    let base = serve(test_settings(), direct.clone(), None).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth("sk-test")
        .json(&json!({
            "model": "gemini-2.5-flash-preview:non-thinking",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let value: JsonValue = response.json().await.unwrap();
    // The client-facing model field echoes the virtual id.
    assert_eq!(value["model"], "gemini-2.5-flash-preview:non-thinking");

    let calls = direct.calls();
    assert_eq!(calls[0].model, "gemini-2.5-flash-preview");
    let config = calls[0].request.generation_config.as_ref().unwrap();
    assert_eq!(config.thinking_config.unwrap().thinking_budget, 0);
}

#[tokio::test]
async fn streamed_tool_call_emits_frames_and_done() {
    let chunk = Bytes::from(
        r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"f","args":{"x":1}}}]},"finishReason":"TOOL_CALLS"}]}"#,
    );
    let direct = Arc::new(FakeDirect::with_stream(vec![chunk]));
    let base = serve(test_settings(), direct, None).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth("sk-test")
        .json(&json!({
            "model": "gemini-2.5-flash-preview",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let body = response.text().await.unwrap();
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert_eq!(body.matches("data: [DONE]").count(), 1);

    let frame = body
        .lines()
        .find(|line| line.starts_with("data: {"))
        .unwrap();
    let value: JsonValue = serde_json::from_str(frame.strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(value["object"], "chat.completion.chunk");
    let call = &value["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(call["function"]["name"], "f");
    assert_eq!(call["function"]["arguments"], "{\"x\":1}");
    assert_eq!(value["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn keepalive_emits_heartbeat_before_final() {
    let mut direct = FakeDirect::with_json(json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": "ok"}]},
            "finishReason": "STOP"
        }]
    }));
    direct.reply_delay = Duration::from_millis(100);
    let direct = Arc::new(direct);
    let base = serve(test_settings(), direct.clone(), None).await;

    // sk-raw has safety filtering off, which arms the keep-alive path.
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth("sk-raw")
        .json(&json!({
            "model": "gemini-2.5-flash-preview",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.text().await.unwrap();
    assert!(body.contains("\"id\":\"keepalive\""));
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert_eq!(body.matches("data: [DONE]").count(), 1);

    let final_frame = body
        .lines()
        .filter(|line| line.starts_with("data: {"))
        .find(|line| !line.contains("\"id\":\"keepalive\""))
        .unwrap();
    let value: JsonValue =
        serde_json::from_str(final_frame.strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(value["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(value["choices"][0]["delta"]["content"], "ok");

    // The keep-alive path converts the upstream call to non-streaming.
    let calls = direct.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].stream);
}

#[tokio::test]
async fn vertex_prefix_routes_to_alternate_backend() {
    let direct = Arc::new(FakeDirect::with_json(upstream_hello()));
    let vertex = Arc::new(FakeVertex {
        captured: Mutex::new(Vec::new()),
    });

    let mut settings = test_settings();
    settings.vertex = Some(grelay_core::settings::VertexSettings {
        enabled: true,
        project_id: "proj".to_string(),
        location: "us-central1".to_string(),
        models: vec!["gemini-2.5-pro".to_string()],
        service_account: grelay_core::settings::ServiceAccount {
            client_email: "sa@test".to_string(),
            private_key: String::new(),
            private_key_id: None,
            token_uri: None,
        },
    });

    let base = serve(settings, direct, Some(vertex.clone())).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth("sk-test")
        .json(&json!({
            "model": "[v]gemini-2.5-pro",
            "messages": [{"role": "user", "content": "hi"}],
            "safety_settings": [{"category": "x"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-selected-key-id").unwrap(),
        "sa@test"
    );

    let forwarded = vertex.captured.lock().unwrap().clone();
    assert_eq!(forwarded.len(), 1);
    // Prefix stripped, banned fields gone, dialect untouched.
    assert_eq!(forwarded[0].0["model"], "gemini-2.5-pro");
    assert!(forwarded[0].0.get("safety_settings").is_none());
    assert!(!forwarded[0].1);
}

#[tokio::test]
async fn embeddings_round_trip() {
    let direct = Arc::new(FakeDirect::with_json(upstream_hello()));
    let base = serve(test_settings(), direct, None).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/v1/embedded"))
        .bearer_auth("sk-test")
        .json(&json!({"model": "text-embedding-004", "input": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value: JsonValue = response.json().await.unwrap();
    assert!(value["data"].as_array().unwrap().is_empty());
    assert!(value["error"].is_string());

    let response = client
        .post(format!("{base}/v1/embedded"))
        .bearer_auth("sk-test")
        .json(&json!({
            "model": "text-embedding-004",
            "input": ["first document", "second document"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value: JsonValue = response.json().await.unwrap();
    assert_eq!(value["object"], "list");
    assert_eq!(value["data"].as_array().unwrap().len(), 2);
    assert_eq!(value["data"][0]["object"], "embedding");
    assert_eq!(value["data"][1]["index"], 1);
    assert_eq!(value["usage"]["prompt_tokens"], 0);
    assert_eq!(value["usage"]["total_tokens"], 0);
}
