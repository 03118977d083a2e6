use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Extension;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use grelay_core::catalog::{BackendKind, list_model_ids, resolve_model};
use grelay_core::{BackendBody, GatewayError, KeepAliveHandle};
use grelay_protocol::gemini::generate_content::GenerateContentResponse;
use grelay_protocol::openai::chat::ChatCompletionRequestBody;
use grelay_protocol::openai::embeddings::{EmbeddingInput, EmbeddingRequestBody};
use grelay_protocol::openai::error::ErrorEnvelope;
use grelay_protocol::openai::models::{ModelInfo, ModelList};
use grelay_translate::embeddings::{
    input_is_valid, short_input_response, translate_embedding_response,
};
use grelay_translate::request::{TranslateOptions, translate_request};
use grelay_translate::response::{error_completion, translate_response};

use crate::auth::ClientKey;
use crate::pipeline::spawn_stream_pipeline;
use crate::respond::{error_response, json_bytes_response, json_response, sse_response};
use crate::state::AppState;

const KEEPALIVE_CHANNEL_CAPACITY: usize = 32;

pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let settings = state.settings.load();
    let created = now_epoch_seconds();
    let list = ModelList {
        object: "list".to_string(),
        data: list_model_ids(&settings)
            .into_iter()
            .map(|id| ModelInfo::new(id, created, "google"))
            .collect(),
    };
    json_response(StatusCode::OK, &list, None)
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(ClientKey(client_key)): Extension<ClientKey>,
    body: Bytes,
) -> Response {
    let mut value: JsonValue = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(GatewayError::invalid_request(format!(
                "malformed request body: {err}"
            )));
        }
    };
    let Some(object) = value.as_object_mut() else {
        return error_response(GatewayError::invalid_request("request body must be an object"));
    };

    // Never forwarded, regardless of backend.
    object.remove("safety_settings");
    object.remove("response_schema");

    let Some(model) = object.get("model").and_then(JsonValue::as_str).map(String::from) else {
        return error_response(GatewayError::invalid_request("missing model"));
    };
    let stream = object
        .get("stream")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);

    let settings = state.settings.load();
    let route = match resolve_model(&settings, &model) {
        Ok(route) => route,
        Err(err) => return error_response(err),
    };
    let safety_on = settings.safety_filtering_for(&client_key);

    let trace_id = Uuid::new_v4().to_string();
    info!(
        event = "chat_request",
        trace_id = %trace_id,
        model = %route.client_model,
        backend = ?route.backend,
        is_stream = stream
    );

    match route.backend {
        BackendKind::Vertex => {
            let Some(vertex) = state.vertex.as_ref().filter(|vertex| vertex.is_enabled()) else {
                return error_response(GatewayError::invalid_request(
                    "alternate backend is not enabled",
                ));
            };
            object.insert("model".to_string(), json!(route.upstream_model));

            match vertex.chat_completions(value, stream).await {
                Err(err) => error_response(GatewayError::upstream(err.status, err.message)),
                Ok(reply) => match reply.body {
                    BackendBody::Json(bytes) => {
                        json_bytes_response(StatusCode::OK, bytes, Some(&reply.selected_key_id))
                    }
                    BackendBody::Stream(rx) => {
                        let out = spawn_stream_pipeline(rx, route.client_model.clone());
                        sse_response(out, Some(&reply.selected_key_id))
                    }
                },
            }
        }
        BackendKind::Direct => {
            let request_body: ChatCompletionRequestBody = match serde_json::from_value(value) {
                Ok(body) => body,
                Err(err) => {
                    return error_response(GatewayError::invalid_request(format!(
                        "malformed chat request: {err}"
                    )));
                }
            };
            let options = TranslateOptions {
                system_as_user: !settings.model_supports_system_instruction(&route.upstream_model)
                    || !safety_on,
                enable_search: route.enable_search,
                thinking_budget: route.thinking_budget,
            };
            let upstream_request = translate_request(&request_body, &options);

            let keepalive = stream && settings.keepalive_enabled && !safety_on;
            if keepalive {
                let (tx, rx) = mpsc::channel::<Bytes>(KEEPALIVE_CHANNEL_CAPACITY);
                let handle = KeepAliveHandle::start(tx, route.client_model.clone());
                let direct = state.direct.clone();
                let upstream_model = route.upstream_model.clone();
                let client_model = route.client_model.clone();

                tokio::spawn(async move {
                    let result = direct
                        .generate_content(&upstream_model, &upstream_request, false)
                        .await;
                    match result {
                        Ok(reply) => {
                            let BackendBody::Json(bytes) = reply.body else {
                                handle
                                    .send_error(&ErrorEnvelope::new(
                                        "keepalive_proxy_error",
                                        "unexpected streaming body",
                                    ))
                                    .await;
                                return;
                            };
                            match serde_json::from_slice::<GenerateContentResponse>(&bytes) {
                                Ok(response) => {
                                    handle
                                        .send_final(&translate_response(&response, &client_model))
                                        .await;
                                }
                                Err(err) => {
                                    warn!(error = %err, "keepalive finalization failed");
                                    handle
                                        .send_error(&ErrorEnvelope::new(
                                            "keepalive_proxy_error",
                                            err.to_string(),
                                        ))
                                        .await;
                                }
                            }
                        }
                        Err(err) => {
                            handle.send_error(&ErrorEnvelope::upstream(err.message)).await;
                        }
                    }
                });

                return sse_response(rx, None);
            }

            if stream {
                match state
                    .direct
                    .generate_content(&route.upstream_model, &upstream_request, true)
                    .await
                {
                    Err(err) => error_response(GatewayError::upstream(err.status, err.message)),
                    Ok(reply) => {
                        let BackendBody::Stream(upstream_rx) = reply.body else {
                            return error_response(GatewayError::internal(
                                "expected streaming upstream body",
                            ));
                        };
                        let out = spawn_stream_pipeline(upstream_rx, route.client_model.clone());
                        sse_response(out, Some(&reply.selected_key_id))
                    }
                }
            } else {
                match state
                    .direct
                    .generate_content(&route.upstream_model, &upstream_request, false)
                    .await
                {
                    Err(err) => error_response(GatewayError::upstream(err.status, err.message)),
                    Ok(reply) => {
                        let BackendBody::Json(bytes) = reply.body else {
                            return error_response(GatewayError::internal(
                                "expected buffered upstream body",
                            ));
                        };
                        match serde_json::from_slice::<GenerateContentResponse>(&bytes) {
                            Ok(response) => json_response(
                                StatusCode::OK,
                                &translate_response(&response, &route.client_model),
                                Some(&reply.selected_key_id),
                            ),
                            Err(err) => {
                                warn!(trace_id = %trace_id, error = %err, "upstream response not translatable");
                                json_response(
                                    StatusCode::OK,
                                    &error_completion(
                                        &route.client_model,
                                        &format!("upstream response could not be translated: {err}"),
                                    ),
                                    Some(&reply.selected_key_id),
                                )
                            }
                        }
                    }
                }
            }
        }
    }
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    Extension(ClientKey(_client_key)): Extension<ClientKey>,
    body: Bytes,
) -> Response {
    let request: EmbeddingRequestBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(GatewayError::invalid_request(format!(
                "malformed embedding request: {err}"
            )));
        }
    };

    if !input_is_valid(&request.input) {
        return json_response(StatusCode::OK, &short_input_response(&request.model), None);
    }

    let texts = match request.input {
        EmbeddingInput::Text(text) => vec![text],
        EmbeddingInput::Many(items) => items,
    };

    let settings = state.settings.load();
    let upstream_model = settings
        .embedding_model
        .clone()
        .unwrap_or_else(|| request.model.clone());

    match state.direct.embed_content(&upstream_model, texts).await {
        Err(err) => error_response(GatewayError::upstream(err.status, err.message)),
        Ok((key_id, upstream)) => json_response(
            StatusCode::OK,
            &translate_embedding_response(&upstream, &request.model),
            Some(&key_id),
        ),
    }
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}
