//! Gemini generate-content response → OpenAI chat completion.

use grelay_protocol::gemini::generate_content::{Candidate, GenerateContentResponse};
use grelay_protocol::gemini::types::UsageMetadata;
use grelay_protocol::openai::chat::{
    CHAT_COMPLETION_OBJECT, ChatChoice, ChatCompletionResponse, CompletionUsage, FinishReason,
    FunctionCall, ResponseMessage, ToolCall,
};

use crate::ids::{completion_id, now_epoch_seconds, tool_call_id};

pub const SAFETY_PLACEHOLDER: &str = "[Content blocked by upstream safety filters]";

pub fn translate_response(
    response: &GenerateContentResponse,
    model: &str,
) -> ChatCompletionResponse {
    let Some(candidate) = response.candidates.first() else {
        return blocked_response(response, model);
    };

    let (content, tool_calls) = collect_candidate(candidate);
    let mut finish_reason = candidate.finish_reason.as_deref().and_then(map_finish_reason);
    if !tool_calls.is_empty()
        && !matches!(finish_reason, Some(FinishReason::Stop | FinishReason::Length))
    {
        finish_reason = Some(FinishReason::ToolCalls);
    }

    let content = if content.is_empty() {
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            Some(SAFETY_PLACEHOLDER.to_string())
        } else if tool_calls.is_empty() {
            Some(String::new())
        } else {
            None
        }
    } else {
        Some(content)
    };

    completion(
        model,
        ResponseMessage {
            role: "assistant".to_string(),
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        },
        finish_reason,
        map_usage(response.usage_metadata.as_ref()),
    )
}

/// Error-shaped completion used when translation itself fails.
pub fn error_completion(model: &str, message: &str) -> ChatCompletionResponse {
    completion(
        model,
        ResponseMessage {
            role: "assistant".to_string(),
            content: Some(message.to_string()),
            tool_calls: None,
        },
        Some(FinishReason::Error),
        CompletionUsage::default(),
    )
}

fn blocked_response(response: &GenerateContentResponse, model: &str) -> ChatCompletionResponse {
    let block_reason = response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.clone());

    let (content, finish_reason) = match block_reason {
        Some(reason) => (
            format!("Request blocked by upstream: {reason}"),
            FinishReason::ContentFilter,
        ),
        None => (
            "Upstream returned no candidates".to_string(),
            FinishReason::Error,
        ),
    };

    completion(
        model,
        ResponseMessage {
            role: "assistant".to_string(),
            content: Some(content),
            tool_calls: None,
        },
        Some(finish_reason),
        map_usage(response.usage_metadata.as_ref()),
    )
}

fn completion(
    model: &str,
    message: ResponseMessage,
    finish_reason: Option<FinishReason>,
    usage: CompletionUsage,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: completion_id(),
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason,
        }],
        usage,
        system_fingerprint: None,
    }
}

fn collect_candidate(candidate: &Candidate) -> (String, Vec<ToolCall>) {
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    let Some(parts) = candidate.content.as_ref().map(|content| &content.parts) else {
        return (content, tool_calls);
    };

    for part in parts {
        if let Some(text) = &part.text {
            content.push_str(text);
        }
        if let Some(call) = &part.function_call {
            let index = tool_calls.len();
            let arguments = call
                .args
                .as_ref()
                .map(|args| args.to_string())
                .unwrap_or_else(|| "{}".to_string());
            tool_calls.push(ToolCall {
                id: tool_call_id(&call.name, index),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments,
                },
            });
        }
    }

    (content, tool_calls)
}

/// Total over arbitrary upstream values: everything unrecognized maps to None.
pub fn map_finish_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "STOP" => Some(FinishReason::Stop),
        "MAX_TOKENS" => Some(FinishReason::Length),
        "SAFETY" | "RECITATION" => Some(FinishReason::ContentFilter),
        "TOOL_CALLS" => Some(FinishReason::ToolCalls),
        _ => None,
    }
}

pub fn map_usage(usage: Option<&UsageMetadata>) -> CompletionUsage {
    let Some(usage) = usage else {
        return CompletionUsage::default();
    };
    CompletionUsage {
        prompt_tokens: usage.prompt_token_count.unwrap_or(0),
        completion_tokens: usage.candidates_token_count.unwrap_or(0),
        total_tokens: usage.total_token_count.unwrap_or(0),
    }
}
