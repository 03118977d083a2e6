//! OpenAI chat request → Gemini generate-content request.

use std::collections::{HashMap, HashSet};

use serde_json::{Value as JsonValue, json};
use tracing::warn;

use grelay_protocol::gemini::generate_content::GenerateContentRequest;
use grelay_protocol::gemini::types::{
    Content, ContentRole, FunctionCallingConfig, FunctionCallingMode, FunctionDeclaration,
    GenerationConfig, GoogleSearch, Part, ThinkingConfig, Tool, ToolConfig,
};
use grelay_protocol::openai::chat::{
    ChatCompletionRequestBody, ChatMessage, ContentPart, MessageContent, StopConfiguration,
    ToolChoice, ToolDefinition,
};

use crate::schema::sanitize_schema;

const MAX_FUNCTION_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct TranslateOptions {
    /// Inline system messages as user turns instead of `systemInstruction`.
    pub system_as_user: bool,
    /// Append the Google search tool to the upstream tool list.
    pub enable_search: bool,
    /// Forwarded as `generationConfig.thinkingConfig.thinkingBudget`.
    pub thinking_budget: Option<i32>,
}

pub fn translate_request(
    body: &ChatCompletionRequestBody,
    options: &TranslateOptions,
) -> GenerateContentRequest {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    // Assistant tool-call ids seen so far in this request; a later tool
    // message carrying only `tool_call_id` is labeled from this map.
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &body.messages {
        match message.role.as_str() {
            "system" => {
                let Some(text) = content_text(message.content.as_ref()) else {
                    continue;
                };
                if options.system_as_user {
                    contents.push(Content::new(ContentRole::User, vec![Part::text(text)]));
                } else {
                    system_texts.push(text);
                }
            }
            "user" => {
                let parts = content_parts(message.content.as_ref());
                if !parts.is_empty() {
                    contents.push(Content::new(ContentRole::User, parts));
                }
            }
            "assistant" => {
                if let Some(content) = map_assistant_message(message, &mut call_names) {
                    contents.push(content);
                }
            }
            "tool" => {
                if let Some(content) = map_tool_message(message, &call_names) {
                    contents.push(content);
                }
            }
            other => {
                warn!(role = %other, "skipping message with unsupported role");
            }
        }
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content::new(
            ContentRole::System,
            vec![Part::text(system_texts.join("\n"))],
        ))
    };

    let tools = map_tools(body.tools.as_deref(), options.enable_search);
    let tool_config = if body.tools.as_ref().is_some_and(|tools| !tools.is_empty()) {
        map_tool_choice(body.tool_choice.as_ref())
    } else {
        None
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        tool_config,
        generation_config: map_generation_config(body, options.thinking_budget),
    }
}

fn map_assistant_message(
    message: &ChatMessage,
    call_names: &mut HashMap<String, String>,
) -> Option<Content> {
    let mut parts = Vec::new();

    if let Some(calls) = &message.tool_calls {
        for call in calls {
            let args = match serde_json::from_str::<JsonValue>(&call.function.arguments) {
                Ok(value) => value,
                Err(err) => json!({
                    "_error": format!("unparseable tool arguments: {err}"),
                    "raw": call.function.arguments,
                }),
            };
            call_names.insert(call.id.clone(), call.function.name.clone());
            parts.push(Part::function_call(call.function.name.clone(), args));
        }
    }

    parts.extend(content_parts(message.content.as_ref()));

    if parts.is_empty() {
        None
    } else {
        Some(Content::new(ContentRole::Model, parts))
    }
}

fn map_tool_message(message: &ChatMessage, call_names: &HashMap<String, String>) -> Option<Content> {
    let text = content_text(message.content.as_ref()).unwrap_or_default();

    let response = match serde_json::from_str::<JsonValue>(&text) {
        Ok(JsonValue::Object(map)) => JsonValue::Object(map),
        Ok(other) => json!({ "content": other }),
        Err(_) => json!({ "content": text }),
    };

    let name = message.name.clone().or_else(|| {
        message
            .tool_call_id
            .as_ref()
            .and_then(|id| call_names.get(id).cloned())
    });

    let part = match name {
        Some(name) => Part::function_response(name, response),
        None => {
            // The reply still reaches the model, just as plain text.
            warn!("tool message without resolvable function name, downgrading to text");
            Part::text(text)
        }
    };

    Some(Content::new(ContentRole::User, vec![part]))
}

fn content_text(content: Option<&MessageContent>) -> Option<String> {
    match content? {
        MessageContent::Text(text) => {
            if text.is_empty() {
                None
            } else {
                Some(text.clone())
            }
        }
        MessageContent::Parts(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } if !text.is_empty() => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
    }
}

fn content_parts(content: Option<&MessageContent>) -> Vec<Part> {
    let mut parts = Vec::new();
    match content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                parts.push(Part::text(text.clone()));
            }
        }
        Some(MessageContent::Parts(items)) => {
            for item in items {
                match item {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            parts.push(Part::text(text.clone()));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        match parse_data_url(&image_url.url) {
                            Some((mime, data)) => parts.push(Part::inline_data(mime, data)),
                            None => {
                                // Remote image URLs are not fetched.
                                warn!(url = %image_url.url, "skipping non-data-URI image");
                            }
                        }
                    }
                }
            }
        }
        None => {}
    }
    parts
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    // The mime part may carry extra parameters ("image/png;charset=utf8"),
    // so split on the base64 marker rather than the first semicolon.
    let (mime, data) = rest.split_once(";base64,")?;
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

fn map_tools(tools: Option<&[ToolDefinition]>, enable_search: bool) -> Option<Vec<Tool>> {
    let mut out = Vec::new();

    let declarations = tools
        .map(|tools| {
            let mut used_names: HashSet<String> = HashSet::new();
            tools
                .iter()
                .map(|tool| map_function_declaration(tool, &mut used_names))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if !declarations.is_empty() {
        out.push(Tool {
            function_declarations: Some(declarations),
            google_search: None,
        });
    }

    if enable_search {
        out.push(Tool {
            function_declarations: None,
            google_search: Some(GoogleSearch {}),
        });
    }

    if out.is_empty() { None } else { Some(out) }
}

fn map_function_declaration(
    tool: &ToolDefinition,
    used_names: &mut HashSet<String>,
) -> FunctionDeclaration {
    let name = dedupe_name(sanitize_function_name(&tool.function.name), used_names);

    let parameters = tool.function.parameters.as_ref().map(|schema| {
        let mut sanitized = sanitize_schema(schema);
        if let Some(map) = sanitized.as_object_mut()
            && !map.contains_key("type")
        {
            map.insert("type".to_string(), json!("object"));
        }
        sanitized
    });

    FunctionDeclaration {
        name,
        description: tool.function.description.clone(),
        parameters,
    }
}

/// Restrict declaration names to `[A-Za-z0-9_.:-]{1,64}` starting with a
/// letter or underscore.
fn sanitize_function_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
        .take(MAX_FUNCTION_NAME_LEN)
        .collect();
    let starts_ok = out
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok {
        out.insert(0, '_');
        out.truncate(MAX_FUNCTION_NAME_LEN);
    }
    out
}

fn dedupe_name(name: String, used_names: &mut HashSet<String>) -> String {
    if used_names.insert(name.clone()) {
        return name;
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{name}_{counter}");
        if used_names.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

fn map_tool_choice(choice: Option<&ToolChoice>) -> Option<ToolConfig> {
    let config = match choice {
        Some(ToolChoice::Mode(mode)) => match mode.as_str() {
            "auto" => FunctionCallingConfig {
                mode: FunctionCallingMode::Auto,
                allowed_function_names: None,
            },
            "none" => FunctionCallingConfig {
                mode: FunctionCallingMode::None,
                allowed_function_names: None,
            },
            name => FunctionCallingConfig {
                mode: FunctionCallingMode::Any,
                allowed_function_names: Some(vec![name.to_string()]),
            },
        },
        Some(ToolChoice::Named(named)) => FunctionCallingConfig {
            mode: FunctionCallingMode::Any,
            allowed_function_names: Some(vec![named.function.name.clone()]),
        },
        None => FunctionCallingConfig {
            mode: FunctionCallingMode::Auto,
            allowed_function_names: None,
        },
    };

    Some(ToolConfig {
        function_calling_config: config,
    })
}

fn map_generation_config(
    body: &ChatCompletionRequestBody,
    thinking_budget: Option<i32>,
) -> Option<GenerationConfig> {
    let max_output_tokens = body
        .max_completion_tokens
        .or(body.max_tokens)
        .map(|value| value.max(0) as u32);

    let stop_sequences = match &body.stop {
        Some(StopConfiguration::Single(value)) => Some(vec![value.clone()]),
        Some(StopConfiguration::Many(values)) => Some(values.clone()),
        None => None,
    };

    let thinking_config = thinking_budget.map(|budget| ThinkingConfig {
        thinking_budget: budget,
    });

    if body.temperature.is_none()
        && body.top_p.is_none()
        && max_output_tokens.is_none()
        && stop_sequences.is_none()
        && thinking_config.is_none()
    {
        return None;
    }

    Some(GenerationConfig {
        temperature: body.temperature,
        top_p: body.top_p,
        max_output_tokens,
        stop_sequences,
        candidate_count: None,
        thinking_config,
    })
}
