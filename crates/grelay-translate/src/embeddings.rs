//! Gemini embedding responses → OpenAI embedding list form.

use grelay_protocol::gemini::embed_content::EmbedContentResponse;
use grelay_protocol::openai::embeddings::{
    EmbeddingInput, EmbeddingObject, EmbeddingResponse, EmbeddingUsage,
};

const MIN_INPUT_CHARS: usize = 5;

/// A request is usable when it carries a string of at least five characters,
/// or any sequence element that does.
pub fn input_is_valid(input: &EmbeddingInput) -> bool {
    match input {
        EmbeddingInput::Text(text) => text.trim().chars().count() >= MIN_INPUT_CHARS,
        EmbeddingInput::Many(items) => items
            .iter()
            .any(|text| text.trim().chars().count() >= MIN_INPUT_CHARS),
    }
}

pub fn translate_embedding_response(
    upstream: &EmbedContentResponse,
    model: &str,
) -> EmbeddingResponse {
    if let Some(embeddings) = &upstream.embeddings {
        let data = embeddings
            .iter()
            .enumerate()
            .map(|(index, embedding)| EmbeddingObject {
                object: "embedding".to_string(),
                embedding: embedding.values.clone(),
                index: index as i64,
            })
            .collect();
        return list_response(model, data, None);
    }

    if let Some(embedding) = &upstream.embedding {
        let data = vec![EmbeddingObject {
            object: "embedding".to_string(),
            embedding: embedding.values.clone(),
            index: 0,
        }];
        return list_response(model, data, None);
    }

    list_response(
        model,
        Vec::new(),
        Some("unrecognized upstream embedding response".to_string()),
    )
}

pub fn short_input_response(model: &str) -> EmbeddingResponse {
    list_response(
        model,
        Vec::new(),
        Some(format!(
            "input must contain at least {MIN_INPUT_CHARS} characters"
        )),
    )
}

fn list_response(
    model: &str,
    data: Vec<EmbeddingObject>,
    error: Option<String>,
) -> EmbeddingResponse {
    EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: model.to_string(),
        usage: EmbeddingUsage::default(),
        error,
    }
}
