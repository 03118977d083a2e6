//! Virtual model synthesis and request dispatch.
//!
//! The catalog is recomputed from the settings snapshot on every call so the
//! `GET /v1/models` listing and request validation can never drift apart.

use crate::error::GatewayError;
use crate::settings::Settings;

pub const VERTEX_PREFIX: &str = "[v]";
pub const SEARCH_SUFFIX: &str = "-search";
pub const NON_THINKING_SUFFIX: &str = ":non-thinking";

const NON_THINKING_FAMILY_MARKER: &str = "2.5-flash-preview";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Direct,
    Vertex,
}

/// Where and how a requested model id is served.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRoute {
    pub backend: BackendKind,
    /// Model id sent upstream, virtual affixes removed.
    pub upstream_model: String,
    /// Requested id, echoed back in response `model` fields.
    pub client_model: String,
    pub thinking_budget: Option<i32>,
    pub enable_search: bool,
}

/// All model ids the gateway will accept, configured and synthesized.
pub fn list_model_ids(settings: &Settings) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();

    for id in settings.models.keys() {
        ids.push(id.clone());
        if settings.web_search_enabled
            && has_modern_version_segment(id)
            && !id.ends_with(SEARCH_SUFFIX)
        {
            ids.push(format!("{id}{SEARCH_SUFFIX}"));
        }
        if id.contains(NON_THINKING_FAMILY_MARKER) && !id.ends_with(NON_THINKING_SUFFIX) {
            ids.push(format!("{id}{NON_THINKING_SUFFIX}"));
        }
    }

    if settings.vertex_enabled() {
        for id in settings.vertex_models() {
            ids.push(format!("{VERTEX_PREFIX}{id}"));
        }
    }

    ids
}

pub fn resolve_model(settings: &Settings, requested: &str) -> Result<ModelRoute, GatewayError> {
    if !list_model_ids(settings).iter().any(|id| id == requested) {
        return Err(GatewayError::invalid_request(format!(
            "model '{requested}' does not exist"
        )));
    }

    if let Some(vertex_model) = requested.strip_prefix(VERTEX_PREFIX) {
        return Ok(ModelRoute {
            backend: BackendKind::Vertex,
            upstream_model: vertex_model.to_string(),
            client_model: requested.to_string(),
            thinking_budget: None,
            enable_search: false,
        });
    }

    let mut upstream_model = requested.to_string();
    let mut thinking_budget = None;
    let mut enable_search = false;

    if let Some(base) = upstream_model.strip_suffix(NON_THINKING_SUFFIX)
        && settings.models.contains_key(base)
    {
        upstream_model = base.to_string();
        thinking_budget = Some(0);
    }

    if let Some(base) = upstream_model.strip_suffix(SEARCH_SUFFIX)
        && settings.models.contains_key(base)
    {
        upstream_model = base.to_string();
        enable_search = true;
    }

    Ok(ModelRoute {
        backend: BackendKind::Direct,
        upstream_model,
        client_model: requested.to_string(),
        thinking_budget,
        enable_search,
    })
}

/// True when the id carries a `-<major>.<minor>` version segment with a
/// major of 2 through 9 (the generations with a search tool).
fn has_modern_version_segment(id: &str) -> bool {
    let bytes = id.as_bytes();
    bytes.windows(4).any(|window| {
        window[0] == b'-'
            && (b'2'..=b'9').contains(&window[1])
            && window[2] == b'.'
            && window[3].is_ascii_digit()
    })
}
