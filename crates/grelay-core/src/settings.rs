//! Runtime settings loaded from the settings file.
//!
//! Reads go through an [`arc_swap::ArcSwap`] so request handlers never take
//! a lock; a reload swaps the whole snapshot in one store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelCategory {
    Pro,
    Flash,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub category: ModelCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_quota: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub individual_quota: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientKeySettings {
    /// Per-key override of the global safety default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_filtering: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexSettings {
    #[serde(default)]
    pub enabled: bool,
    pub project_id: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub models: Vec<String>,
    pub service_account: ServiceAccount,
}

fn default_location() -> String {
    "us-central1".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Client API keys accepted by the gateway, with per-key overrides.
    #[serde(default)]
    pub client_keys: BTreeMap<String, ClientKeySettings>,
    /// Gemini API keys forming the upstream pool.
    #[serde(default)]
    pub gemini_api_keys: Vec<String>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
    #[serde(default = "default_true")]
    pub keepalive_enabled: bool,
    #[serde(default)]
    pub web_search_enabled: bool,
    #[serde(default = "default_true")]
    pub safety_filtering_default: bool,
    /// Model families whose system prompts must travel inline as user turns.
    #[serde(default = "default_no_system_families")]
    pub system_instruction_unsupported: Vec<String>,
    #[serde(default)]
    pub vertex: Option<VertexSettings>,
    #[serde(default)]
    pub embedding_model: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_keys: BTreeMap::new(),
            gemini_api_keys: Vec::new(),
            models: BTreeMap::new(),
            keepalive_enabled: true,
            web_search_enabled: false,
            safety_filtering_default: true,
            system_instruction_unsupported: default_no_system_families(),
            vertex: None,
            embedding_model: None,
        }
    }
}

fn default_no_system_families() -> Vec<String> {
    vec!["gemma".to_string()]
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn is_client_key(&self, key: &str) -> bool {
        self.client_keys.contains_key(key)
    }

    /// Safety filtering for one client key, falling back to the default.
    pub fn safety_filtering_for(&self, key: &str) -> bool {
        self.client_keys
            .get(key)
            .and_then(|entry| entry.safety_filtering)
            .unwrap_or(self.safety_filtering_default)
    }

    pub fn model_supports_system_instruction(&self, model: &str) -> bool {
        let model = model.to_ascii_lowercase();
        !self
            .system_instruction_unsupported
            .iter()
            .any(|family| model.contains(family.as_str()))
    }

    pub fn vertex_enabled(&self) -> bool {
        self.vertex.as_ref().is_some_and(|vertex| vertex.enabled)
    }

    pub fn vertex_models(&self) -> &[String] {
        self.vertex
            .as_ref()
            .map(|vertex| vertex.models.as_slice())
            .unwrap_or_default()
    }
}

pub struct SettingsStore {
    inner: ArcSwap<Settings>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: ArcSwap::from_pointee(settings),
        }
    }

    pub fn load(&self) -> Arc<Settings> {
        self.inner.load_full()
    }

    pub fn replace(&self, settings: Settings) {
        self.inner.store(Arc::new(settings));
    }

    pub fn reload_from(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let settings = Settings::from_file(path)?;
        self.replace(settings);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_json() -> &'static str {
        r#"{
            "client_keys": {
                "sk-open": {},
                "sk-raw": {"safety_filtering": false}
            },
            "gemini_api_keys": ["k1", "k2"],
            "models": {
                "gemini-2.5-flash-preview": {"category": "Flash", "daily_quota": 1500},
                "gemma-3-27b-it": {"category": "Custom"}
            },
            "web_search_enabled": true
        }"#
    }

    #[test]
    fn parses_and_applies_defaults() {
        let settings: Settings = serde_json::from_str(settings_json()).unwrap();
        assert!(settings.keepalive_enabled);
        assert!(settings.safety_filtering_default);
        assert!(settings.web_search_enabled);
        assert_eq!(settings.system_instruction_unsupported, vec!["gemma"]);
        assert_eq!(
            settings.models["gemini-2.5-flash-preview"].category,
            ModelCategory::Flash
        );
    }

    #[test]
    fn per_key_safety_overrides_default() {
        let settings: Settings = serde_json::from_str(settings_json()).unwrap();
        assert!(settings.safety_filtering_for("sk-open"));
        assert!(!settings.safety_filtering_for("sk-raw"));
        assert!(settings.safety_filtering_for("unknown"));
    }

    #[test]
    fn gemma_family_has_no_system_instruction() {
        let settings: Settings = serde_json::from_str(settings_json()).unwrap();
        assert!(settings.model_supports_system_instruction("gemini-2.5-flash-preview"));
        assert!(!settings.model_supports_system_instruction("gemma-3-27b-it"));
    }

    #[test]
    fn store_swaps_snapshots() {
        let store = SettingsStore::new(Settings::default());
        assert!(!store.load().web_search_enabled);
        let mut next = Settings::default();
        next.web_search_enabled = true;
        store.replace(next);
        assert!(store.load().web_search_enabled);
    }
}
