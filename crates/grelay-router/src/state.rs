use std::sync::Arc;

use grelay_core::settings::SettingsStore;
use grelay_core::{GenerateBackend, OpenAiCompatBackend};

pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub direct: Arc<dyn GenerateBackend>,
    pub vertex: Option<Arc<dyn OpenAiCompatBackend>>,
}

impl AppState {
    pub fn new(
        settings: Arc<SettingsStore>,
        direct: Arc<dyn GenerateBackend>,
        vertex: Option<Arc<dyn OpenAiCompatBackend>>,
    ) -> Self {
        Self {
            settings,
            direct,
            vertex,
        }
    }
}
