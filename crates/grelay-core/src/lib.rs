pub mod backend;
pub mod catalog;
pub mod error;
pub mod keepalive;
pub mod keypool;
pub mod settings;

pub use backend::{BackendBody, BackendError, BackendReply, GenerateBackend, OpenAiCompatBackend};
pub use catalog::{BackendKind, ModelRoute, list_model_ids, resolve_model};
pub use error::GatewayError;
pub use keepalive::KeepAliveHandle;
pub use keypool::KeyPool;
pub use settings::{ModelCategory, ModelEntry, Settings, SettingsError, SettingsStore};
