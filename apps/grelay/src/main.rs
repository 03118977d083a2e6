use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grelay_common::GlobalConfigPatch;
use grelay_core::backend::{
    DirectBackend, UpstreamClientConfig, VertexBackend, build_http_client,
};
use grelay_core::settings::{Settings, SettingsStore};
use grelay_core::{GenerateBackend, KeyPool, OpenAiCompatBackend};
use grelay_router::AppState;

mod cli;

const DEFAULT_SETTINGS_PATH: &str = "settings.json";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();

    let mut merged = match args.config.as_deref() {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config file {path}"))?;
            serde_json::from_str::<GlobalConfigPatch>(&raw)
                .with_context(|| format!("parse config file {path}"))?
        }
        None => GlobalConfigPatch::default(),
    };
    merged.overlay(args.to_patch());
    if merged.settings_path.is_none() {
        merged.settings_path = Some(DEFAULT_SETTINGS_PATH.to_string());
    }
    let global = merged.into_config().context("finalize global config")?;

    let settings = Settings::from_file(&global.settings_path)
        .with_context(|| format!("load settings from {}", global.settings_path))?;
    let store = Arc::new(SettingsStore::new(settings));
    let snapshot = store.load();

    let client = build_http_client(&UpstreamClientConfig::from_global(&global))
        .context("build upstream http client")?;
    let pool = Arc::new(KeyPool::new(snapshot.gemini_api_keys.clone()));
    info!(
        keys = snapshot.gemini_api_keys.len(),
        models = snapshot.models.len(),
        "loaded settings"
    );

    let direct: Arc<dyn GenerateBackend> = Arc::new(DirectBackend::new(client.clone(), pool));
    let vertex: Option<Arc<dyn OpenAiCompatBackend>> = snapshot
        .vertex
        .clone()
        .filter(|vertex| vertex.enabled)
        .map(|config| {
            Arc::new(VertexBackend::new(client.clone(), config)) as Arc<dyn OpenAiCompatBackend>
        });

    let state = Arc::new(AppState::new(store, direct, vertex));
    let app = grelay_router::router(state);

    let bind = format!("{}:{}", global.host, global.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
