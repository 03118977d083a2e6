use clap::Parser;

use grelay_common::GlobalConfigPatch;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "grelay",
    version,
    about = "OpenAI-compatible gateway for Gemini backends"
)]
pub(crate) struct Cli {
    /// Optional JSON file with a global config layer (overridden by CLI/ENV).
    #[arg(long, env = "GRELAY_CONFIG")]
    pub(crate) config: Option<String>,

    /// Bind host.
    #[arg(long, env = "GRELAY_HOST")]
    pub(crate) host: Option<String>,

    /// Bind port.
    #[arg(long, env = "GRELAY_PORT")]
    pub(crate) port: Option<u16>,

    /// Settings file holding models, keys and runtime toggles.
    #[arg(long, env = "GRELAY_SETTINGS")]
    pub(crate) settings_path: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "GRELAY_PROXY")]
    pub(crate) proxy: Option<String>,
}

impl Cli {
    pub(crate) fn to_patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host.clone(),
            port: self.port,
            settings_path: self.settings_path.clone(),
            proxy: self.proxy.clone(),
        }
    }
}
