use std::path::PathBuf;

use clap::Parser;
use grelay_common::GlobalConfigPatch;

#[derive(Parser)]
#[command(name = "grelay", about = "Gemini streaming proxy that resumes interrupted answers")]
pub(crate) struct Cli {
    /// JSON config file; CLI flags and env vars take precedence over it.
    #[arg(long, env = "GRELAY_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, env = "GRELAY_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "GRELAY_PORT")]
    pub(crate) port: Option<u16>,
    /// Base URL of the generation API.
    #[arg(long, env = "GRELAY_UPSTREAM")]
    pub(crate) upstream: Option<String>,
    #[arg(long, env = "GRELAY_PROXY")]
    pub(crate) proxy: Option<String>,
    #[arg(long, env = "GRELAY_MAX_RETRIES")]
    pub(crate) max_retries: Option<u32>,
    #[arg(long, env = "GRELAY_BASE_DELAY_MS")]
    pub(crate) base_delay_ms: Option<u64>,
    #[arg(long, env = "GRELAY_SWALLOW_THOUGHTS")]
    pub(crate) swallow_thoughts: Option<bool>,
    #[arg(long, env = "GRELAY_FINISH_TOKEN")]
    pub(crate) finish_token: Option<String>,
}

impl Cli {
    pub(crate) fn to_patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host.clone(),
            port: self.port,
            upstream_base_url: self.upstream.clone(),
            proxy: self.proxy.clone(),
            recovery: None,
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            swallow_thoughts_after_retry: self.swallow_thoughts,
            finish_token: self.finish_token.clone(),
        }
    }
}
