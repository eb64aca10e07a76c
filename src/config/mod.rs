pub mod compile;
pub mod quota;
pub mod types;


pub use compile::{CompiledConfig, CompiledUpstream};
pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ProxyConfig {
    /// Load the configuration document from a file and apply environment
    /// variable overrides for server settings. The document must define at
    /// least one upstream; compilation (`compile::compile`) validates it
    /// before a generation is installed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
        let mut config: ProxyConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        };

        config.apply_env_overrides();
        tracing::info!("config: loaded, path={}", path.display());
        Ok(config)
    }

    /// Environment variable overrides for server/infrastructure settings.
    /// Upstream definitions come exclusively from the document.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("APIMUX_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("APIMUX_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.port = n;
            }
        }
        if let Ok(v) = std::env::var("APIMUX_ADMIN_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.admin_port = n;
            }
        }
        if let Ok(v) = std::env::var("APIMUX_PROXY_AUTH_KEYS") {
            self.server.proxy_auth_keys =
                v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = std::env::var("APIMUX_OUTBOUND_PROXY") {
            self.server.outbound_proxy = if v.is_empty() { None } else { Some(v) };
        }
    }
}
