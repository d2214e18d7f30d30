//! Tunnel list shared by the relay and the agent

use anyhow::{Context, Result};
use gtunnel_tunnel::TunnelConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Contents of the YAML file passed with `--config`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl ConfigFile {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: ConfigFile =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tunnels.is_empty() {
            anyhow::bail!("No tunnels configured");
        }

        let mut ids = HashSet::new();
        for tunnel in &self.tunnels {
            if tunnel.id.is_empty() {
                anyhow::bail!("Tunnel id must not be empty");
            }
            if !ids.insert(tunnel.id.as_str()) {
                anyhow::bail!("Duplicate tunnel id: {}", tunnel.id);
            }
        }

        Ok(())
    }
}
