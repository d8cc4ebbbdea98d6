//! Host configuration.
//!
//! A TOML file lists the servers the host should connect to, one
//! `[[servers]]` table per server:
//!
//! ```toml
//! [[servers]]
//! id = "pantry"
//! transport = "stdio"
//! command = "pantry-server"
//! args = ["--fresh"]
//!
//! [[servers]]
//! id = "grill"
//! transport = "http"
//! base_url = "https://grill.example.com/rpc"
//! ```

use crate::error::HostError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Stable configured name. Display/diagnostic identity only; routing uses
    /// the arena handle assigned at connect time.
    pub id: String,
    /// "stdio" or "http". Defaults to "http" when absent.
    pub transport: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub base_url: Option<String>,
    pub enabled: Option<bool>,
}

impl ServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl HostConfig {
    pub fn parse(text: &str) -> Result<Self, HostError> {
        toml::from_str(text).map_err(|err| HostError::Transport {
            server: "<config>".to_string(),
            details: format!("invalid config: {err}"),
        })
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        let text = std::fs::read_to_string(path).map_err(|err| HostError::Transport {
            server: "<config>".to_string(),
            details: format!("cannot read {}: {err}", path.display()),
        })?;
        Self::parse(&text)
    }

    /// The servers worth connecting to.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|server| server.is_enabled())
    }
}
