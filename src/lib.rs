pub mod route;
pub mod server;
pub mod transport;

use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub use server::HttpServer;
pub use transport::{Packet, Session, TransportError};

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4022;

/// Process configuration, loaded from a TOML file and/or the command line.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Interface multicast groups are joined on (name or IPv4 address).
    #[serde(default)]
    pub interface: String,
    /// HTTP listen address (default: 127.0.0.1)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// HTTP listen port (default: 4022)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Log level (info, debug, etc.)
    pub log_level: Option<String>,
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: String::new(),
            listen_address: default_listen_address(),
            port: default_port(),
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interface.is_empty() {
            bail!("Missing required parameter: multicast interface");
        }
        if self.port == 0 {
            bail!("Missing or invalid required parameter: port");
        }
        Ok(())
    }

    /// `address:port` the HTTP server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}
