use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::ServerError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_line_length: usize,
    pub max_nick_length: usize,
    pub max_channel_name_length: usize,
    pub max_send_queue: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_line_length: 4096,
            max_nick_length: 50,
            max_channel_name_length: 200,
            max_send_queue: 256,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            network: NetworkConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Loads and parses the TOML configuration file. Every field is
    /// defaulted, so a missing or partially-populated file is not an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ServerError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| ServerError::Config(format!("failed to parse config file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.network.port, 8080);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.limits.max_line_length, 4096);
        assert_eq!(cfg.limits.max_nick_length, 50);
        assert_eq!(cfg.limits.max_channel_name_length, 200);
        assert_eq!(cfg.limits.max_send_queue, 256);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: Config = toml::from_str("[network]\nport = 6667\n").unwrap();
        assert_eq!(cfg.network.port, 6667);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.server.name, "server");
    }
}
