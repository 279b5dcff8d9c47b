use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Socket name under the per-user directory when `-S` is not given.
    pub socket_name: String,
    /// Command used to start a server when none is running. The socket path
    /// is appended as the final argument.
    pub server_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
            server_command: default_server_command(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    socket: RawSocketConfig,
    #[serde(default)]
    server: RawServerConfig,
}

#[derive(Deserialize)]
struct RawSocketConfig {
    #[serde(default = "default_socket_name")]
    name: String,
}

impl Default for RawSocketConfig {
    fn default() -> Self {
        Self {
            name: default_socket_name(),
        }
    }
}

fn default_socket_name() -> String {
    "default".into()
}

#[derive(Deserialize)]
struct RawServerConfig {
    #[serde(default = "default_server_command")]
    command: Vec<String>,
}

impl Default for RawServerConfig {
    fn default() -> Self {
        Self {
            command: default_server_command(),
        }
    }
}

fn default_server_command() -> Vec<String> {
    vec!["rmx-server".into()]
}

pub fn config_path() -> PathBuf {
    dirs_config_path().unwrap_or_else(|| PathBuf::from("~/.config/rmx/config.toml"))
}

fn dirs_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/rmx/config.toml"))
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("parse error: {e}")))?;
        if raw.socket.name.is_empty() || raw.socket.name.contains('/') {
            return Err(Error::Config(format!(
                "invalid socket name: {:?}",
                raw.socket.name
            )));
        }
        if raw.server.command.is_empty() {
            return Err(Error::Config("server command is empty".into()));
        }
        Ok(Self {
            socket_name: raw.socket.name,
            server_command: raw.server.command,
        })
    }
}
