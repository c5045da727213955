//! Configuration (modhost-config.toml)
//!
//! Handles loading, saving, and providing defaults for host settings.
//! Settings are stored in TOML format, either next to the working directory
//! or in the platform-specific config directory.
//!
//! The core consumes this surface; it is populated by the surrounding
//! launcher, which is an external collaborator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Host configuration.
///
/// Organized into sections mirroring the subsystems that consume them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Image selection, patching, and role flags
    #[serde(default)]
    pub modhost: ModhostConfig,
    /// Session host settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Participant settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// Image selection, patch artifact, and role flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModhostConfig {
    /// Selected image identifier (resolved by the launcher)
    #[serde(default)]
    pub image: String,
    /// Path to a patch artifact to embed in the session ("" for none)
    #[serde(default)]
    pub patch: String,
    /// Core override identifier; short-circuits fingerprint matching
    #[serde(default)]
    pub core_override: String,
    /// Whether to run the session host (default: true)
    #[serde(default = "default_true")]
    pub is_server: bool,
    /// Whether to run a participant (default: true)
    #[serde(default = "default_true")]
    pub is_client: bool,
}

/// Session host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on (default: 8082)
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Participant configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host address (default: 127.0.0.1)
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Host port; 0 follows an in-process host (default: 8082)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Display name (default: "Player")
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// Session name to join or create (default: generated)
    #[serde(default = "default_session")]
    pub session: String,
    /// Join passphrase (default: open session)
    #[serde(default)]
    pub passphrase: String,
}

fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8082
}
fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_nickname() -> String {
    "Player".to_string()
}
fn default_session() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("session-{}", &id[..8])
}

impl Default for ModhostConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            patch: String::new(),
            core_override: String::new(),
            is_server: default_true(),
            is_client: default_true(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            nickname: default_nickname(),
            session: default_session(),
            passphrase: String::new(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config '{}'", path.display()))
    }

    /// Save as TOML, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write config '{}'", path.display()))
    }

    /// Platform config file location (~/.config/modhost/config.toml or
    /// equivalent).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "modhost")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_seeded() {
        let config = Config::default();
        assert!(config.modhost.is_server);
        assert!(config.modhost.is_client);
        assert_eq!(config.server.port, 8082);
        assert_eq!(config.client.ip, "127.0.0.1");
        assert_eq!(config.client.nickname, "Player");
        assert!(config.client.session.starts_with("session-"));
        assert!(config.client.passphrase.is_empty());
    }

    #[test]
    fn empty_document_parses_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8082);
        assert!(config.modhost.core_override.is_empty());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            nickname = "Ana"
            "#,
        )
        .unwrap();
        assert_eq!(config.client.nickname, "Ana");
        assert_eq!(config.client.port, 8082);
        assert_eq!(config.server.port, 8082);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.modhost.core_override = "custom-core".to_string();
        config.client.session = "alpha".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.server.port, 8082);
    }
}
