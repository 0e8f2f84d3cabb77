//! Configuration management for the battle server binary.
//!
//! This module handles loading, validation, and conversion of server configuration
//! from TOML files and command-line arguments.

use crate::cli::CliArgs;
use anyhow::{bail, Context};
use battle_server::{ServerConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Network and session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Interface to listen on (e.g., "0.0.0.0")
    pub bind_address: String,
    pub port: u16,
    /// Socket backend: "native" or "reactor"
    pub transport: String,
    /// Size of the connection id space
    pub max_connections: u32,
    /// Abort a battle as soon as either player disconnects
    pub close_on_disconnect: bool,
    /// Seconds a vacated seat waits for a rejoin
    pub disconnect_grace_secs: u64,
    /// Milliseconds a terminated battle task gets to stop
    pub terminate_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 5096,
            transport: "native".to_string(),
            max_connections: 1000,
            close_on_disconnect: true,
            disconnect_grace_secs: 30,
            terminate_grace_ms: 2000,
        }
    }
}

/// Backing store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store selected at startup
    pub backing_store: String,
    /// Stores the console may switch to; empty allows any
    pub available: Vec<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backing_store: "sqlite".to_string(),
            available: vec!["sqlite".to_string(), "postgresql".to_string()],
        }
    }
}

/// Plugin system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Directory path where plugin libraries are located
    pub directory: String,
    /// Plugins loaded on startup, by name, in order
    pub auto_load: Vec<String>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            directory: "plugins".to_string(),
            auto_load: Vec::new(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration is written to `path`
    /// and returned. The flag is true when the file was created; this runs
    /// before logging is set up, so reporting that is left to the caller.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<(Self, bool)> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok((config, false))
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            Ok((default_config, true))
        }
    }

    /// Applies command-line overrides on top of the file settings.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(bind) = &args.bind_address {
            self.server.bind_address = bind.clone();
        }
        if let Some(transport) = &args.transport {
            self.server.transport = transport.clone();
        }
        if let Some(store) = &args.store {
            self.store.backing_store = store.clone();
        }
        if let Some(dir) = &args.plugin_dir {
            self.plugins.directory = dir.to_string_lossy().to_string();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        if args.keep_battles {
            self.server.close_on_disconnect = false;
        }
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.bind_address.parse::<IpAddr>().is_err() {
            bail!("Invalid bind address: {}", self.server.bind_address);
        }
        if let Err(e) = self.server.transport.parse::<TransportKind>() {
            bail!("{e}");
        }
        if self.server.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }

        let store = self.store.backing_store.trim();
        if store.is_empty() {
            bail!("Backing store name cannot be empty");
        }
        if !self.store.available.is_empty()
            && !self
                .store
                .available
                .iter()
                .any(|s| s.eq_ignore_ascii_case(store))
        {
            bail!(
                "Backing store {} is not one of {:?}",
                store,
                self.store.available
            );
        }

        if self.plugins.directory.is_empty() {
            bail!("Plugin directory cannot be empty");
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {VALID_LEVELS:?}",
                self.logging.level
            );
        }

        Ok(())
    }

    /// Converts to the library's [`ServerConfig`]. Call [`validate`](Self::validate) first.
    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        let transport = self
            .server
            .transport
            .parse::<TransportKind>()
            .map_err(anyhow::Error::msg)?;

        Ok(ServerConfig {
            bind_address: self
                .server
                .bind_address
                .parse()
                .with_context(|| format!("bind address {}", self.server.bind_address))?,
            port: self.server.port,
            close_on_disconnect: self.server.close_on_disconnect,
            backing_store: self.store.backing_store.trim().to_string(),
            available_stores: self.store.available.clone(),
            transport,
            max_connections: self.server.max_connections,
            disconnect_grace: Duration::from_secs(self.server.disconnect_grace_secs),
            terminate_grace: Duration::from_millis(self.server.terminate_grace_ms),
            plugin_directory: PathBuf::from(&self.plugins.directory),
            auto_load: self.plugins.auto_load.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.port, 5096);
        assert_eq!(server_config.transport, TransportKind::Native);
        assert_eq!(server_config.backing_store, "sqlite");
        assert!(server_config.close_on_disconnect);
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("battleserver.toml");

        let (config, created) = AppConfig::load_from_file(&path).await.unwrap();
        assert!(created);
        assert_eq!(config.server.port, 5096);
        assert!(path.exists());

        let (reloaded, created) = AppConfig::load_from_file(&path).await.unwrap();
        assert!(!created);
        assert_eq!(reloaded.store.available, config.store.available);
    }

    #[tokio::test]
    async fn partial_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("battleserver.toml");
        tokio::fs::write(
            &path,
            r#"
[server]
port = 7000
transport = "reactor"

[plugins]
auto_load = ["plugin_logger"]
"#,
        )
        .await
        .unwrap();

        let (config, created) = AppConfig::load_from_file(&path).await.unwrap();
        assert!(!created);
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.plugins.directory, "plugins");
        assert_eq!(config.plugins.auto_load, vec!["plugin_logger"]);
        assert_eq!(config.logging.level, "info");

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.transport, TransportKind::Reactor);
    }

    #[test]
    fn invalid_settings_are_reported() {
        let mut config = AppConfig::default();
        config.server.bind_address = "not-an-ip".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("bind address"));

        let mut config = AppConfig::default();
        config.server.transport = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.backing_store = "mysql".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("mysql"));

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn cli_overrides_file_settings() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            port: Some(6001),
            transport: Some("mio".to_string()),
            store: Some("postgresql".to_string()),
            json_logs: true,
            keep_battles: true,
            ..CliArgs::default()
        };
        config.apply_cli(&args);

        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 6001);
        assert!(config.logging.json_format);

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.transport, TransportKind::Reactor);
        assert_eq!(server_config.backing_store, "postgresql");
        assert!(!server_config.close_on_disconnect);
    }
}
