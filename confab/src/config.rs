use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use confab_sfu::{
    ChannelId, ChannelRecord, MemoryChannelStore, RoomId, RoomRecord, SfuConfig,
};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
    /// Channels and rooms served by this process
    pub channels: Vec<ChannelSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            sfu: SfuConfig::default(),
            channels: vec![ChannelSeed {
                id: "lobby".to_string(),
                name: "Lobby".to_string(),
                rooms: vec![RoomSeed {
                    id: "general".to_string(),
                    name: "General".to_string(),
                }],
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSeed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rooms: Vec<RoomSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSeed {
    pub id: String,
    pub name: String,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with(config_file, environment())
    }

    fn load_with(config_file: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        let config = builder.add_source(env).build()?;
        config.try_deserialize()
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Build the in-memory channel directory from the configured seeds
    pub fn channel_store(&self) -> confab_sfu::Result<MemoryChannelStore> {
        let store = MemoryChannelStore::new();
        for channel in &self.channels {
            let channel_id = ChannelId::new(channel.id.clone());
            store.insert_channel(ChannelRecord {
                id: channel_id.clone(),
                name: channel.name.clone(),
            });
            for room in &channel.rooms {
                store.insert_room(RoomRecord {
                    id: RoomId::new(room.id.clone()),
                    name: room.name.clone(),
                    channel_id: channel_id.clone(),
                })?;
            }
        }
        Ok(store)
    }
}

/// Environment overrides: `CONFAB_SERVER__PORT`, `CONFAB_SFU__MAX_CONVERGENCE_ATTEMPTS`, ...
///
/// Sections are split on a double underscore so field names keep theirs.
fn environment() -> Environment {
    Environment::with_prefix("CONFAB")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
