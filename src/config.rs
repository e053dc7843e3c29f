// src/config.rs
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use anyhow::{Result, Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, debug};

use crate::models::{HeaderBinding, QueueEndpoint, TopicBinding};

pub const CONFIG_FILE_NAME: &str = "FileQueue.json";

// Configuration structures
#[derive(Debug, Serialize, Deserialize)]
pub struct FileQueueConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Topic bindings; absent means topic subscriptions are not configured.
    #[serde(default)]
    pub topics: Option<Vec<TopicBinding>>,
    /// Header bindings; absent means header subscriptions are not configured.
    #[serde(default)]
    pub headers: Option<Vec<HeaderBinding>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_timeout(),
            user: None,
            password: None,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

// Default values
fn default_timeout() -> u64 { 5000 }

// Loading
pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!("Could not find {} configuration file.
        Please create one in the current directory, the config directory,
        or your home directory.", CONFIG_FILE_NAME))
}

pub fn load_config() -> Result<FileQueueConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<FileQueueConfig> {
    let config_content = fs::read_to_string(config_path)
        .context(format!("Failed to read config file at {}", config_path.display()))?;

    let config: FileQueueConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    validate(&config)?;
    Ok(config)
}

fn validate_endpoint(section: &str, index: usize, endpoint: &QueueEndpoint) -> Result<()> {
    endpoint
        .validate()
        .map_err(|e| anyhow!("Configuration error: {}[{}]: {}", section, index, e))
}

/// Checks every binding the way a receive loop would before starting.
pub fn validate(config: &FileQueueConfig) -> Result<()> {
    if config.topics.is_none() && config.headers.is_none() {
        return Err(anyhow!("Configuration error: neither topics nor headers are configured"));
    }

    for (index, topic) in config.topics.iter().flatten().enumerate() {
        validate_endpoint("topics", index, &topic.endpoint)?;
        if topic.routing_key.is_empty() {
            return Err(anyhow!("Configuration error: topics[{}].routing_key cannot be empty", index));
        }
    }

    for (index, header) in config.headers.iter().flatten().enumerate() {
        validate_endpoint("headers", index, &header.endpoint)?;
        if header.destination().is_none() {
            return Err(anyhow!(
                "Configuration error: headers[{}] ({}) has no Destination header",
                index, header.queue_name
            ));
        }
    }

    Ok(())
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let endpoint = QueueEndpoint::new("localhost", "files.headers");
    let default_config = FileQueueConfig {
        connection: ConnectionConfig::default(),
        topics: Some(vec![TopicBinding::new(
            QueueEndpoint::new("localhost", "files.topic"),
            "files.incoming",
        )]),
        headers: Some(vec![HeaderBinding::new(endpoint, "incoming").with_destination("local")]),
    };

    let json = serde_json::to_string_pretty(&default_config)
        .context("Failed to serialize default configuration")?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
