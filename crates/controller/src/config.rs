//! Configuration management for the controller binary.
//!
//! This module handles loading, validation, and conversion of the controller
//! configuration from its TOML file and command-line overrides.

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use controller_core::{ControllerConfig, MemoryCollaborators, User};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Length of generated signing secrets, in bytes
const SECRET_LENGTH: usize = 32;

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_session_timeout_ms() -> u64 {
    60_000
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    1000
}

fn default_stats_interval_secs() -> u64 {
    60
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and session timers
    pub controller: ControllerSettings,
    /// Token signing
    #[serde(default)]
    pub auth: AuthSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
    /// Users allowed to connect control clients
    #[serde(default)]
    pub users: Vec<UserSettings>,
    /// Static instance to host placement
    #[serde(default)]
    pub instances: Vec<InstanceAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Network address to bind the controller to (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long a dropped session may take to resume
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Maximum number of concurrent raw connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Interval of the periodic statistics log line (0 to disable)
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Base64 encoded token signing secret. Generated when empty.
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAssignment {
    pub id: u32,
    pub host: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            controller: ControllerSettings {
                bind_address: "127.0.0.1:8080".to_string(),
                heartbeat_interval_ms: default_heartbeat_interval_ms(),
                session_timeout_ms: default_session_timeout_ms(),
                handshake_timeout_ms: default_handshake_timeout_ms(),
                request_timeout_ms: default_request_timeout_ms(),
                max_connections: default_max_connections(),
                stats_interval_secs: default_stats_interval_secs(),
            },
            auth: AuthSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
            users: vec![UserSettings {
                name: "admin".to_string(),
                roles: vec![],
                permissions: vec![],
                is_admin: true,
            }],
            instances: vec![],
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// A missing file is created with the defaults. A missing signing secret
    /// is generated and written back, so tokens stay valid across restarts.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            info!("Creating default configuration file: {}", path.display());
            AppConfig::default()
        };

        if config.auth.secret.is_empty() {
            config.auth.secret = generate_secret();
            config.save(path).await?;
        }
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// The decoded token signing secret.
    pub fn secret_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let secret = STANDARD
            .decode(self.auth.secret.trim())
            .context("auth.secret is not valid base64")?;
        if secret.is_empty() {
            bail!("auth.secret is empty");
        }
        Ok(secret)
    }

    pub fn to_controller_config(&self) -> anyhow::Result<ControllerConfig> {
        let bind_address = self
            .controller
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.controller.bind_address))?;

        Ok(ControllerConfig {
            bind_address,
            heartbeat_interval_ms: self.controller.heartbeat_interval_ms,
            session_timeout_ms: self.controller.session_timeout_ms,
            handshake_timeout_ms: self.controller.handshake_timeout_ms,
            request_timeout_ms: self.controller.request_timeout_ms,
            max_connections: self.controller.max_connections,
            ..ControllerConfig::default()
        })
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> anyhow::Result<()> {
        let controller = self.to_controller_config()?;
        if let Err(e) = controller.validate() {
            bail!("Invalid controller settings: {e}");
        }
        self.secret_bytes()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                self.logging.level
            );
        }

        let mut names = HashSet::new();
        for user in &self.users {
            if user.name.is_empty() {
                bail!("User names cannot be empty");
            }
            if !names.insert(user.name.as_str()) {
                bail!("User {} is configured twice", user.name);
            }
        }

        let mut instances = HashSet::new();
        for instance in &self.instances {
            if !instances.insert(instance.id) {
                bail!("Instance {} is assigned twice", instance.id);
            }
        }
        Ok(())
    }

    /// Loads the configured users and instance placement into the in-memory
    /// collaborators.
    pub fn seed(&self, memory: &MemoryCollaborators) {
        for settings in &self.users {
            let mut user = User::new(&settings.name);
            for role in &settings.roles {
                user = user.with_role(role);
            }
            for permission in &settings.permissions {
                user = user.with_permission(permission);
            }
            if settings.is_admin {
                user = user.as_admin();
            }
            memory.users.insert(user);
        }
        for instance in &self.instances {
            memory.instances.assign(instance.id, instance.host);
        }
    }
}

fn generate_secret() -> String {
    let mut secret = [0u8; SECRET_LENGTH];
    rand::thread_rng().fill_bytes(&mut secret);
    STANDARD.encode(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_core::{Collaborators, CONNECT_PERMISSION};
    use tempfile::tempdir;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.auth.secret = generate_secret();
        config
    }

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.controller.bind_address, "127.0.0.1:8080");
        assert_eq!(config.controller.heartbeat_interval_ms, 15_000);
        assert_eq!(config.controller.session_timeout_ms, 60_000);
        assert_eq!(config.logging.level, "info");
        assert!(config.auth.secret.is_empty());
        assert_eq!(config.users.len(), 1);
        assert!(config.users[0].is_admin);
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_creates_it_with_secret() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("controller.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.secret_bytes().unwrap().len(), SECRET_LENGTH);

        // Loading again keeps the same secret
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.auth.secret, config.auth.secret);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[controller]
bind_address = "0.0.0.0:3000"
session_timeout_ms = 90000
max_connections = 50

[auth]
secret = "c2VjcmV0IGtleQ=="

[logging]
level = "debug"
json_format = true

[[users]]
name = "alice"
roles = ["operator"]
permissions = ["core.control.connect", "core.host.list"]

[[instances]]
id = 12
host = 3
"#;
        let dir = tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        tokio::fs::write(&path, toml_content).await.unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.controller.bind_address, "0.0.0.0:3000");
        assert_eq!(config.controller.session_timeout_ms, 90_000);
        assert_eq!(config.controller.heartbeat_interval_ms, 15_000);
        assert_eq!(config.controller.max_connections, 50);
        assert_eq!(config.secret_bytes().unwrap(), b"secret key".to_vec());
        assert!(config.logging.json_format);
        assert_eq!(config.users[0].permissions.len(), 2);
        assert_eq!(config.instances, vec![InstanceAssignment { id: 12, host: 3 }]);
    }

    #[test]
    fn test_to_controller_config_conversion() {
        let mut config = valid_config();
        config.controller.bind_address = "192.168.1.100:8080".to_string();
        config.controller.request_timeout_ms = 5_000;

        let controller = config.to_controller_config().unwrap();
        assert_eq!(controller.bind_address.to_string(), "192.168.1.100:8080");
        assert_eq!(controller.request_timeout_ms, 5_000);
        assert_eq!(controller.max_connections, 1000);
    }

    #[test]
    fn test_validation() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.controller.bind_address = "invalid_address".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.logging.level = "loud".to_string();
        let error = config.validate().unwrap_err().to_string();
        assert!(error.contains("Invalid log level"));

        let mut config = valid_config();
        config.auth.secret = "not base64!".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.controller.session_timeout_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.users.push(config.users[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_seed_fills_collaborators() {
        let mut config = valid_config();
        config.users.push(UserSettings {
            name: "alice".to_string(),
            roles: vec!["operator".to_string()],
            permissions: vec![CONNECT_PERMISSION.to_string()],
            is_admin: false,
        });
        config.instances.push(InstanceAssignment { id: 7, host: 2 });

        let (_collaborators, memory) = Collaborators::in_memory();
        config.seed(&memory);

        let alice = memory.users.get("alice").unwrap();
        assert!(alice.has_permission(CONNECT_PERMISSION));
        assert_eq!(alice.roles, vec!["operator".to_string()]);
        assert!(memory.users.get("admin").unwrap().is_admin);
    }
}
