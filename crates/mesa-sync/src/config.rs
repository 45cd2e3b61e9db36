//! # Sync Configuration
//!
//! Configuration management for the replication layer.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     MESA_DEVICE_ID=abc-123                                             │
//! │     MESA_HUB_URL=ws://192.168.1.10:8765/ws                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/mesa-pos/sync.toml (Linux)                               │
//! │     ~/Library/Application Support/com.mesa.pos/sync.toml (macOS)       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, fixed-terminal form factor               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//! form_factor = "fixed"   # fixed | handheld
//!
//! [store]
//! id = "store-001"
//! name = "Riverside Cafe"
//!
//! [sync]
//! hub_url = "ws://192.168.1.100:8765/ws"
//! api_url = "http://192.168.1.100:8765"
//! drain_interval_secs = 5
//!
//! [hub]
//! port = 8765
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Form Factor
// =============================================================================

/// The physical form factor of this device.
///
/// Legacy protocol generations used this to decide which device claims
/// the leader role: a fixed terminal announces, a handheld never does.
/// Current clients only use it as the default for `announces_leader` on
/// the handshake (the hub's own store is authoritative either way).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormFactor {
    /// Fixed terminal (register, back office machine).
    #[default]
    Fixed,

    /// Handheld (waiter tablet or phone).
    Handheld,
}

impl FormFactor {
    /// Whether this device announces leadership on connect by default.
    pub fn announces_leader(&self) -> bool {
        matches!(self, FormFactor::Fixed)
    }
}

impl std::fmt::Display for FormFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormFactor::Fixed => write!(f, "fixed"),
            FormFactor::Handheld => write!(f, "handheld"),
        }
    }
}

impl std::str::FromStr for FormFactor {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "terminal" | "register" => Ok(FormFactor::Fixed),
            "handheld" | "mobile" | "tablet" => Ok(FormFactor::Handheld),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown form factor: '{}'. Valid options: fixed, handheld",
                other
            ))),
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1", "Floor Tablet").
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Physical form factor (drives the announce-leader default).
    #[serde(default)]
    pub form_factor: FormFactor,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
            form_factor: FormFactor::default(),
        }
    }
}

// =============================================================================
// Store Configuration
// =============================================================================

/// Configuration for the store this device belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Unique store identifier.
    pub id: String,

    /// Human-readable store name.
    #[serde(default)]
    pub name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            id: "default-store".to_string(),
            name: "Default Store".to_string(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Replication behavior settings for the device side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// WebSocket URL of the hub (`ws://host:port/ws`).
    #[serde(default)]
    pub hub_url: Option<String>,

    /// HTTP base URL of the hub API (the mutation queue's replay target).
    #[serde(default)]
    pub api_url: Option<String>,

    /// Interval between queue drain attempts while connected (seconds).
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_drain_interval() -> u64 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            hub_url: None,
            api_url: None,
            drain_interval_secs: default_drain_interval(),
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Hub Server Settings
// =============================================================================

/// Configuration for the hub server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Port for the WebSocket/HTTP server.
    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_hub_port() -> u16 {
    8765
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            port: default_hub_port(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl HubSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete replication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Device-side replication settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Hub server settings.
    #[serde(default)]
    pub hub: HubSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if let Some(ref url) = self.sync.hub_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(SyncError::InvalidUrl(format!(
                    "Hub URL must start with ws:// or wss://, got: {}",
                    url
                )));
            }
        }

        if let Some(ref url) = self.sync.api_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SyncError::InvalidUrl(format!(
                    "API URL must start with http:// or https://, got: {}",
                    url
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("MESA_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("MESA_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(ff) = std::env::var("MESA_FORM_FACTOR") {
            if let Ok(parsed) = ff.parse() {
                self.device.form_factor = parsed;
            }
        }

        if let Ok(url) = std::env::var("MESA_HUB_URL") {
            debug!(url = %url, "Overriding hub URL from environment");
            self.sync.hub_url = Some(url);
        }

        if let Ok(url) = std::env::var("MESA_API_URL") {
            self.sync.api_url = Some(url);
        }

        if let Ok(id) = std::env::var("MESA_STORE_ID") {
            self.store.id = id;
        }

        if let Ok(port) = std::env::var("MESA_HUB_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding hub port from environment");
                self.hub.port = p;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "mesa", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the store ID.
    pub fn store_id(&self) -> &str {
        &self.store.id
    }

    /// Whether this device announces leadership on connect.
    pub fn announces_leader(&self) -> bool {
        self.device.form_factor.announces_leader()
    }

    /// Returns the hub WebSocket URL if configured.
    pub fn hub_url(&self) -> Option<&str> {
        self.sync.hub_url.as_deref()
    }

    /// Returns the hub API base URL if configured.
    pub fn api_url(&self) -> Option<&str> {
        self.sync.api_url.as_deref()
    }
}
