//! Configuration system for Spray.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SPRAY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/spray/config.toml
//!   3. ~/.config/spray/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SprayConfig {
    pub membership: MembershipConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Period between two exchanges (DELTATIME).
    pub delta_time_ms: u64,
    /// Deadline for a handshake, a forwarded ticket or an exchange reply (TIMEOUT).
    pub timeout_ms: u64,
    /// How often deadlines are checked by the service loop.
    pub sweep_interval_ms: u64,
}

/// Options handed verbatim to the transport when a channel is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// STUN/TURN urls. Empty = transport defaults.
    pub ice_servers: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            delta_time_ms: 10 * 60 * 1000, // 10 min
            timeout_ms: 30 * 1000,         // 30 s
            sweep_interval_ms: 1000,
        }
    }
}

impl MembershipConfig {
    pub fn delta_time(&self) -> Duration {
        Duration::from_millis(self.delta_time_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("spray")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SprayConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults when it is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            SprayConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SPRAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let text = toml::to_string_pretty(&SprayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(path, text)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(())
    }

    /// Reject values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.membership;
        if m.delta_time_ms == 0 {
            return Err(ConfigError::Invalid("membership.delta_time_ms must be > 0".into()));
        }
        if m.timeout_ms == 0 {
            return Err(ConfigError::Invalid("membership.timeout_ms must be > 0".into()));
        }
        if m.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("membership.sweep_interval_ms must be > 0".into()));
        }
        // A handshake has to be able to finish inside one round.
        if m.timeout_ms >= m.delta_time_ms {
            return Err(ConfigError::Invalid(format!(
                "membership.timeout_ms ({}) must be lower than delta_time_ms ({})",
                m.timeout_ms, m.delta_time_ms
            )));
        }
        Ok(())
    }

    /// Apply SPRAY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("SPRAY_MEMBERSHIP__DELTA_TIME_MS") {
            self.membership.delta_time_ms = v;
        }
        if let Some(v) = env_u64("SPRAY_MEMBERSHIP__TIMEOUT_MS") {
            self.membership.timeout_ms = v;
        }
        if let Some(v) = env_u64("SPRAY_MEMBERSHIP__SWEEP_INTERVAL_MS") {
            self.membership.sweep_interval_ms = v;
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
