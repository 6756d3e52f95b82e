//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (game credentials) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::detector::{DetectorConfig, PatternConfig};
use crate::engine::EngineConfig;
use crate::recovery::RecoveryConfig;
use crate::strategy::StrategyConfig;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub driver: DriverConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub name: String,
    /// Database file path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "crasher.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Automation sidecar base URL; defaults to the local sidecar.
    #[serde(default)]
    pub sidecar_url: Option<String>,
    /// Env var holding the game username.
    pub username_env: String,
    /// Env var holding the game password.
    pub password_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Sanity-check the strategy set.
    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !self.strategies.iter().any(|s| s.enabled) {
            errors.push("at least one enabled strategy is required".to_string());
        }
        for s in &self.strategies {
            if s.target_cashout <= 1.0 {
                errors.push(format!("[{}] target_cashout must be > 1.0", s.name));
            }
            if s.policy.base_stake() <= rust_decimal::Decimal::ZERO {
                errors.push(format!("[{}] base stake must be positive", s.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration: {}", errors.join("; "))
        }
    }
}
