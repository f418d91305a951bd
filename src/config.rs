//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (RPC passwords) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`. Connection settings can be
//! overridden from the environment (`ELECTRS_HOST`, `RPC_USER`, ...).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::patterns::{DetectorConfig, RiskWeights};
use crate::session::SessionConfig;
use crate::trace::{CandidateConfig, EngineConfig};
use crate::types::DEFAULT_DEPTH_LIMIT;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tracer: TracerConfig,
    pub provider: ProviderConfig,
    pub server: ServerConfig,
    pub risk: RiskConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TracerConfig {
    pub default_depth_limit: u32,
    pub default_confidence_cutoff: f64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub event_buffer: usize,
    pub subscriber_buffer: usize,
    pub recent_window: usize,
    pub retain_finished: usize,
    /// Shared transaction cache size, across all sessions.
    pub cache_max_entries: usize,
    pub candidates: CandidateConfig,
    pub detector: DetectorConfig,
}

impl Default for TracerConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        let engine = EngineConfig::default();
        Self {
            default_depth_limit: DEFAULT_DEPTH_LIMIT,
            default_confidence_cutoff: 0.0,
            max_retries: engine.max_retries,
            base_backoff_ms: engine.base_backoff_ms,
            event_buffer: session.event_buffer,
            subscriber_buffer: session.subscriber_buffer,
            recent_window: session.recent_window,
            retain_finished: session.retain_finished,
            cache_max_entries: 10_000,
            candidates: CandidateConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl TracerConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_retries: self.max_retries,
            base_backoff_ms: self.base_backoff_ms,
            candidates: self.candidates.clone(),
            detector: self.detector.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            default_depth_limit: self.default_depth_limit,
            default_confidence_cutoff: self.default_confidence_cutoff,
            event_buffer: self.event_buffer,
            subscriber_buffer: self.subscriber_buffer,
            recent_window: self.recent_window,
            retain_finished: self.retain_finished,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Electrs,
    Bitcoind,
    Fixture,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Per-request timeout for network providers.
    pub timeout_secs: u64,
    pub electrs: ElectrsConfig,
    pub bitcoind: BitcoindConfig,
    pub fixture: FixtureConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            timeout_secs: 30,
            electrs: ElectrsConfig::default(),
            bitcoind: BitcoindConfig::default(),
            fixture: FixtureConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ElectrsConfig {
    pub host: String,
    pub port: u16,
    /// Connections shared by all sessions.
    pub pool_size: usize,
}

impl Default for ElectrsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50001,
            pool_size: crate::chain::electrs::DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BitcoindConfig {
    pub url: String,
    pub user: String,
    /// Name of the env var holding the RPC password.
    pub password_env: String,
}

impl Default for BitcoindConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_string(),
            user: "bitcoin".to_string(),
            password_env: "RPC_PASSWORD".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FixtureConfig {
    pub path: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            path: "fixtures/demo_chain.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RiskConfig {
    /// One address per line; `#` starts a comment.
    pub known_mixers_path: Option<String>,
    pub allowlist_path: Option<String>,
    pub weights: RiskWeights,
}

impl AppConfig {
    /// Load configuration from a TOML file and apply env overrides.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let mut config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `ELECTRS_*` and `RPC_*` overrides from `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("ELECTRS_HOST") {
            self.provider.electrs.host = host;
        }
        if let Some(port) = lookup("ELECTRS_PORT") {
            self.provider.electrs.port = port
                .parse()
                .with_context(|| format!("Invalid ELECTRS_PORT: {port}"))?;
        }
        if let Some(user) = lookup("RPC_USER") {
            self.provider.bitcoind.user = user;
        }

        let host = lookup("RPC_HOST");
        let port = lookup("RPC_PORT");
        if host.is_some() || port.is_some() {
            let port: u16 = match port {
                Some(p) => p.parse().with_context(|| format!("Invalid RPC_PORT: {p}"))?,
                None => 8332,
            };
            let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
            self.provider.bitcoind.url = format!("http://{host}:{port}");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
