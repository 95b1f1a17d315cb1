//! Configuration management for the endpoint orchestrator
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL
    pub redis_url: String,

    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Use in-memory storage and simulated infrastructure
    pub mock_mode: bool,

    /// Infrastructure gateway base URL (when not in mock mode)
    pub infra_gateway_url: Option<String>,

    /// Lease on a mutation claim, in seconds
    pub lock_lease_secs: u64,

    /// Status reconciler interval, in seconds
    pub reconcile_interval_secs: u64,

    /// JSON file of model bundles to seed at startup
    pub bundles_file: Option<String>,

    /// How long simulated infrastructure takes to converge, in milliseconds
    pub mock_convergence_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            redis_url: var("REDIS_URL", "redis://localhost:6379"),

            api_host: var("API_HOST", "0.0.0.0"),

            api_port: var("API_PORT", "5001")
                .parse()
                .context("Invalid API_PORT")?,

            mock_mode: var("MOCK_MODE", "true")
                .parse()
                .context("Invalid MOCK_MODE (expected true/false)")?,

            infra_gateway_url: lookup("INFRA_GATEWAY_URL").filter(|s| !s.is_empty()),

            lock_lease_secs: var("LOCK_LEASE_SECS", "300")
                .parse()
                .context("Invalid LOCK_LEASE_SECS")?,

            reconcile_interval_secs: var("RECONCILE_INTERVAL_SECS", "10")
                .parse()
                .context("Invalid RECONCILE_INTERVAL_SECS")?,

            bundles_file: lookup("BUNDLES_FILE").filter(|s| !s.is_empty()),

            mock_convergence_ms: var("MOCK_CONVERGENCE_MS", "2000")
                .parse()
                .context("Invalid MOCK_CONVERGENCE_MS")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.lock_lease_secs == 0 {
            anyhow::bail!("LOCK_LEASE_SECS must be greater than 0");
        }

        if self.reconcile_interval_secs == 0 {
            anyhow::bail!("RECONCILE_INTERVAL_SECS must be greater than 0");
        }

        if !self.mock_mode && self.infra_gateway_url.is_none() {
            anyhow::bail!("INFRA_GATEWAY_URL is required when MOCK_MODE=false");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}
