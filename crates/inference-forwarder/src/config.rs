//! Configuration management for the inference forwarder
//!
//! A YAML (or JSON) file with a `sync` and a `stream` channel section plus
//! shared admission settings. Dotted `key.path=value` overrides are layered
//! on top before the file is deserialized.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tokio::sync::Semaphore;

/// Routes served by every forwarder regardless of configuration
pub const RESERVED_ROUTES: [&str; 4] = ["/healthz", "/readyz", "/predict", "/stream"];

/// Settings for one logical channel (`sync` or `stream`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_hostname")]
    pub user_hostname: String,

    #[serde(default = "default_user_port")]
    pub user_port: u16,

    /// Backend route requests are forwarded to
    #[serde(default = "default_predict_route")]
    pub predict_route: String,

    #[serde(default = "default_healthcheck_route")]
    pub healthcheck_route: String,

    /// Send only `args` to the backend instead of the whole request
    #[serde(default = "default_true")]
    pub model_engine_unwrap: bool,

    /// Wrap backend output in `{"result": ...}`
    #[serde(default = "default_true")]
    pub wrap_response: bool,

    /// Encode the result as a JSON string before wrapping
    #[serde(default)]
    pub serialize_results_as_string: bool,

    /// Mirror backend error statuses instead of failing the request
    #[serde(default)]
    pub forward_http_status: bool,

    /// Extra inbound routes bound to this channel
    #[serde(default)]
    pub extra_routes: Vec<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            user_hostname: default_hostname(),
            user_port: default_user_port(),
            predict_route: default_predict_route(),
            healthcheck_route: default_healthcheck_route(),
            model_engine_unwrap: true,
            wrap_response: true,
            serialize_results_as_string: false,
            forward_http_status: false,
            extra_routes: Vec::new(),
        }
    }
}

impl ChannelConfig {
    fn default_stream() -> Self {
        Self {
            predict_route: "/stream".to_string(),
            ..Default::default()
        }
    }

    /// Backend URL for the configured predict route
    pub fn predict_url(&self) -> String {
        self.url_for(&self.predict_route)
    }

    /// Backend URL for `route`
    pub fn url_for(&self, route: &str) -> String {
        format!(
            "http://{}:{}/{}",
            self.user_hostname,
            self.user_port,
            route.trim_start_matches('/')
        )
    }

    /// Same channel settings, forwarding to `route` instead
    pub fn with_route(&self, route: &str) -> Self {
        Self {
            predict_route: route.to_string(),
            extra_routes: Vec::new(),
            ..self.clone()
        }
    }
}

/// Admission counter shared by every process on a host through Redis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedLimiterConfig {
    pub redis_url: String,

    #[serde(default = "default_limiter_key")]
    pub key: String,

    /// Seconds after which a leaked permit is reclaimed
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

/// Forwarder process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default)]
    pub sync: ChannelConfig,

    #[serde(default = "ChannelConfig::default_stream")]
    pub stream: ChannelConfig,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_true")]
    pub fail_on_concurrency_limit: bool,

    #[serde(default)]
    pub shared_limiter: Option<SharedLimiterConfig>,

    /// Encoded `EndpointConfig` driving post-inference hooks
    #[serde(default)]
    pub endpoint_config: Option<String>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            sync: ChannelConfig::default(),
            stream: ChannelConfig::default_stream(),
            max_concurrency: default_max_concurrency(),
            fail_on_concurrency_limit: true,
            shared_limiter: None,
            endpoint_config: None,
        }
    }
}

impl ForwarderConfig {
    /// Load a config file and layer `overrides` on top
    pub fn load(path: &Path, overrides: &[String]) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_yaml_str(&text, overrides)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse YAML text and layer `overrides` on top
    pub fn from_yaml_str(text: &str, overrides: &[String]) -> Result<Self> {
        let mut root: Value = serde_yaml::from_str(text).context("Failed to parse YAML")?;

        for assignment in overrides {
            apply_override(&mut root, assignment)?;
        }

        if root.is_null() {
            root = Value::Mapping(Mapping::new());
        }

        let config: ForwarderConfig =
            serde_yaml::from_value(root).context("Failed to decode forwarder config")?;
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be greater than 0");
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            anyhow::bail!(
                "max_concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            );
        }

        if let Some(shared) = &self.shared_limiter {
            if shared.lease_secs == 0 {
                anyhow::bail!("shared_limiter.lease_secs must be greater than 0");
            }
        }

        for route in self.sync.extra_routes.iter().chain(&self.stream.extra_routes) {
            validate_route(route)?;
        }

        Ok(())
    }
}

fn validate_route(route: &str) -> Result<()> {
    if !route.starts_with('/') || route.len() < 2 {
        anyhow::bail!("Extra route '{}' must start with '/'", route);
    }

    if route.contains(['{', '}', '*', ':']) {
        anyhow::bail!("Extra route '{}' must be a literal path", route);
    }

    if RESERVED_ROUTES.contains(&route) {
        anyhow::bail!("Extra route '{}' collides with a built-in route", route);
    }

    Ok(())
}

/// Split `--set` flags and a `CONFIG_OVERRIDES` value into assignments
pub fn collect_overrides(flags: &[String], env_overrides: Option<&str>) -> Vec<String> {
    flags
        .iter()
        .map(String::as_str)
        .chain(env_overrides.into_iter().flat_map(|s| s.split(';')))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply one `a.b.c=value` assignment; the value is parsed as YAML
pub fn apply_override(root: &mut Value, assignment: &str) -> Result<()> {
    let (path, raw) = assignment
        .split_once('=')
        .with_context(|| format!("Override '{}' is not of the form key=value", assignment))?;

    let keys: Vec<&str> = path.trim().split('.').collect();
    if keys.iter().any(|k| k.is_empty()) {
        anyhow::bail!("Override '{}' has an empty key", assignment);
    }

    let value: Value = serde_yaml::from_str(raw)
        .with_context(|| format!("Override '{}' has an unparseable value", assignment))?;

    if root.is_null() {
        *root = Value::Mapping(Mapping::new());
    }

    let (last, parents) = keys
        .split_last()
        .with_context(|| format!("Override '{}' has no key", assignment))?;

    let mut node = root;
    for key in parents {
        let map = node
            .as_mapping_mut()
            .with_context(|| format!("Cannot apply '{}': parent of '{}' is not a mapping", assignment, key))?;
        if !map.contains_key(*key) {
            map.insert(Value::from(*key), Value::Mapping(Mapping::new()));
        }
        node = map
            .get_mut(*key)
            .with_context(|| format!("Cannot apply '{}'", assignment))?;
    }

    node.as_mapping_mut()
        .with_context(|| format!("Cannot apply '{}': parent of '{}' is not a mapping", assignment, last))?
        .insert(Value::from(*last), value);

    Ok(())
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_user_port() -> u16 {
    5005
}

fn default_predict_route() -> String {
    "/predict".to_string()
}

fn default_healthcheck_route() -> String {
    "/readyz".to_string()
}

fn default_limiter_key() -> String {
    "forwarder:admission".to_string()
}

fn default_lease_secs() -> u64 {
    600
}

fn default_max_concurrency() -> usize {
    100
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
sync:
  user_port: 5005
  predict_route: /predict
  extra_routes:
    - /v1/completions
stream:
  user_port: 5005
  predict_route: /stream
  extra_routes:
    - /v1/completions
max_concurrency: 8
"#;

    #[test]
    fn test_defaults_for_empty_file() {
        let config = ForwarderConfig::from_yaml_str("", &[]).unwrap();

        assert_eq!(config, ForwarderConfig::default());
        assert_eq!(config.sync.predict_url(), "http://localhost:5005/predict");
        assert_eq!(config.stream.predict_route, "/stream");
        assert_eq!(config.max_concurrency, 100);
        assert!(config.fail_on_concurrency_limit);
    }

    #[test]
    fn test_parse_sample() {
        let config = ForwarderConfig::from_yaml_str(SAMPLE, &[]).unwrap();

        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.sync.extra_routes, vec!["/v1/completions"]);
        assert!(config.sync.model_engine_unwrap);
        assert!(!config.sync.forward_http_status);
    }

    #[test]
    fn test_overrides_are_layered() {
        let overrides = collect_overrides(
            &["max_concurrency=2".to_string()],
            Some("sync.user_hostname=model;stream.forward_http_status=true;shared_limiter.redis_url=redis://r:6379"),
        );
        let config = ForwarderConfig::from_yaml_str(SAMPLE, &overrides).unwrap();

        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.sync.user_hostname, "model");
        assert!(config.stream.forward_http_status);
        let shared = config.shared_limiter.unwrap();
        assert_eq!(shared.redis_url, "redis://r:6379");
        assert_eq!(shared.lease_secs, 600);
    }

    #[test]
    fn test_override_errors() {
        let mut root = Value::Null;
        assert!(apply_override(&mut root, "no_equals_sign").is_err());
        assert!(apply_override(&mut root, "sync..port=1").is_err());

        apply_override(&mut root, "max_concurrency=4").unwrap();
        assert!(apply_override(&mut root, "max_concurrency.nested=1").is_err());
    }

    #[test]
    fn test_collect_overrides_skips_blanks() {
        let overrides = collect_overrides(&[], Some("a=1;; b=2 ;"));
        assert_eq!(overrides, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_invalid_routes_rejected() {
        assert!(ForwarderConfig::from_yaml_str("sync: {extra_routes: [/predict]}", &[]).is_err());
        assert!(ForwarderConfig::from_yaml_str("sync: {extra_routes: [v1]}", &[]).is_err());
        assert!(ForwarderConfig::from_yaml_str("stream: {extra_routes: [\"/v1/{id}\"]}", &[]).is_err());
        assert!(ForwarderConfig::from_yaml_str("max_concurrency: 0", &[]).is_err());
        assert!(
            ForwarderConfig::from_yaml_str("max_concurrency: 4611686018427387904", &[]).is_err()
        );
        let ceiling = format!("max_concurrency: {}", Semaphore::MAX_PERMITS);
        assert!(ForwarderConfig::from_yaml_str(&ceiling, &[]).is_ok());
    }

    #[test]
    fn test_with_route() {
        let config = ForwarderConfig::from_yaml_str(SAMPLE, &[]).unwrap();
        let channel = config.sync.with_route("/v1/completions");

        assert_eq!(channel.predict_url(), "http://localhost:5005/v1/completions");
        assert!(channel.extra_routes.is_empty());
    }
}
