//! Destination routing
//!
//! The table is built once at startup and never changes afterwards, so
//! request dispatch needs no locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ForwarderConfig;
use crate::error::{ForwardError, Result};
use crate::forwarder::{StreamingForwarder, SyncForwarder};

/// Forwarders bound to one extra route
#[derive(Debug, Clone, Default)]
pub struct Destination {
    pub sync: Option<Arc<SyncForwarder>>,
    pub stream: Option<Arc<StreamingForwarder>>,
}

/// Forwarder chosen for one request
#[derive(Debug, Clone)]
pub enum Dispatch {
    Sync(Arc<SyncForwarder>),
    Stream(Arc<StreamingForwarder>),
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    predict: Arc<SyncForwarder>,
    stream: Arc<StreamingForwarder>,
    extra: BTreeMap<String, Destination>,
}

impl RouteTable {
    pub fn from_config(config: &ForwarderConfig, client: &reqwest::Client) -> Self {
        let mut extra: BTreeMap<String, Destination> = BTreeMap::new();

        for route in &config.sync.extra_routes {
            extra.entry(route.clone()).or_default().sync = Some(Arc::new(SyncForwarder::new(
                client.clone(),
                config.sync.with_route(route),
            )));
        }
        for route in &config.stream.extra_routes {
            extra.entry(route.clone()).or_default().stream = Some(Arc::new(
                StreamingForwarder::new(client.clone(), config.stream.with_route(route)),
            ));
        }

        Self {
            predict: Arc::new(SyncForwarder::new(client.clone(), config.sync.clone())),
            stream: Arc::new(StreamingForwarder::new(client.clone(), config.stream.clone())),
            extra,
        }
    }

    /// Forwarder behind `POST /predict`
    pub fn predict(&self) -> Arc<SyncForwarder> {
        self.predict.clone()
    }

    /// Forwarder behind `POST /stream`
    pub fn stream(&self) -> Arc<StreamingForwarder> {
        self.stream.clone()
    }

    /// Configured extra routes, in a stable order
    pub fn extra_routes(&self) -> impl Iterator<Item = &str> {
        self.extra.keys().map(String::as_str)
    }

    /// Pick the forwarder for an extra route and the request's stream flag
    pub fn resolve(&self, route: &str, stream: bool) -> Result<Dispatch> {
        let no_forwarder = || ForwardError::NoForwarder {
            route: route.to_string(),
            stream,
        };
        let destination = self.extra.get(route).ok_or_else(no_forwarder)?;

        match (stream, &destination.sync, &destination.stream) {
            (true, _, Some(forwarder)) => Ok(Dispatch::Stream(forwarder.clone())),
            (false, Some(forwarder), _) => Ok(Dispatch::Sync(forwarder.clone())),
            _ => Err(no_forwarder()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        let config = ForwarderConfig::from_yaml_str(
            r#"
sync:
  extra_routes: [/v1/completions, /v1/embeddings]
stream:
  extra_routes: [/v1/completions, /v1/chat]
"#,
            &[],
        )
        .unwrap();
        RouteTable::from_config(&config, &reqwest::Client::new())
    }

    #[test]
    fn test_routes_are_merged() {
        let binding = table();
        let routes: Vec<&str> = binding.extra_routes().collect();
        assert_eq!(routes, vec!["/v1/chat", "/v1/completions", "/v1/embeddings"]);
    }

    #[test]
    fn test_resolve_by_stream_flag() {
        let table = table();

        match table.resolve("/v1/completions", true).unwrap() {
            Dispatch::Stream(f) => assert_eq!(f.url(), "http://localhost:5005/v1/completions"),
            other => panic!("expected stream, got {:?}", other),
        }
        assert!(matches!(
            table.resolve("/v1/completions", false).unwrap(),
            Dispatch::Sync(_)
        ));
        assert!(matches!(
            table.resolve("/v1/embeddings", false).unwrap(),
            Dispatch::Sync(_)
        ));
    }

    #[test]
    fn test_unbound_combinations_fail() {
        let table = table();

        assert!(matches!(
            table.resolve("/v1/embeddings", true),
            Err(ForwardError::NoForwarder { stream: true, .. })
        ));
        assert!(matches!(
            table.resolve("/v1/chat", false),
            Err(ForwardError::NoForwarder { stream: false, .. })
        ));
        assert!(table.resolve("/v1/unknown", false).is_err());
    }

    #[test]
    fn test_default_routes() {
        let table = table();
        assert_eq!(table.predict().url(), "http://localhost:5005/predict");
        assert_eq!(table.stream().url(), "http://localhost:5005/stream");
    }
}
