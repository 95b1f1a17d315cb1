//! Post-inference hooks
//!
//! Hooks run in the background after the response has been handed back.
//! Work is tracked so shutdown can wait for it, bounded by a timeout.

use anyhow::{Context, Result};
use endpoint_common::{CallbackAuth, EndpointConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::forwarder::PredictRequest;

pub const CALLBACK_HOOK: &str = "callback";
pub const LOGGING_HOOK: &str = "logging";

/// How a request ended, as reported to hooks
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    Success(Value),
    Failure(String),
    /// The client went away before the response completed
    Abandoned,
}

impl HookOutcome {
    fn status(&self) -> &'static str {
        match self {
            HookOutcome::Success(_) => "SUCCESS",
            HookOutcome::Failure(_) => "FAILURE",
            HookOutcome::Abandoned => "ABANDONED",
        }
    }
}

/// Post-inference hook executor for this process's endpoint
#[derive(Clone)]
pub struct PostInferenceHooks {
    config: Option<Arc<EndpointConfig>>,
    client: reqwest::Client,
    tracker: TaskTracker,
}

impl PostInferenceHooks {
    pub fn new(config: Option<EndpointConfig>, client: reqwest::Client) -> Self {
        Self {
            config: config.map(Arc::new),
            client,
            tracker: TaskTracker::new(),
        }
    }

    /// Decode the endpoint config blob, if any
    pub fn from_blob(blob: Option<&str>, client: reqwest::Client) -> Result<Self> {
        let config = blob
            .map(EndpointConfig::from_blob)
            .transpose()
            .context("Invalid endpoint config blob")?;
        Ok(Self::new(config, client))
    }

    pub fn hooks(&self) -> &[String] {
        self.config.as_deref().map(EndpointConfig::hooks).unwrap_or_default()
    }

    /// Hook work still outstanding
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// A handle that fires the hooks exactly once for `request`
    pub fn guard(&self, request: &PredictRequest) -> HookGuard {
        HookGuard {
            hooks: self.clone(),
            request: (!self.hooks().is_empty()).then(|| request.clone()),
        }
    }

    fn schedule(&self, request: PredictRequest, outcome: HookOutcome) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No runtime to run post-inference hooks; dropping them");
            return;
        }

        let hooks = self.clone();
        self.tracker.spawn(async move {
            hooks.run(&request, &outcome).await;
        });
    }

    async fn run(&self, request: &PredictRequest, outcome: &HookOutcome) {
        let Some(config) = self.config.as_deref() else {
            return;
        };
        let task_id = Uuid::new_v4().to_string();

        for hook in config.hooks() {
            match hook.as_str() {
                LOGGING_HOOK => log_outcome(config, &task_id, outcome),
                CALLBACK_HOOK => {
                    if let Err(e) = self.callback(config, request, &task_id, outcome).await {
                        error!("Callback hook failed for task {}: {:#}", task_id, e);
                    }
                }
                other => warn!("Ignoring unknown post-inference hook {}", other),
            }
        }
    }

    async fn callback(
        &self,
        config: &EndpointConfig,
        request: &PredictRequest,
        task_id: &str,
        outcome: &HookOutcome,
    ) -> Result<()> {
        let Some(url) = request
            .callback_url
            .as_deref()
            .or(config.default_callback_url.as_deref())
        else {
            warn!("Callback hook configured but no callback URL for task {}", task_id);
            return Ok(());
        };

        let mut body = json!({
            "task_id": task_id,
            "status": outcome.status(),
        });
        match outcome {
            HookOutcome::Success(result) => body["result"] = result.clone(),
            HookOutcome::Failure(message) => body["error"] = Value::String(message.clone()),
            HookOutcome::Abandoned => {}
        }

        let auth = request
            .callback_auth
            .as_ref()
            .or(config.default_callback_auth.as_ref());

        let builder = match auth {
            Some(CallbackAuth::Basic { username, password }) => self
                .client
                .post(url)
                .basic_auth(username, Some(password)),
            Some(CallbackAuth::Mtls { cert, key }) => {
                let pem = format!("{}\n{}", cert.trim_end(), key.trim_end());
                let identity = reqwest::Identity::from_pem(pem.as_bytes())
                    .context("Invalid mTLS callback identity")?;
                reqwest::Client::builder()
                    .identity(identity)
                    .build()
                    .context("Failed to build mTLS callback client")?
                    .post(url)
            }
            None => self.client.post(url),
        };

        let response = builder
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach callback URL {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Callback URL {} returned {}", url, response.status());
        }

        info!("Delivered callback for task {} to {}", task_id, url);
        Ok(())
    }

    /// Wait for outstanding hook work; returns `false` if it was abandoned
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            info!("Post-inference hooks drained");
            return true;
        }

        error!(
            "Abandoning {} post-inference hook task(s) after {:?}",
            self.tracker.len(),
            timeout
        );
        false
    }
}

fn log_outcome(config: &EndpointConfig, task_id: &str, outcome: &HookOutcome) {
    info!(
        endpoint = %config.endpoint_name,
        endpoint_id = config.endpoint_id.as_deref().unwrap_or_default(),
        bundle = %config.bundle_name,
        task_id = %task_id,
        status = outcome.status(),
        "Inference completed"
    );
}

/// Fires the hooks once: explicitly through [`HookGuard::complete`], or as
/// `Abandoned` when dropped first.
pub struct HookGuard {
    hooks: PostInferenceHooks,
    request: Option<PredictRequest>,
}

impl HookGuard {
    pub fn complete(mut self, outcome: HookOutcome) {
        if let Some(request) = self.request.take() {
            self.hooks.schedule(request, outcome);
        }
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            self.hooks.schedule(request, HookOutcome::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(hooks: &[&str]) -> EndpointConfig {
        EndpointConfig {
            endpoint_name: "llama".to_string(),
            bundle_name: "llama-bundle".to_string(),
            post_inference_hooks: Some(hooks.iter().map(|h| h.to_string()).collect()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_guard_fires_once() {
        let hooks = PostInferenceHooks::new(Some(config(&[LOGGING_HOOK])), reqwest::Client::new());

        let guard = hooks.guard(&PredictRequest::default());
        guard.complete(HookOutcome::Success(json!({"ok": true})));
        assert_eq!(hooks.pending(), 1);

        assert!(hooks.drain(Duration::from_secs(1)).await);
        assert_eq!(hooks.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_guard_reports_abandoned() {
        let hooks = PostInferenceHooks::new(Some(config(&[LOGGING_HOOK])), reqwest::Client::new());

        drop(hooks.guard(&PredictRequest::default()));
        assert_eq!(hooks.pending(), 1);
        assert!(hooks.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_no_hooks_schedules_nothing() {
        let hooks = PostInferenceHooks::new(None, reqwest::Client::new());
        hooks
            .guard(&PredictRequest::default())
            .complete(HookOutcome::Failure("boom".to_string()));
        assert_eq!(hooks.pending(), 0);

        let hooks = PostInferenceHooks::new(Some(config(&[])), reqwest::Client::new());
        drop(hooks.guard(&PredictRequest::default()));
        assert_eq!(hooks.pending(), 0);
    }

    #[test]
    fn test_from_blob() {
        let blob = config(&[CALLBACK_HOOK]).to_blob().unwrap();
        let hooks = PostInferenceHooks::from_blob(Some(&blob), reqwest::Client::new()).unwrap();
        assert_eq!(hooks.hooks(), ["callback"]);

        assert!(PostInferenceHooks::from_blob(Some("%%%"), reqwest::Client::new()).is_err());
        assert!(PostInferenceHooks::from_blob(None, reqwest::Client::new())
            .unwrap()
            .hooks()
            .is_empty());
    }
}
