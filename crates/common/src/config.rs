//! Durable endpoint configuration and its opaque encoding
//!
//! `EndpointConfig` travels inside infrastructure metadata as a base64 blob
//! of compact JSON. Unset fields are dropped on encode and unknown fields are
//! ignored on decode, so older readers keep working when newer writers add
//! optional fields.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::endpoint::EndpointType;
use crate::error::Result;

/// Metadata key under which the encoded config is attached to a deployment
pub const ENDPOINT_CONFIG_ANNOTATION: &str = "launch.endpoint/config";

/// Credentials used when delivering results to a callback URL.
///
/// The `kind` field selects the variant and is checked before any
/// variant-specific field is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CallbackAuth {
    Basic { username: String, password: String },
    Mtls { cert: String, key: String },
}

impl CallbackAuth {
    /// Discriminator value of this variant
    pub fn kind(&self) -> &'static str {
        match self {
            CallbackAuth::Basic { .. } => "basic",
            CallbackAuth::Mtls { .. } => "mtls",
        }
    }
}

/// Configuration needed to reconstruct a deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub endpoint_name: String,
    pub bundle_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_inference_hooks: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_tags: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_callback_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_callback_auth: Option<CallbackAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_type: Option<EndpointType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

impl EndpointConfig {
    /// Encode as an opaque base64 blob
    pub fn to_blob(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Decode a blob produced by [`EndpointConfig::to_blob`]
    pub fn from_blob(blob: &str) -> Result<Self> {
        let bytes = STANDARD.decode(blob.trim())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Hooks configured for this endpoint (empty when unset)
    pub fn hooks(&self) -> &[String] {
        self.post_inference_hooks.as_deref().unwrap_or_default()
    }
}
