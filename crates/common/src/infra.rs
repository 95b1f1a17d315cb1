//! Observed infrastructure state of an endpoint

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};

/// Supported accelerator types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuType {
    #[serde(rename = "nvidia-tesla-t4")]
    NvidiaTeslaT4,
    #[serde(rename = "nvidia-ampere-a10")]
    NvidiaAmpereA10,
    #[serde(rename = "nvidia-ampere-a100")]
    NvidiaAmpereA100,
    #[serde(rename = "nvidia-ampere-a100e")]
    NvidiaAmpereA100e,
    #[serde(rename = "nvidia-hopper-h100")]
    NvidiaHopperH100,
    #[serde(rename = "nvidia-hopper-h100-1g20gb")]
    NvidiaHopperH100_1g20gb,
    #[serde(rename = "nvidia-hopper-h100-3g40gb")]
    NvidiaHopperH100_3g40gb,
}

/// A resource amount given either as a plain number or a
/// Kubernetes-style quantity string (`"500m"`, `"4Gi"`, `"10G"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(f64),
    Text(String),
}

impl Quantity {
    /// Normalize to base units (cores for cpu, bytes for memory/storage)
    pub fn to_base_units(&self) -> Result<f64> {
        match self {
            Quantity::Number(n) => Ok(*n),
            Quantity::Text(s) => parse_quantity(s),
        }
    }
}

impl From<f64> for Quantity {
    fn from(n: f64) -> Self {
        Quantity::Number(n)
    }
}

impl From<&str> for Quantity {
    fn from(s: &str) -> Self {
        Quantity::Text(s.to_string())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Number(n) => write!(f, "{}", n),
            Quantity::Text(s) => f.write_str(s),
        }
    }
}

fn parse_quantity(raw: &str) -> Result<f64> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::InvalidQuantity(raw.to_string()))?;

    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(Error::InvalidQuantity(raw.to_string())),
    };

    Ok(value * multiplier)
}

/// Resource shape of a single worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub cpus: Quantity,
    pub gpus: u32,
    pub memory: Quantity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<GpuType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Quantity>,

    /// More than one means a multi-node worker
    pub nodes_per_worker: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize_costs: Option<bool>,
}

/// Autoscaling bounds and observed worker counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub min_workers: u32,
    pub max_workers: u32,

    /// Concurrent requests a single worker handles
    pub per_worker: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_workers: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_workers: Option<u32>,
}

/// User-supplied configuration carried alongside the deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfigState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_config: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_config: Option<EndpointConfig>,
}

/// Observed shape of the compute backing an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraState {
    pub deployment_name: String,

    /// Execution role identity
    pub aws_role: String,

    /// Where async results are written
    pub results_s3_bucket: String,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    pub deployment_state: DeploymentState,
    pub resource_state: ResourceState,

    #[serde(default)]
    pub user_config_state: UserConfigState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prewarm: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_priority: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_queued_items: Option<u64>,

    /// Backend image reference
    pub image: String,
}
