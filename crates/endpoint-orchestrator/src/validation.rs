//! Request validation for endpoint create and update

use endpoint_common::{DeploymentState, EndpointType, Quantity, ResourceState};
use std::collections::HashMap;

use crate::desired::DesiredEndpoint;
use crate::error::{Result, UseCaseError};
use crate::models::CreateEndpointRequest;

/// Labels every endpoint must carry
pub const REQUIRED_LABEL_KEYS: &[&str] = &["team", "product"];

/// Labels set by the platform itself
pub const RESERVED_LABEL_KEYS: &[&str] = &["endpoint_name", "user_id"];

/// Hooks the forwarder knows how to run
pub const SUPPORTED_HOOKS: &[&str] = &["callback", "logging"];

pub const CALLBACK_HOOK: &str = "callback";

const MAX_LABEL_LENGTH: usize = 63;
const MAX_ENDPOINT_NAME_LENGTH: usize = 63;
const MAX_GPUS: u32 = 8;
const MAX_CPUS: f64 = 128.0;
const MAX_MEMORY_BYTES: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;
const MAX_STORAGE_BYTES: f64 = 2.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0;

fn invalid(message: impl Into<String>) -> UseCaseError {
    UseCaseError::InvalidRequest(message.into())
}

/// Alphanumeric at both ends, `-`, `_` or `.` in between
fn is_label_token(s: &str) -> bool {
    let bytes = s.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}

/// Endpoint names become part of deployment names, so they follow DNS-label
/// rules: lowercase alphanumerics and `-`, starting with a letter.
pub fn validate_endpoint_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_ENDPOINT_NAME_LENGTH
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if !valid {
        return Err(invalid(format!(
            "Invalid endpoint name '{}': use lowercase letters, digits and '-', start with a letter, at most {} characters",
            name, MAX_ENDPOINT_NAME_LENGTH
        )));
    }
    Ok(())
}

pub fn validate_labels(labels: &HashMap<String, String>) -> Result<()> {
    for required in REQUIRED_LABEL_KEYS {
        if !labels.contains_key(*required) {
            return Err(invalid(format!("Missing required label '{}'", required)));
        }
    }

    for (key, value) in labels {
        if RESERVED_LABEL_KEYS.contains(&key.as_str()) {
            return Err(invalid(format!("Label '{}' is reserved", key)));
        }
        if key.len() > MAX_LABEL_LENGTH || !is_label_token(key) {
            return Err(invalid(format!("Invalid label key '{}'", key)));
        }
        // Values may be empty
        if value.len() > MAX_LABEL_LENGTH || (!value.is_empty() && !is_label_token(value)) {
            return Err(invalid(format!("Invalid value '{}' for label '{}'", value, key)));
        }
    }

    Ok(())
}

fn quantity(name: &str, q: &Quantity) -> Result<f64> {
    q.to_base_units()
        .map_err(|_| invalid(format!("Invalid {} quantity '{}'", name, q)))
}

pub fn validate_resources(desired: &DesiredEndpoint) -> Result<()> {
    check_resources(desired.endpoint_type, &desired.resources, &desired.deployment)
}

fn check_resources(
    endpoint_type: EndpointType,
    resources: &ResourceState,
    deployment: &DeploymentState,
) -> Result<()> {
    let cpus = quantity("cpus", &resources.cpus)?;
    if cpus <= 0.0 || cpus > MAX_CPUS {
        return Err(invalid(format!(
            "cpus must be greater than 0 and at most {}",
            MAX_CPUS
        )));
    }

    let memory = quantity("memory", &resources.memory)?;
    if memory <= 0.0 || memory > MAX_MEMORY_BYTES {
        return Err(invalid("memory must be greater than 0 and at most 1Ti"));
    }

    if let Some(storage) = &resources.storage {
        let storage = quantity("storage", storage)?;
        if storage <= 0.0 || storage > MAX_STORAGE_BYTES {
            return Err(invalid("storage must be greater than 0 and at most 2Ti"));
        }
    }

    if resources.gpus > MAX_GPUS {
        return Err(invalid(format!("gpus must be at most {}", MAX_GPUS)));
    }
    match (resources.gpus > 0, resources.gpu_type.is_some()) {
        (true, false) => return Err(invalid("gpu_type is required when gpus > 0")),
        (false, true) => return Err(invalid("gpu_type requires gpus > 0")),
        _ => {}
    }

    if resources.nodes_per_worker < 1 {
        return Err(invalid("nodes_per_worker must be at least 1"));
    }
    if resources.nodes_per_worker > 1 {
        if endpoint_type != EndpointType::Streaming {
            return Err(invalid("Multinode workers are only supported for streaming endpoints"));
        }
        if resources.gpus == 0 {
            return Err(invalid("Multinode workers require gpus"));
        }
    }

    if deployment.per_worker < 1 {
        return Err(invalid("per_worker must be at least 1"));
    }
    if deployment.max_workers < 1 {
        return Err(invalid("max_workers must be at least 1"));
    }
    if deployment.min_workers > deployment.max_workers {
        return Err(invalid("min_workers must not exceed max_workers"));
    }

    Ok(())
}

pub fn validate_post_inference_hooks(desired: &DesiredEndpoint) -> Result<()> {
    check_hooks(
        desired.post_inference_hooks.as_deref(),
        desired.default_callback_url.is_some(),
        desired.default_callback_auth.is_some(),
    )
}

fn check_hooks(
    hooks: Option<&[String]>,
    has_callback_url: bool,
    has_callback_auth: bool,
) -> Result<()> {
    for hook in hooks.into_iter().flatten() {
        if !SUPPORTED_HOOKS.contains(&hook.as_str()) {
            return Err(invalid(format!("Unsupported post-inference hook '{}'", hook)));
        }
        if hook == CALLBACK_HOOK && !has_callback_url {
            return Err(invalid("The callback hook requires default_callback_url"));
        }
    }

    if has_callback_auth && !has_callback_url {
        return Err(invalid("default_callback_auth requires default_callback_url"));
    }

    Ok(())
}

/// Run every check against a desired configuration
pub fn validate_desired(desired: &DesiredEndpoint) -> Result<()> {
    validate_endpoint_name(&desired.name)?;
    validate_labels(&desired.labels)?;
    validate_resources(desired)?;
    validate_post_inference_hooks(desired)
}

/// Checks that need nothing beyond the create request itself, run before
/// any stored state is consulted
pub fn validate_create_request(request: &CreateEndpointRequest) -> Result<()> {
    validate_endpoint_name(&request.name)?;
    validate_labels(&request.labels)?;
    check_resources(
        request.endpoint_type,
        &request.resource_state(),
        &request.deployment_state(),
    )?;
    check_hooks(
        request.post_inference_hooks.as_deref(),
        request.default_callback_url.is_some(),
        request.default_callback_auth.is_some(),
    )
}
