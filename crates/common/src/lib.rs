pub mod batch;
pub mod bundle;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod infra;

pub use batch::{BatchCompletionsJob, BatchJobStatus, BatchModelConfig};
pub use bundle::ModelBundle;
pub use config::{CallbackAuth, EndpointConfig, ENDPOINT_CONFIG_ANNOTATION};
pub use endpoint::{destination_for, Endpoint, EndpointRecord, EndpointStatus, EndpointType};
pub use error::{Error, Result};
pub use infra::{DeploymentState, GpuType, InfraState, Quantity, ResourceState, UserConfigState};
