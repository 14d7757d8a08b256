//! Task definitions ingested from OCI image labels, and the container
//! execution pipeline that realizes one execution against Docker.

pub mod definition;
pub mod docker;
pub mod executor;
pub mod label;
pub mod oci;
pub mod provider;

pub use definition::{Definition, Input, InputType, ValueType};
pub use docker::DockerExecutor;
pub use executor::{
    ChangeCallback, Execution, ExecutionError, ExecutionErrorKind, ExecutionRequest,
    ExecutionState, Executor, LogLine, INPUTS_DIR, OUTPUTS_DIR,
};
pub use label::{LabelError, ParsedLabels};
pub use oci::{OciProvider, RegistryClient};
pub use provider::{Provider, ProviderError};
