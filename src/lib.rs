//! Lifecycle coordination for a pool of nodes hosted on cloud instances.
//!
//! The crate turns "acquire N nodes" into instance creation and per-node
//! bootstrap dispatch, records nodes as they connect back, and tears an
//! instance down exactly when its last node is released. Cloud access and
//! node processes sit behind the [`InstanceProvisioner`] and [`NodeRuntime`]
//! traits; the instance to node mapping is persisted through a
//! [`RegistryStore`].

pub mod acquire;
pub mod config;
pub mod context;
pub mod infrastructure;
pub mod provisioner;
pub mod registry;
pub mod release;
pub mod script;
pub mod test_support;

pub use acquire::{
    AcquisitionCoordinator, AcquisitionError, AcquisitionReport, DispatchError, DispatchFailure,
    DispatchedNode, Instance, NodeRecord,
};
pub use config::{ConfigError, InfrastructureConfig};
pub use context::{DeploymentContext, deployment_label};
pub use infrastructure::{AcquisitionPlan, NodeSourceInfrastructure};
pub use provisioner::{
    CloudCredentials, CloudEndpoints, InfrastructureRequest, InstanceProvisioner, InstanceRequest,
    InstanceRequestBuilder, NodeRuntime, OsFamily, RequestError, VmCredentials,
};
pub use registry::{
    DirectoryStore, InstanceRecords, MemoryStore, NodeInstanceRegistry, RegistryError,
    RegistryStore, Removal, StoreError,
};
pub use release::{
    InstanceTerminationError, ReleaseCoordinator, ReleaseError, ReleaseOutcome, TerminationStatus,
};
pub use script::{
    BootstrapCommand, BootstrapSettings, ConnectionParams, ScriptError, ScriptTemplates,
    TemplateError, build_command,
};
