//! Test support utilities shared across unit and integration tests.
//!
//! The doubles record every call they receive and fail on demand, so tests
//! can drive the coordinators through partial failures without a cloud.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::context::DeploymentContext;
use crate::provisioner::{
    CloudCredentials, CloudEndpoints, InfrastructureRequest, InstanceProvisioner, InstanceRequest,
    NodeRuntime, OsFamily, ProvisionerFuture, VmCredentials,
};
use crate::registry::{InstanceRecords, MemoryStore, RegistryStore, StoreError};
use crate::script::{BootstrapSettings, ScriptTemplates};

/// Label used by the sample deployment.
pub const SAMPLE_LABEL: &str = "test_pool";

/// Error returned by the scripted doubles.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{operation} failed: {message}")]
pub struct ScriptedError {
    /// Operation that was scripted to fail.
    pub operation: &'static str,
    /// Failure detail.
    pub message: String,
}

impl ScriptedError {
    fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Records a single `execute_script` call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptCall {
    /// Instance the script targeted.
    pub instance_id: String,
    /// Rendered command.
    pub command: String,
    /// Extra arguments (node name and index).
    pub extra_args: Vec<String>,
}

impl ScriptCall {
    /// Returns the node index passed in the extra arguments.
    #[must_use]
    pub fn node_index(&self) -> Option<u32> {
        self.extra_args.get(1).and_then(|raw| raw.parse().ok())
    }
}

/// Records a single `terminate_instance` call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Termination {
    /// Infrastructure label.
    pub label: String,
    /// Terminated instance.
    pub instance_id: String,
}

#[derive(Debug, Default)]
struct ProvisionerState {
    instances: BTreeSet<String>,
    fail_ready: bool,
    fail_infrastructure: bool,
    fail_create: bool,
    infrastructure_label: Option<String>,
    failing_scripts: HashSet<(String, u32)>,
    failing_terminations: HashSet<String>,
    script_delay: Option<Duration>,
    ready_calls: usize,
    infrastructure_calls: Vec<String>,
    create_calls: Vec<u32>,
    script_calls: Vec<ScriptCall>,
    terminations: Vec<Termination>,
    scripts_in_flight: usize,
    max_scripts_in_flight: usize,
}

/// Provisioner double returning a fixed set of instance identifiers.
///
/// Clones share state, so a test can keep one handle for assertions while the
/// coordinator owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
}

impl ScriptedProvisioner {
    /// Creates a provisioner whose `create_instances` returns `instance_ids`.
    #[must_use]
    pub fn new(instance_ids: &[&str]) -> Self {
        let provisioner = Self::default();
        provisioner.state().instances = instance_ids.iter().map(|id| (*id).to_owned()).collect();
        provisioner
    }

    fn state(&self) -> MutexGuard<'_, ProvisionerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `wait_until_ready` fail.
    pub fn fail_readiness(&self) {
        self.state().fail_ready = true;
    }

    /// Makes `ensure_infrastructure` fail.
    pub fn fail_infrastructure(&self) {
        self.state().fail_infrastructure = true;
    }

    /// Makes `ensure_infrastructure` report `label` instead of the requested
    /// one.
    pub fn relabel_infrastructure(&self, label: &str) {
        self.state().infrastructure_label = Some(label.to_owned());
    }

    /// Makes `create_instances` fail.
    pub fn fail_creation(&self) {
        self.state().fail_create = true;
    }

    /// Makes the script for node `node_index` on `instance_id` fail.
    pub fn fail_script(&self, instance_id: &str, node_index: u32) {
        self.state()
            .failing_scripts
            .insert((instance_id.to_owned(), node_index));
    }

    /// Makes terminating `instance_id` fail.
    pub fn fail_termination(&self, instance_id: &str) {
        self.state()
            .failing_terminations
            .insert(instance_id.to_owned());
    }

    /// Holds every script execution for `delay` so overlapping calls can be
    /// observed.
    pub fn delay_scripts(&self, delay: Duration) {
        self.state().script_delay = Some(delay);
    }

    /// Number of readiness probes received.
    #[must_use]
    pub fn ready_calls(&self) -> usize {
        self.state().ready_calls
    }

    /// Labels passed to `ensure_infrastructure`.
    #[must_use]
    pub fn infrastructure_calls(&self) -> Vec<String> {
        self.state().infrastructure_calls.clone()
    }

    /// Counts passed to `create_instances`.
    #[must_use]
    pub fn create_calls(&self) -> Vec<u32> {
        self.state().create_calls.clone()
    }

    /// Scripts executed, in arrival order.
    #[must_use]
    pub fn script_calls(&self) -> Vec<ScriptCall> {
        self.state().script_calls.clone()
    }

    /// Scripts executed against `instance_id`.
    #[must_use]
    pub fn scripts_for(&self, instance_id: &str) -> Vec<ScriptCall> {
        self.state()
            .script_calls
            .iter()
            .filter(|call| call.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Terminations requested, in arrival order.
    #[must_use]
    pub fn terminations(&self) -> Vec<Termination> {
        self.state().terminations.clone()
    }

    /// Highest number of scripts observed running at once.
    #[must_use]
    pub fn max_concurrent_scripts(&self) -> usize {
        self.state().max_scripts_in_flight
    }

    /// Total number of remote calls of any kind.
    #[must_use]
    pub fn remote_calls(&self) -> usize {
        let state = self.state();
        state.ready_calls
            + state.infrastructure_calls.len()
            + state.create_calls.len()
            + state.script_calls.len()
            + state.terminations.len()
    }
}

impl InstanceProvisioner for ScriptedProvisioner {
    type Error = ScriptedError;

    fn wait_until_ready(&self) -> ProvisionerFuture<'_, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.ready_calls += 1;
            if state.fail_ready {
                return Err(ScriptedError::new("wait_until_ready", "service unreachable"));
            }
            Ok(())
        })
    }

    fn ensure_infrastructure<'a>(
        &'a self,
        request: &'a InfrastructureRequest,
    ) -> ProvisionerFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.infrastructure_calls.push(request.label.clone());
            if state.fail_infrastructure {
                return Err(ScriptedError::new("ensure_infrastructure", "quota exceeded"));
            }
            Ok(state
                .infrastructure_label
                .clone()
                .unwrap_or_else(|| request.label.clone()))
        })
    }

    fn create_instances<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProvisionerFuture<'a, BTreeSet<String>, Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.create_calls.push(request.count);
            if state.fail_create {
                return Err(ScriptedError::new("create_instances", "capacity exhausted"));
            }
            let limit = usize::try_from(request.count).unwrap_or(usize::MAX);
            Ok(state.instances.iter().take(limit).cloned().collect())
        })
    }

    fn execute_script<'a>(
        &'a self,
        instance_id: &'a str,
        command: &'a str,
        extra_args: &'a [String],
    ) -> ProvisionerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let call = ScriptCall {
                instance_id: instance_id.to_owned(),
                command: command.to_owned(),
                extra_args: extra_args.to_vec(),
            };
            let node_index = call.node_index().unwrap_or_default();
            let delay = {
                let mut state = self.state();
                state.script_calls.push(call);
                state.scripts_in_flight += 1;
                state.max_scripts_in_flight =
                    state.max_scripts_in_flight.max(state.scripts_in_flight);
                state.script_delay
            };
            if let Some(duration) = delay {
                tokio::time::sleep(duration).await;
            }
            let mut state = self.state();
            state.scripts_in_flight -= 1;
            if state
                .failing_scripts
                .contains(&(instance_id.to_owned(), node_index))
            {
                return Err(ScriptedError::new(
                    "execute_script",
                    format!("node {node_index} on {instance_id} did not start"),
                ));
            }
            Ok(())
        })
    }

    fn terminate_instance<'a>(
        &'a self,
        label: &'a str,
        instance_id: &'a str,
    ) -> ProvisionerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.terminations.push(Termination {
                label: label.to_owned(),
                instance_id: instance_id.to_owned(),
            });
            if state.failing_terminations.contains(instance_id) {
                return Err(ScriptedError::new("terminate_instance", "instance locked"));
            }
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    kills: Vec<String>,
    failing: HashSet<String>,
}

/// Node runtime double recording kill requests.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl ScriptedRuntime {
    /// Creates a runtime where every kill succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes killing `node_name` fail.
    pub fn fail_kill(&self, node_name: &str) {
        self.state().failing.insert(node_name.to_owned());
    }

    /// Nodes a kill was requested for, in arrival order.
    #[must_use]
    pub fn kills(&self) -> Vec<String> {
        self.state().kills.clone()
    }
}

impl NodeRuntime for ScriptedRuntime {
    type Error = ScriptedError;

    fn kill_node<'a>(&'a self, node_name: &'a str) -> ProvisionerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.kills.push(node_name.to_owned());
            if state.failing.contains(node_name) {
                return Err(ScriptedError::new("kill_node", "process not found"));
            }
            Ok(())
        })
    }
}

/// In-memory store whose writes can be made to fail.
#[derive(Clone, Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: Arc<AtomicBool>,
}

impl FailingStore {
    /// Creates an empty store that accepts writes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles whether `save` and `retire` fail.
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the records written so far.
    #[must_use]
    pub fn records(&self) -> InstanceRecords {
        self.inner.records()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(String::from("disk full")));
        }
        Ok(())
    }
}

impl RegistryStore for FailingStore {
    fn load_all(&self) -> Result<InstanceRecords, StoreError> {
        self.inner.load_all()
    }

    fn save(&self, instance_id: &str, nodes: &BTreeSet<String>) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save(instance_id, nodes)
    }

    fn retire(&self, instance_id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.retire(instance_id)
    }

    fn is_retired(&self, instance_id: &str) -> Result<bool, StoreError> {
        self.inner.is_retired(instance_id)
    }
}

/// Returns a valid Linux instance request for `count` instances.
#[must_use]
pub fn sample_request(count: u32) -> InstanceRequest {
    InstanceRequest {
        infrastructure_label: SAMPLE_LABEL.to_owned(),
        instance_label: SAMPLE_LABEL.to_owned(),
        image: String::from("ubuntu-22.04"),
        os_family: OsFamily::Linux,
        vm_size: String::from("Standard_D1_v2"),
        count,
        credentials: VmCredentials {
            username: String::from("admin"),
            password: Some(String::from("hunter2")),
            public_key: None,
        },
        resource_group: String::from("rg-nodes"),
        region: String::from("westeurope"),
        private_network_cidr: None,
        static_public_ip: true,
    }
}

/// Returns the infrastructure description of the sample deployment.
#[must_use]
pub fn sample_infrastructure() -> InfrastructureRequest {
    InfrastructureRequest {
        label: SAMPLE_LABEL.to_owned(),
        credentials: CloudCredentials {
            client_id: String::from("client"),
            secret: String::from("secret"),
            domain: String::from("tenant"),
            subscription_id: String::from("subscription"),
        },
        endpoints: CloudEndpoints::default(),
        remove_on_shutdown: false,
    }
}

/// Returns the deployment context matching [`SAMPLE_LABEL`].
#[must_use]
pub fn sample_context() -> DeploymentContext {
    DeploymentContext::new("Test Pool", "admin-credentials", "pnp://master:64738")
}

/// Returns bootstrap settings with simple templates for both OS families.
#[must_use]
pub fn sample_bootstrap() -> BootstrapSettings {
    BootstrapSettings {
        templates: ScriptTemplates::new(
            "java -jar node.jar -r ${MASTER_URL} -n ${NODE_NAME} -s ${NODE_SOURCE}",
            "java.exe -jar node.jar -r ${MASTER_URL} -n ${NODE_NAME} -s ${NODE_SOURCE}",
        ),
        node_bundle_url: String::from("https://master/rest/node.jar"),
        additional_properties: String::new(),
    }
}
