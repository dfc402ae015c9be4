//! Node source facade handed to the hosting framework.
//!
//! [`NodeSourceInfrastructure`] owns one deployment: its validated
//! [`AcquisitionPlan`], the acquisition and release coordinators, and the
//! shared registry. The hosting framework drives it through node level calls
//! and never sees instances directly.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::acquire::{AcquisitionCoordinator, AcquisitionError, AcquisitionReport, NodeRecord};
use crate::context::DeploymentContext;
use crate::provisioner::{InfrastructureRequest, InstanceProvisioner, InstanceRequest, NodeRuntime};
use crate::registry::{InstanceRecords, NodeInstanceRegistry, RegistryError, RegistryStore};
use crate::release::{ReleaseCoordinator, ReleaseError, ReleaseOutcome, TerminationStatus};
use crate::script::{BootstrapSettings, ConnectionParams};

/// Immutable description of what one deployment acquires.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcquisitionPlan {
    /// Shared infrastructure every instance is created in.
    pub infrastructure: InfrastructureRequest,
    /// Instance request used by [`NodeSourceInfrastructure::acquire_all_nodes`].
    pub request: InstanceRequest,
    /// Nodes bootstrapped on each instance.
    pub nodes_per_instance: u32,
    /// Templates and values for bootstrap scripts.
    pub bootstrap: BootstrapSettings,
}

/// Entry points the hosting framework calls for one deployment.
pub struct NodeSourceInfrastructure<P, R, S> {
    plan: AcquisitionPlan,
    registry: Arc<NodeInstanceRegistry<S>>,
    acquisition: AcquisitionCoordinator<P, S>,
    release: ReleaseCoordinator<P, R, S>,
}

impl<P, R, S> NodeSourceInfrastructure<P, R, S>
where
    P: InstanceProvisioner + 'static,
    R: NodeRuntime,
    S: RegistryStore,
{
    /// Wires the coordinators for `plan` around shared collaborators.
    #[must_use]
    pub fn new(
        plan: AcquisitionPlan,
        context: &DeploymentContext,
        provisioner: Arc<P>,
        runtime: Arc<R>,
        registry: Arc<NodeInstanceRegistry<S>>,
    ) -> Self {
        let params = ConnectionParams::new(context, &plan.bootstrap);
        let acquisition = AcquisitionCoordinator::new(
            Arc::clone(&provisioner),
            Arc::clone(&registry),
            plan.infrastructure.clone(),
            plan.bootstrap.templates.clone(),
            params,
        );
        let release = ReleaseCoordinator::new(
            provisioner,
            runtime,
            Arc::clone(&registry),
            plan.infrastructure.label.clone(),
        );
        Self {
            plan,
            registry,
            acquisition,
            release,
        }
    }

    /// Returns the deployment label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.plan.infrastructure.label
    }

    /// Returns the plan this deployment was built from.
    #[must_use]
    pub const fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    /// Acquires one instance's worth of nodes.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError`] as described on
    /// [`AcquisitionCoordinator::acquire_nodes`].
    pub async fn acquire_node(
        &self,
    ) -> Result<AcquisitionReport<P::Error>, AcquisitionError<P::Error>> {
        self.acquisition
            .acquire_nodes(&self.plan.request.with_count(1), self.plan.nodes_per_instance)
            .await
    }

    /// Acquires the configured number of instances and their nodes.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError`] as described on
    /// [`AcquisitionCoordinator::acquire_nodes`].
    pub async fn acquire_all_nodes(
        &self,
    ) -> Result<AcquisitionReport<P::Error>, AcquisitionError<P::Error>> {
        self.acquisition
            .acquire_nodes(&self.plan.request, self.plan.nodes_per_instance)
            .await
    }

    /// Records that a bootstrapped node connected back.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the registration is inconsistent with
    /// the registry or cannot be persisted.
    pub fn notify_acquired_node(
        &self,
        node_name: &str,
        instance_id: &str,
    ) -> Result<NodeRecord, RegistryError> {
        self.acquisition.on_node_acquired(node_name, instance_id)
    }

    /// Removes a node and terminates its instance when it was the last one.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError`] when the node is unknown or the removal cannot
    /// be persisted.
    pub async fn remove_node(
        &self,
        node_name: &str,
    ) -> Result<ReleaseOutcome<P::Error, R::Error>, ReleaseError> {
        self.release.release_node(node_name).await
    }

    /// Terminates an instance that never received a node.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError`] when the instance hosts nodes or is unknown.
    pub async fn remove_instance(
        &self,
        instance_id: &str,
    ) -> Result<TerminationStatus<P::Error>, ReleaseError> {
        self.release.release_instance(instance_id).await
    }

    /// Returns the nodes on `instance_id`.
    #[must_use]
    pub fn nodes_of(&self, instance_id: &str) -> BTreeSet<String> {
        self.registry.nodes_of(instance_id)
    }

    /// Returns true when `instance_id` hosts no nodes.
    #[must_use]
    pub fn is_empty(&self, instance_id: &str) -> bool {
        self.registry.is_empty(instance_id)
    }

    /// Returns every live instance and its nodes.
    #[must_use]
    pub fn snapshot(&self) -> InstanceRecords {
        self.registry.snapshot()
    }
}
