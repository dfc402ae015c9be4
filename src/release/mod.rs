//! Node release and instance teardown.
//!
//! Releasing a node removes it from the registry first, then asks the runtime
//! to stop the node process, and finally terminates the hosting instance when
//! the removal emptied it. The registry removal is the commit point: kill and
//! termination failures are reported but never undo it.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::provisioner::{InstanceProvisioner, NodeRuntime};
use crate::registry::{NodeInstanceRegistry, RegistryError, RegistryStore};

/// Errors that prevent a release from taking effect.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Raised when the registry rejects the removal.
    #[error("failed to release {target}")]
    Registry {
        /// Node or instance being released.
        target: String,
        /// Registry error.
        #[source]
        source: RegistryError,
    },
}

impl ReleaseError {
    /// Returns the underlying registry error.
    #[must_use]
    pub const fn registry_error(&self) -> &RegistryError {
        match self {
            Self::Registry { source, .. } => source,
        }
    }
}

/// Raised when an emptied instance could not be terminated.
///
/// The instance is already gone from the registry; reclaiming it is left to
/// the provider's own cleanup.
#[derive(Debug, Error)]
#[error("failed to terminate instance {instance_id} in {label}")]
pub struct InstanceTerminationError<E>
where
    E: std::error::Error + 'static,
{
    /// Infrastructure label.
    pub label: String,
    /// Instance that should have been terminated.
    pub instance_id: String,
    /// Provider error.
    #[source]
    pub source: E,
}

/// What happened to the instance hosting a released node.
#[derive(Debug)]
pub enum TerminationStatus<E>
where
    E: std::error::Error + 'static,
{
    /// Other nodes remain on the instance.
    NotRequired,
    /// The instance was emptied and terminated.
    Terminated,
    /// The instance was emptied but termination failed.
    Failed(InstanceTerminationError<E>),
}

impl<E> TerminationStatus<E>
where
    E: std::error::Error + 'static,
{
    /// Returns true when a termination request was issued.
    #[must_use]
    pub const fn was_requested(&self) -> bool {
        !matches!(self, Self::NotRequired)
    }
}

/// Outcome of releasing one node.
#[derive(Debug)]
pub struct ReleaseOutcome<PE, RE>
where
    PE: std::error::Error + 'static,
    RE: std::error::Error + 'static,
{
    /// Released node.
    pub node_name: String,
    /// Instance that hosted the node.
    pub instance_id: String,
    /// Nodes left on the instance.
    pub remaining: usize,
    /// Error from the runtime when stopping the node process failed.
    pub kill_error: Option<RE>,
    /// Termination result for the hosting instance.
    pub termination: TerminationStatus<PE>,
}

/// Coordinates node removal and instance teardown.
pub struct ReleaseCoordinator<P, R, S> {
    provisioner: Arc<P>,
    runtime: Arc<R>,
    registry: Arc<NodeInstanceRegistry<S>>,
    label: String,
}

impl<P, R, S> ReleaseCoordinator<P, R, S>
where
    P: InstanceProvisioner,
    R: NodeRuntime,
    S: RegistryStore,
{
    /// Creates a coordinator terminating instances in the `label`
    /// infrastructure.
    #[must_use]
    pub fn new(
        provisioner: Arc<P>,
        runtime: Arc<R>,
        registry: Arc<NodeInstanceRegistry<S>>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            provisioner,
            runtime,
            registry,
            label: label.into(),
        }
    }

    /// Releases `node_name`.
    ///
    /// The node is gone from the pool once this returns `Ok`, whatever the
    /// kill and termination results recorded in the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError`] when the node is unknown or the removal cannot
    /// be persisted; nothing else is attempted in that case.
    pub async fn release_node(
        &self,
        node_name: &str,
    ) -> Result<ReleaseOutcome<P::Error, R::Error>, ReleaseError> {
        let removal = self
            .registry
            .remove(node_name)
            .map_err(|source| ReleaseError::Registry {
                target: node_name.to_owned(),
                source,
            })?;
        info!(
            instance_id = %removal.instance_id,
            node = %node_name,
            remaining = removal.remaining,
            "node removed from pool"
        );

        let kill_error = self.runtime.kill_node(node_name).await.err();
        if let Some(err) = &kill_error {
            warn!(node = %node_name, error = %err, "failed to stop node process");
        }

        let termination = if removal.emptied_instance() {
            self.terminate(&removal.instance_id).await
        } else {
            TerminationStatus::NotRequired
        };

        Ok(ReleaseOutcome {
            node_name: node_name.to_owned(),
            instance_id: removal.instance_id,
            remaining: removal.remaining,
            kill_error,
            termination,
        })
    }

    /// Terminates an instance that was created but never received a node.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError`] when the instance still hosts nodes, is
    /// unknown, or its tombstone cannot be written.
    pub async fn release_instance(
        &self,
        instance_id: &str,
    ) -> Result<TerminationStatus<P::Error>, ReleaseError> {
        let retired = self
            .registry
            .retire_instance(instance_id)
            .map_err(|source| ReleaseError::Registry {
                target: instance_id.to_owned(),
                source,
            })?;
        if !retired {
            return Ok(TerminationStatus::NotRequired);
        }
        Ok(self.terminate(instance_id).await)
    }

    async fn terminate(&self, instance_id: &str) -> TerminationStatus<P::Error> {
        match self
            .provisioner
            .terminate_instance(&self.label, instance_id)
            .await
        {
            Ok(()) => {
                info!(label = %self.label, %instance_id, "instance terminated");
                TerminationStatus::Terminated
            }
            Err(source) => {
                let error = InstanceTerminationError {
                    label: self.label.clone(),
                    instance_id: instance_id.to_owned(),
                    source,
                };
                warn!(error = %error, cause = %error.source, "instance termination failed");
                TerminationStatus::Failed(error)
            }
        }
    }
}
