//! Batch acquisition of nodes on freshly created instances.
//!
//! Acquisition ensures the shared infrastructure exists, creates a batch of
//! instances in one provisioning call, and then dispatches one bootstrap
//! script per node. Dispatch fans out over instances and, within each
//! instance, over node indices; every unit of work runs in its own task and
//! reports its own result, so one failing node never cancels its siblings.
//!
//! Dispatch does not register nodes. A node joins the registry only when the
//! hosting framework reports that it connected back, through
//! [`AcquisitionCoordinator::on_node_acquired`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::provisioner::{InfrastructureRequest, InstanceProvisioner, InstanceRequest, OsFamily};
use crate::registry::{NodeInstanceRegistry, RegistryError, RegistryStore};
use crate::script::{self, ConnectionParams, ScriptError, ScriptTemplates};

/// A provisioned cloud instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Instance {
    /// Provider assigned identifier.
    pub id: String,
    /// Deployment label the instance belongs to.
    pub label: String,
    /// Operating system family of the booted image.
    pub os_family: OsFamily,
    /// When the provisioning call reported the instance.
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// Creates an instance record stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>, label: impl Into<String>, os_family: OsFamily) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            os_family,
            created_at: Utc::now(),
        }
    }
}

/// A node that connected back and was recorded in the registry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NodeRecord {
    /// Node name, unique within the deployment.
    pub name: String,
    /// Instance hosting the node.
    pub instance_id: String,
    /// 1-based index of the node on its instance, when the name follows the
    /// generated naming scheme.
    pub node_index: Option<u32>,
    /// When the registration was recorded.
    pub registered_at: DateTime<Utc>,
}

impl NodeRecord {
    fn new(name: &str, instance_id: &str) -> Self {
        Self {
            name: name.to_owned(),
            instance_id: instance_id.to_owned(),
            node_index: script::node_index_from_name(name, instance_id),
            registered_at: Utc::now(),
        }
    }
}

/// Errors that abort an acquisition batch.
#[derive(Debug, Error)]
pub enum AcquisitionError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the request is invalid; no remote call was made.
    #[error("invalid acquisition parameters: {message}")]
    Configuration {
        /// Description of the invalid parameter.
        message: String,
    },
    /// Raised when the shared infrastructure could not be ensured; no
    /// instance creation was attempted.
    #[error("infrastructure {label} is unavailable")]
    InfrastructureUnavailable {
        /// Infrastructure label.
        label: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when the provider ensured an infrastructure other than the one
    /// the instances are requested under; no instance creation was attempted.
    #[error("provider prepared infrastructure {returned}, but instances target {requested}")]
    LabelMismatch {
        /// Label the instance request names.
        requested: String,
        /// Label returned by the provider.
        returned: String,
    },
    /// Raised when no instance was created.
    #[error("no instances created in {label} (requested {requested})")]
    AcquisitionFailed {
        /// Infrastructure label.
        label: String,
        /// Number of instances requested.
        requested: u32,
        /// Provider error, absent when the call succeeded with no instances.
        #[source]
        source: Option<E>,
    },
    /// Raised when created instances could not be recorded. The listed
    /// instances exist and must be released by the caller.
    #[error("failed to record created instances {instance_ids:?}")]
    Registry {
        /// Instances that were created.
        instance_ids: Vec<String>,
        /// Registry error.
        #[source]
        source: RegistryError,
    },
}

/// Errors raised while dispatching the bootstrap script of one node.
#[derive(Debug, Error)]
pub enum DispatchError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the bootstrap command cannot be built.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// Raised when the provisioner fails to execute the script.
    #[error("script execution failed")]
    Execute {
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when the dispatch task ended without reporting a result.
    #[error("dispatch task aborted: {message}")]
    Aborted {
        /// Description of how the task ended.
        message: String,
    },
}

/// A node whose bootstrap script was dispatched.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchedNode {
    /// Instance the script ran on.
    pub instance_id: String,
    /// 1-based node index.
    pub node_index: u32,
    /// Name the node will register under.
    pub node_name: String,
}

/// A node whose bootstrap script could not be dispatched.
#[derive(Debug)]
pub struct DispatchFailure<E>
where
    E: std::error::Error + 'static,
{
    /// Instance the script targeted.
    pub instance_id: String,
    /// 1-based node index.
    pub node_index: u32,
    /// Name the node would have registered under.
    pub node_name: String,
    /// Why dispatch failed.
    pub error: DispatchError<E>,
}

/// Outcome of an acquisition batch.
///
/// Instances listed here exist even when every dispatch on them failed; the
/// caller owns them and must release them.
#[derive(Debug)]
pub struct AcquisitionReport<E>
where
    E: std::error::Error + 'static,
{
    /// Number of instances requested.
    pub requested: u32,
    /// Nodes requested on each instance.
    pub nodes_per_instance: u32,
    /// Instances that were created.
    pub instances: Vec<Instance>,
    /// Nodes whose script was dispatched.
    pub dispatched: Vec<DispatchedNode>,
    /// Nodes whose script failed to dispatch.
    pub failures: Vec<DispatchFailure<E>>,
}

impl<E> AcquisitionReport<E>
where
    E: std::error::Error + 'static,
{
    /// Number of instances that were created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.instances.len()
    }

    /// Returns true when fewer instances than requested were created or any
    /// dispatch failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        let requested = usize::try_from(self.requested).unwrap_or(usize::MAX);
        self.created() < requested || !self.failures.is_empty()
    }
}

type NodeOutcome<E> = Result<DispatchedNode, DispatchFailure<E>>;

/// Coordinates instance creation and bootstrap dispatch.
pub struct AcquisitionCoordinator<P, S> {
    provisioner: Arc<P>,
    registry: Arc<NodeInstanceRegistry<S>>,
    infrastructure: InfrastructureRequest,
    templates: Arc<ScriptTemplates>,
    params: Arc<ConnectionParams>,
}

impl<P, S> AcquisitionCoordinator<P, S>
where
    P: InstanceProvisioner + 'static,
    S: RegistryStore,
{
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        provisioner: Arc<P>,
        registry: Arc<NodeInstanceRegistry<S>>,
        infrastructure: InfrastructureRequest,
        templates: ScriptTemplates,
        params: ConnectionParams,
    ) -> Self {
        Self {
            provisioner,
            registry,
            infrastructure,
            templates: Arc::new(templates),
            params: Arc::new(params),
        }
    }

    /// Creates `request.count` instances and dispatches `nodes_per_instance`
    /// bootstrap scripts on each.
    ///
    /// A degraded batch (fewer instances than requested, or failed
    /// dispatches) still returns `Ok`; the report lists what happened.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError`] when the parameters are invalid, the
    /// infrastructure is unavailable, no instance was created, or created
    /// instances could not be recorded.
    pub async fn acquire_nodes(
        &self,
        request: &InstanceRequest,
        nodes_per_instance: u32,
    ) -> Result<AcquisitionReport<P::Error>, AcquisitionError<P::Error>> {
        self.check_parameters(request, nodes_per_instance)?;
        let label = self.ensure_infrastructure(request).await?;

        let ids = self
            .provisioner
            .create_instances(request)
            .await
            .map_err(|source| AcquisitionError::AcquisitionFailed {
                label: label.clone(),
                requested: request.count,
                source: Some(source),
            })?;
        if ids.is_empty() {
            return Err(AcquisitionError::AcquisitionFailed {
                label,
                requested: request.count,
                source: None,
            });
        }
        if ids.len() < usize::try_from(request.count).unwrap_or(usize::MAX) {
            warn!(
                %label,
                requested = request.count,
                created = ids.len(),
                "provider created fewer instances than requested"
            );
        }

        let instances = self.track_instances(ids, &label, request)?;
        let (dispatched, failures) = self.dispatch(&instances, nodes_per_instance).await;
        info!(
            %label,
            instances = instances.len(),
            dispatched = dispatched.len(),
            failed = failures.len(),
            "acquisition finished"
        );
        Ok(AcquisitionReport {
            requested: request.count,
            nodes_per_instance,
            instances,
            dispatched,
            failures,
        })
    }

    /// Records that `node_name` connected back from `instance_id`.
    ///
    /// Repeated notifications for the same node and instance succeed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the node belongs to another instance,
    /// the instance has been retired, or the registry cannot persist it.
    pub fn on_node_acquired(
        &self,
        node_name: &str,
        instance_id: &str,
    ) -> Result<NodeRecord, RegistryError> {
        if self.registry.put(instance_id, node_name)? {
            info!(%instance_id, node = %node_name, "node registered");
        } else {
            debug!(%instance_id, node = %node_name, "repeated node registration");
        }
        Ok(NodeRecord::new(node_name, instance_id))
    }

    fn check_parameters(
        &self,
        request: &InstanceRequest,
        nodes_per_instance: u32,
    ) -> Result<(), AcquisitionError<P::Error>> {
        let invalid = |message: String| AcquisitionError::Configuration { message };
        request.validate().map_err(|err| invalid(err.to_string()))?;
        if nodes_per_instance == 0 {
            return Err(invalid(String::from("nodes per instance must be at least 1")));
        }
        self.templates
            .select(request.os_family)
            .map_err(|err| invalid(err.to_string()))?;
        Ok(())
    }

    async fn ensure_infrastructure(
        &self,
        request: &InstanceRequest,
    ) -> Result<String, AcquisitionError<P::Error>> {
        let unavailable = |source| AcquisitionError::InfrastructureUnavailable {
            label: self.infrastructure.label.clone(),
            source,
        };
        self.provisioner.wait_until_ready().await.map_err(unavailable)?;
        let label = self
            .provisioner
            .ensure_infrastructure(&self.infrastructure)
            .await
            .map_err(unavailable)?;
        if label != request.infrastructure_label {
            return Err(AcquisitionError::LabelMismatch {
                requested: request.infrastructure_label.clone(),
                returned: label,
            });
        }
        debug!(%label, "infrastructure ready");
        Ok(label)
    }

    fn track_instances(
        &self,
        ids: BTreeSet<String>,
        label: &str,
        request: &InstanceRequest,
    ) -> Result<Vec<Instance>, AcquisitionError<P::Error>> {
        let failed = ids
            .iter()
            .find_map(|id| self.registry.track_instance(id).err());
        if let Some(source) = failed {
            return Err(AcquisitionError::Registry {
                instance_ids: ids.into_iter().collect(),
                source,
            });
        }
        Ok(ids
            .into_iter()
            .map(|id| Instance::new(id, label, request.os_family))
            .collect())
    }

    async fn dispatch(
        &self,
        instances: &[Instance],
        nodes_per_instance: u32,
    ) -> (Vec<DispatchedNode>, Vec<DispatchFailure<P::Error>>) {
        let mut tasks = JoinSet::new();
        for instance in instances {
            tasks.spawn(dispatch_instance(
                Arc::clone(&self.provisioner),
                Arc::clone(&self.templates),
                Arc::clone(&self.params),
                Arc::new(instance.clone()),
                nodes_per_instance,
            ));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(instance_outcomes) => outcomes.extend(instance_outcomes),
                Err(err) => warn!(error = %err, "instance dispatch task ended abnormally"),
            }
        }

        let mut dispatched = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(node) => dispatched.push(node),
                Err(failure) => failures.push(failure),
            }
        }
        failures.extend(self.unreported(instances, nodes_per_instance, &dispatched, &failures));
        failures.sort_by(|a, b| (&a.instance_id, a.node_index).cmp(&(&b.instance_id, b.node_index)));
        dispatched
            .sort_by(|a, b| (&a.instance_id, a.node_index).cmp(&(&b.instance_id, b.node_index)));
        (dispatched, failures)
    }

    /// Builds failures for node indices whose task ended without a result.
    fn unreported(
        &self,
        instances: &[Instance],
        nodes_per_instance: u32,
        dispatched: &[DispatchedNode],
        failures: &[DispatchFailure<P::Error>],
    ) -> Vec<DispatchFailure<P::Error>> {
        let reported: BTreeSet<(&str, u32)> = dispatched
            .iter()
            .map(|node| (node.instance_id.as_str(), node.node_index))
            .chain(
                failures
                    .iter()
                    .map(|failure| (failure.instance_id.as_str(), failure.node_index)),
            )
            .collect();
        instances
            .iter()
            .flat_map(|instance| {
                (1..=nodes_per_instance).map(move |node_index| (instance.id.as_str(), node_index))
            })
            .filter(|key| !reported.contains(key))
            .map(|(instance_id, node_index)| DispatchFailure {
                instance_id: instance_id.to_owned(),
                node_index,
                node_name: script::node_name(&self.params.node_source, instance_id, node_index),
                error: DispatchError::Aborted {
                    message: String::from("task panicked or was cancelled"),
                },
            })
            .collect()
    }
}

async fn dispatch_instance<P>(
    provisioner: Arc<P>,
    templates: Arc<ScriptTemplates>,
    params: Arc<ConnectionParams>,
    instance: Arc<Instance>,
    nodes_per_instance: u32,
) -> Vec<NodeOutcome<P::Error>>
where
    P: InstanceProvisioner + 'static,
{
    let mut tasks = JoinSet::new();
    for node_index in 1..=nodes_per_instance {
        let node_provisioner = Arc::clone(&provisioner);
        let node_templates = Arc::clone(&templates);
        let node_params = Arc::clone(&params);
        let node_instance = Arc::clone(&instance);
        tasks.spawn(async move {
            dispatch_node(
                node_provisioner.as_ref(),
                &node_templates,
                &node_params,
                &node_instance,
                node_index,
            )
            .await
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                if let Err(failure) = &outcome {
                    warn!(
                        instance_id = %failure.instance_id,
                        node = %failure.node_name,
                        node_index = failure.node_index,
                        error = %failure.error,
                        "bootstrap dispatch failed"
                    );
                }
                outcomes.push(outcome);
            }
            Err(err) => warn!(
                instance_id = %instance.id,
                error = %err,
                "node dispatch task ended abnormally"
            ),
        }
    }
    outcomes
}

async fn dispatch_node<P>(
    provisioner: &P,
    templates: &ScriptTemplates,
    params: &ConnectionParams,
    instance: &Instance,
    node_index: u32,
) -> NodeOutcome<P::Error>
where
    P: InstanceProvisioner,
{
    let fail = |error: DispatchError<P::Error>| DispatchFailure {
        instance_id: instance.id.clone(),
        node_index,
        node_name: script::node_name(&params.node_source, &instance.id, node_index),
        error,
    };
    let command = script::build_command(instance, templates, node_index, params)
        .map_err(|err| fail(DispatchError::Script(err)))?;
    provisioner
        .execute_script(&instance.id, &command.command, &command.extra_args)
        .await
        .map_err(|source| fail(DispatchError::Execute { source }))?;

    info!(
        instance_id = %instance.id,
        node = %command.node_name,
        node_index,
        "bootstrap script dispatched"
    );
    Ok(DispatchedNode {
        instance_id: instance.id.clone(),
        node_index,
        node_name: command.node_name,
    })
}
