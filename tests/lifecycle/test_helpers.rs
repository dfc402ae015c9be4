//! Shared fixtures for node lifecycle BDD scenarios.

use std::sync::Arc;

use nodefleet::test_support::{
    ScriptedProvisioner, ScriptedRuntime, sample_bootstrap, sample_context, sample_infrastructure,
    sample_request,
};
use nodefleet::{AcquisitionPlan, MemoryStore, NodeInstanceRegistry, NodeSourceInfrastructure};
use rstest::fixture;

pub type TestInfrastructure =
    NodeSourceInfrastructure<ScriptedProvisioner, ScriptedRuntime, MemoryStore>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AcquisitionOutcome {
    Report { dispatched: usize, failures: usize },
    Failure(String),
}

#[derive(Clone)]
pub struct LifecycleContext {
    pub provisioner: ScriptedProvisioner,
    pub runtime: ScriptedRuntime,
    pub infrastructure: Option<Arc<TestInfrastructure>>,
    pub outcome: Option<AcquisitionOutcome>,
}

impl LifecycleContext {
    pub fn infrastructure(&self) -> Arc<TestInfrastructure> {
        self.infrastructure
            .clone()
            .unwrap_or_else(|| panic!("test setup requires a configured node source"))
    }
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    LifecycleContext {
        provisioner: ScriptedProvisioner::new(&["i1", "i2", "i3"]),
        runtime: ScriptedRuntime::new(),
        infrastructure: None,
        outcome: None,
    }
}

pub fn build_infrastructure(
    context: &LifecycleContext,
    instances: u32,
    nodes_per_instance: u32,
) -> TestInfrastructure {
    let registry = NodeInstanceRegistry::open(MemoryStore::new())
        .unwrap_or_else(|err| panic!("registry should open: {err}"));
    let plan = AcquisitionPlan {
        infrastructure: sample_infrastructure(),
        request: sample_request(instances),
        nodes_per_instance,
        bootstrap: sample_bootstrap(),
    };
    NodeSourceInfrastructure::new(
        plan,
        &sample_context(),
        Arc::new(context.provisioner.clone()),
        Arc::new(context.runtime.clone()),
        Arc::new(registry),
    )
}
