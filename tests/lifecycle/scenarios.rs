//! BDD scenarios for the node lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/node_lifecycle.feature",
    name = "Tear down an instance once its last node is removed"
)]
fn scenario_last_node_tears_down_instance(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/node_lifecycle.feature",
    name = "A failed bootstrap script does not stop its siblings"
)]
fn scenario_failed_script_is_isolated(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/node_lifecycle.feature",
    name = "Release an instance that never received a node"
)]
fn scenario_release_pending_instance(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/node_lifecycle.feature",
    name = "Stop before creating instances when infrastructure is unavailable"
)]
fn scenario_infrastructure_unavailable(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/node_lifecycle.feature",
    name = "Acquire a single instance from a larger node source"
)]
fn scenario_acquire_single_instance(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/node_lifecycle.feature",
    name = "Releasing the only node on one of two instances"
)]
fn scenario_release_only_node_of_instance(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}
