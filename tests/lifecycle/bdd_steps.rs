//! BDD step definitions for node acquisition and release.

use std::sync::Arc;

use nodefleet::script::node_name;
use nodefleet::AcquisitionReport;
use nodefleet::test_support::{SAMPLE_LABEL, ScriptedError};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{AcquisitionOutcome, LifecycleContext, build_infrastructure};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(format!("tokio runtime: {err}")))
}

fn outcome_of<E: std::error::Error>(
    result: Result<AcquisitionReport<ScriptedError>, E>,
) -> AcquisitionOutcome {
    match result {
        Ok(report) => AcquisitionOutcome::Report {
            dispatched: report.dispatched.len(),
            failures: report.failures.len(),
        },
        Err(err) => AcquisitionOutcome::Failure(err.to_string()),
    }
}

#[given("a node source with {instances:u32} instances of {nodes:u32} nodes each")]
fn configured_node_source(
    mut lifecycle_context: LifecycleContext,
    instances: u32,
    nodes: u32,
) -> LifecycleContext {
    let infrastructure = build_infrastructure(&lifecycle_context, instances, nodes);
    lifecycle_context.infrastructure = Some(Arc::new(infrastructure));
    lifecycle_context
}

#[given("the bootstrap script for node {index:u32} on instance \"{instance}\" fails")]
fn bootstrap_script_fails(
    lifecycle_context: LifecycleContext,
    index: u32,
    instance: String,
) -> LifecycleContext {
    lifecycle_context
        .provisioner
        .fail_script(instance.trim(), index);
    lifecycle_context
}

#[given("the infrastructure cannot be prepared")]
fn infrastructure_fails(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.provisioner.fail_infrastructure();
    lifecycle_context
}

#[when("I acquire all nodes")]
fn acquire_all_nodes(
    mut lifecycle_context: LifecycleContext,
) -> Result<LifecycleContext, StepError> {
    let infrastructure = lifecycle_context.infrastructure();
    let result = runtime()?.block_on(async move { infrastructure.acquire_all_nodes().await });
    lifecycle_context.outcome = Some(outcome_of(result));
    Ok(lifecycle_context)
}

#[when("I acquire a single instance")]
fn acquire_single_instance(
    mut lifecycle_context: LifecycleContext,
) -> Result<LifecycleContext, StepError> {
    let infrastructure = lifecycle_context.infrastructure();
    let result = runtime()?.block_on(async move { infrastructure.acquire_node().await });
    lifecycle_context.outcome = Some(outcome_of(result));
    Ok(lifecycle_context)
}

#[when("node {index:u32} on instance \"{instance}\" connects back")]
fn node_connects_back(
    lifecycle_context: LifecycleContext,
    index: u32,
    instance: String,
) -> Result<LifecycleContext, StepError> {
    let name = node_name(SAMPLE_LABEL, instance.trim(), index);
    lifecycle_context
        .infrastructure()
        .notify_acquired_node(&name, instance.trim())
        .map_err(|err| StepError::Assertion(format!("registering {name}: {err}")))?;
    Ok(lifecycle_context)
}

#[when("node \"{node}\" connects back from instance \"{instance}\"")]
fn named_node_connects_back(
    lifecycle_context: LifecycleContext,
    node: String,
    instance: String,
) -> Result<LifecycleContext, StepError> {
    lifecycle_context
        .infrastructure()
        .notify_acquired_node(node.trim(), instance.trim())
        .map_err(|err| StepError::Assertion(format!("registering {node}: {err}")))?;
    Ok(lifecycle_context)
}

#[when("I release node \"{node}\"")]
fn release_named_node(
    lifecycle_context: LifecycleContext,
    node: String,
) -> Result<LifecycleContext, StepError> {
    let infrastructure = lifecycle_context.infrastructure();
    let node_name = node.trim().to_owned();
    runtime()?
        .block_on(async move { infrastructure.remove_node(&node_name).await })
        .map_err(|err| StepError::Assertion(format!("releasing {node}: {err}")))?;
    Ok(lifecycle_context)
}

#[when("I remove node {index:u32} on instance \"{instance}\"")]
fn remove_node(
    lifecycle_context: LifecycleContext,
    index: u32,
    instance: String,
) -> Result<LifecycleContext, StepError> {
    let name = node_name(SAMPLE_LABEL, instance.trim(), index);
    let infrastructure = lifecycle_context.infrastructure();
    let removed_name = name.clone();
    runtime()?
        .block_on(async move { infrastructure.remove_node(&removed_name).await })
        .map_err(|err| StepError::Assertion(format!("removing {name}: {err}")))?;
    Ok(lifecycle_context)
}

#[when("I remove instance \"{instance}\"")]
fn remove_instance(
    lifecycle_context: LifecycleContext,
    instance: String,
) -> Result<LifecycleContext, StepError> {
    let infrastructure = lifecycle_context.infrastructure();
    let instance_id = instance.trim().to_owned();
    runtime()?
        .block_on(async move { infrastructure.remove_instance(&instance_id).await })
        .map_err(|err| StepError::Assertion(format!("removing instance {instance}: {err}")))?;
    Ok(lifecycle_context)
}

#[then("{count:u32} bootstrap scripts are dispatched")]
fn scripts_dispatched(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    match lifecycle_context.outcome {
        Some(AcquisitionOutcome::Report { dispatched, .. }) if dispatched == count as usize => Ok(()),
        ref other => Err(StepError::Assertion(format!(
            "expected {count} dispatched scripts, got {other:?}"
        ))),
    }
}

#[then("the acquisition reports {count:u32} failed nodes")]
fn failed_nodes(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    match lifecycle_context.outcome {
        Some(AcquisitionOutcome::Report { failures, .. }) if failures == count as usize => Ok(()),
        ref other => Err(StepError::Assertion(format!(
            "expected {count} failed nodes, got {other:?}"
        ))),
    }
}

#[then("the acquisition fails mentioning \"{text}\"")]
fn acquisition_fails(lifecycle_context: &LifecycleContext, text: String) -> Result<(), StepError> {
    match lifecycle_context.outcome {
        Some(AcquisitionOutcome::Failure(ref message)) if message.contains(text.trim()) => Ok(()),
        ref other => Err(StepError::Assertion(format!(
            "expected failure mentioning {text}, got {other:?}"
        ))),
    }
}

#[then("no instance is created")]
fn no_instance_created(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let calls = lifecycle_context.provisioner.create_calls();
    if calls.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no creation calls, got {calls:?}"
        )))
    }
}

#[then("no instance is terminated")]
fn no_instance_terminated(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let terminations = lifecycle_context.provisioner.terminations();
    if terminations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no terminations, got {terminations:?}"
        )))
    }
}

#[then("instance \"{instance}\" is terminated once")]
fn instance_terminated_once(
    lifecycle_context: &LifecycleContext,
    instance: String,
) -> Result<(), StepError> {
    let terminations = lifecycle_context.provisioner.terminations();
    let matching = terminations
        .iter()
        .filter(|termination| {
            termination.instance_id == instance.trim() && termination.label == SAMPLE_LABEL
        })
        .count();
    if matching == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one termination of {instance}, got {terminations:?}"
        )))
    }
}

#[then("the registry lists only instance \"{instance}\"")]
fn registry_lists_only(
    lifecycle_context: &LifecycleContext,
    instance: String,
) -> Result<(), StepError> {
    let snapshot = lifecycle_context.infrastructure().snapshot();
    let instances: Vec<&String> = snapshot.keys().collect();
    if instances == [instance.trim()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected only {instance} in the registry, got {snapshot:?}"
        )))
    }
}

#[then("the provider is asked for {count:u32} instance")]
fn provider_asked_for(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let calls = lifecycle_context.provisioner.create_calls();
    if calls == [count] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one request for {count} instances, got {calls:?}"
        )))
    }
}

#[then("instance \"{instance}\" hosts {count:u32} nodes")]
fn instance_hosts(
    lifecycle_context: &LifecycleContext,
    instance: String,
    count: u32,
) -> Result<(), StepError> {
    let nodes = lifecycle_context.infrastructure().nodes_of(instance.trim());
    if nodes.len() == count as usize {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} nodes on {instance}, got {nodes:?}"
        )))
    }
}

#[then("instance \"{instance}\" hosts no nodes")]
fn instance_hosts_nothing(
    lifecycle_context: &LifecycleContext,
    instance: String,
) -> Result<(), StepError> {
    if lifecycle_context.infrastructure().is_empty(instance.trim()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("expected no nodes on {instance}")))
    }
}

#[then("instance \"{instance}\" hosts only node \"{node}\"")]
fn instance_hosts_only(
    lifecycle_context: &LifecycleContext,
    instance: String,
    node: String,
) -> Result<(), StepError> {
    let nodes = lifecycle_context.infrastructure().nodes_of(instance.trim());
    if nodes.len() == 1 && nodes.contains(node.trim()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {instance} to host only {node}, got {nodes:?}"
        )))
    }
}

#[then("no instance other than \"{instance}\" is terminated")]
fn only_instance_terminated(
    lifecycle_context: &LifecycleContext,
    instance: String,
) -> Result<(), StepError> {
    let terminations = lifecycle_context.provisioner.terminations();
    if terminations
        .iter()
        .all(|termination| termination.instance_id == instance.trim())
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected only {instance} to be terminated, got {terminations:?}"
        )))
    }
}
