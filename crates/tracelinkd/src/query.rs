use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracelink_analysis::{NodeClass, NodeSelector, TraversalEngine, TraversalStep};
use tracelink_core::CodeNode;

use crate::Workspace;
use crate::cli::{LongestChainsArgs, RootsOfArgs, TraverseArgs};

fn engine(workspace: &Workspace) -> Result<TraversalEngine> {
    TraversalEngine::load(&workspace.store, &workspace.config.traversal)
        .context("failed to load call graph")
}

fn selector(reference: &str, service: Option<&str>) -> NodeSelector {
    NodeSelector::parse(reference, service)
}

/// Flat step rendering; the full node record is too noisy for a listing.
fn step_json(step: &TraversalStep) -> Value {
    json!({
        "depth": step.depth,
        "name": step.node.name,
        "service": step.node.service,
        "endpoint": step.node.endpoint(),
        "sort_key": step.sort_key,
        "path": step.path,
        "via": step.via,
        "call_order": step.call_order,
    })
}

fn node_json(node: &CodeNode) -> Value {
    json!({
        "id": node.id,
        "name": node.name,
        "kind": node.kind,
        "service": node.service,
        "endpoint": node.endpoint(),
    })
}

pub(crate) fn forward(workspace: &Workspace, args: TraverseArgs) -> Result<Value> {
    let engine = engine(workspace)?;
    let selector = selector(&args.reference, args.service.as_deref());
    let steps = engine
        .forward(&selector, args.depth)
        .context("forward traversal failed")?;
    Ok(json!({
        "reference": args.reference,
        "max_depth": workspace.config.traversal.effective_depth(args.depth),
        "step_count": steps.len(),
        "steps": steps.iter().map(step_json).collect::<Vec<_>>(),
    }))
}

pub(crate) fn backward(workspace: &Workspace, args: TraverseArgs) -> Result<Value> {
    let engine = engine(workspace)?;
    let selector = selector(&args.reference, args.service.as_deref());
    let steps = engine
        .backward(&selector, args.depth)
        .context("backward traversal failed")?;
    Ok(json!({
        "reference": args.reference,
        "max_depth": workspace.config.traversal.effective_depth(args.depth),
        "step_count": steps.len(),
        "steps": steps.iter().map(step_json).collect::<Vec<_>>(),
    }))
}

pub(crate) fn roots(workspace: &Workspace) -> Result<Value> {
    let engine = engine(workspace)?;
    let roots = engine.roots();
    Ok(json!({
        "result_count": roots.len(),
        "roots": roots.into_iter().map(node_json).collect::<Vec<_>>(),
    }))
}

pub(crate) fn leaves(workspace: &Workspace) -> Result<Value> {
    let engine = engine(workspace)?;
    let leaves = engine.leaves();
    Ok(json!({
        "result_count": leaves.len(),
        "leaves": leaves.into_iter().map(node_json).collect::<Vec<_>>(),
    }))
}

pub(crate) fn classify(workspace: &Workspace) -> Result<Value> {
    let engine = engine(workspace)?;
    let classified = engine.classification();
    let count = |class: NodeClass| {
        classified
            .iter()
            .filter(|entry| entry.class == class)
            .count()
    };
    Ok(json!({
        "totals": {
            "root": count(NodeClass::Root),
            "leaf": count(NodeClass::Leaf),
            "both": count(NodeClass::Both),
            "neither": count(NodeClass::Neither),
        },
        "nodes": classified
            .iter()
            .map(|entry| {
                let mut node = node_json(&entry.node);
                node["class"] = json!(entry.class);
                node
            })
            .collect::<Vec<_>>(),
    }))
}

pub(crate) fn roots_of(workspace: &Workspace, args: RootsOfArgs) -> Result<Value> {
    let engine = engine(workspace)?;
    let selector = selector(&args.reference, args.service.as_deref());
    let ancestors = engine
        .roots_of(&selector)
        .context("root ancestor query failed")?;
    Ok(json!({
        "reference": args.reference,
        "result_count": ancestors.len(),
        "roots": ancestors
            .iter()
            .map(|ancestor| json!({
                "name": ancestor.node.name,
                "service": ancestor.node.service,
                "endpoint": ancestor.endpoint,
                "depth": ancestor.depth,
                "path": ancestor.path,
                "route": ancestor.route,
            }))
            .collect::<Vec<_>>(),
    }))
}

pub(crate) fn longest_chains(workspace: &Workspace, args: LongestChainsArgs) -> Result<Value> {
    let engine = engine(workspace)?;
    let chains = engine
        .longest_chains(args.top.clamp(1, 200))
        .context("longest chain query failed")?;
    Ok(json!({
        "result_count": chains.len(),
        "chains": chains,
    }))
}

pub(crate) fn cycles(workspace: &Workspace) -> Result<Value> {
    let cycles = engine(workspace)?.call_cycles();
    Ok(json!({
        "result_count": cycles.len(),
        "cycles": cycles,
    }))
}
