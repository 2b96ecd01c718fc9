mod common;

use anyhow::Result;
use tempfile::tempdir;
use tracelink_analysis::{
    AnalysisError, NodeSelector, TraversalEngine, WorkflowFreshness, WorkflowMaterializer,
};
use tracelink_config::TracelinkConfig;
use tracelink_core::{NodeRef, RelationshipType};
use tracelink_store::{GraphStore, NewRelationship, WorkflowStore};

use common::{cyclic_code, id_of, open_store, trade_platform_code};

#[test]
fn materialized_route_matches_live_forward_traversal() -> Result<()> {
    let temp = tempdir()?;
    let store = open_store(temp.path())?;
    store.ingest_code_batch(&trade_platform_code())?;

    let config = TracelinkConfig::default();
    let outcome = WorkflowMaterializer::new(&config).materialize(&store)?;
    assert_eq!(outcome.workflows.len(), 3);
    assert!(outcome.skipped.is_empty());

    let engine = TraversalEngine::load(&store, &config.traversal)?;
    assert_eq!(outcome.fingerprint, engine.fingerprint());
    for workflow in &outcome.workflows {
        let live = engine
            .unbounded_forward(workflow.entry_node_id)?
            .into_iter()
            .map(|step| step.node.name)
            .collect::<Vec<_>>();
        assert_eq!(workflow.route, live, "{}", workflow.entry_point);
        assert_eq!(workflow.total_steps as usize, live.len());
    }

    let place_order = store
        .workflows_by_entry("place_order")?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("place_order workflow exists"))?;
    assert_eq!(place_order.workflow_type, "retail");
    assert_eq!(place_order.endpoint.as_deref(), Some("POST /orders"));
    assert_eq!(
        place_order.route,
        vec![
            "place_order",
            "validate_trade",
            "validate_account_balance",
            "validate_quantity",
            "execute_trade",
            "get_market_price",
            "assess_risk",
        ]
    );
    assert_eq!(
        place_order.services,
        vec!["market_service", "orchestrator", "risk_service", "trade_service"]
    );
    assert!(place_order.summary.starts_with(
        "Workflow 'place_order': Accepts a retail order → Validates trade fields → "
    ));
    assert!(place_order.summary.ends_with(
        " ... and 1 more steps. Involves 4 service(s): \
         market_service, orchestrator, risk_service, trade_service"
    ));

    let steps = store.workflow_steps(place_order.workflow_id)?;
    assert_eq!(steps.len(), 7);
    assert_eq!(steps[0].sort_key, "1");
    assert_eq!(steps[6].sort_key, "1.002.002");
    assert_eq!(steps[6].depth, 2);
    assert_eq!(steps[6].service, "risk_service");

    let listed = store
        .workflows()?
        .into_iter()
        .map(|workflow| (workflow.workflow_type, workflow.entry_point))
        .collect::<Vec<_>>();
    assert_eq!(
        listed,
        vec![
            ("algo".to_owned(), "place_algo_order".to_owned()),
            ("common".to_owned(), "health_check".to_owned()),
            ("retail".to_owned(), "place_order".to_owned()),
        ]
    );
    let health = store.workflows_by_entry("health_check")?;
    assert_eq!(health[0].summary, "Workflow with 1 steps");
    Ok(())
}

#[test]
fn rematerializing_replaces_the_catalog() -> Result<()> {
    let temp = tempdir()?;
    let store = open_store(temp.path())?;
    store.ingest_code_batch(&trade_platform_code())?;

    let materializer = WorkflowMaterializer::new(&TracelinkConfig::default());
    let first = materializer.materialize(&store)?;
    let second = materializer.materialize(&store)?;
    assert_eq!(store.workflows()?.len(), 3);
    assert_eq!(first.fingerprint, second.fingerprint);
    for (left, right) in first.workflows.iter().zip(&second.workflows) {
        assert_eq!(left.route, right.route);
        assert_ne!(left.workflow_id, right.workflow_id);
    }

    let mut config = TracelinkConfig::default();
    config.workflows.entry_services = vec!["payments".to_owned()];
    let filtered = WorkflowMaterializer::new(&config).materialize(&store)?;
    assert!(filtered.workflows.is_empty());
    assert!(store.workflows()?.is_empty());
    Ok(())
}

#[test]
fn stale_workflows_are_detected_after_graph_changes() -> Result<()> {
    let temp = tempdir()?;
    let store = open_store(temp.path())?;
    store.ingest_code_batch(&trade_platform_code())?;

    let materializer = WorkflowMaterializer::new(&TracelinkConfig::default());
    let outcome = materializer.materialize(&store)?;
    let workflow_id = outcome
        .workflows
        .iter()
        .find(|workflow| workflow.entry_point == "place_order")
        .map(|workflow| workflow.workflow_id)
        .ok_or_else(|| anyhow::anyhow!("place_order workflow exists"))?;
    assert_eq!(materializer.verify(&store, workflow_id)?, WorkflowFreshness::Fresh);

    let mut extra = NewRelationship::new(
        RelationshipType::Calls,
        NodeRef::code(id_of(&store, "validate_account_balance")?),
        NodeRef::code(id_of(&store, "get_market_price")?),
    );
    extra.call_order = Some(1);
    store.create_edges("manual", &[extra])?;

    let freshness = materializer.verify(&store, workflow_id)?;
    assert!(!freshness.is_fresh());
    assert!(matches!(freshness, WorkflowFreshness::Stale { .. }));

    assert!(matches!(
        materializer.verify(&store, workflow_id + 100),
        Err(AnalysisError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn rca_queries_find_workflows_through_any_step() -> Result<()> {
    let temp = tempdir()?;
    let store = open_store(temp.path())?;
    store.ingest_code_batch(&trade_platform_code())?;

    let materializer = WorkflowMaterializer::new(&TracelinkConfig::default());
    materializer.materialize(&store)?;

    let details = materializer.workflow_details(&store, "validate_quantity")?;
    assert!(!details.entry_point);
    let entries = details
        .workflows
        .iter()
        .map(|view| view.workflow.entry_point.as_str())
        .collect::<Vec<_>>();
    assert_eq!(entries, vec!["place_algo_order", "place_order"]);
    assert!(details.workflows.iter().all(|view| view.highlighted == vec![4]));

    let entry = materializer.workflow_details(&store, "place_order")?;
    assert!(entry.entry_point);
    assert_eq!(entry.workflows.len(), 1);
    assert_eq!(entry.workflows[0].steps.len(), 7);
    assert_eq!(entry.workflows[0].highlighted, vec![1]);

    assert!(matches!(
        materializer.workflow_details(&store, "nothing_calls_this"),
        Err(AnalysisError::NotFound(_))
    ));

    let memberships = materializer.workflows_for_function(&store, "assess_risk")?;
    assert_eq!(memberships.len(), 2);
    assert!(memberships.iter().all(|membership| membership.step.service == "risk_service"));

    let by_service = materializer
        .workflows_for_service(&store, "risk_service")?
        .into_iter()
        .map(|workflow| (workflow.entry_point, workflow.total_steps))
        .collect::<Vec<_>>();
    assert_eq!(
        by_service,
        vec![
            ("place_order".to_owned(), 7),
            ("place_algo_order".to_owned(), 5),
        ]
    );
    assert_eq!(materializer.list_workflows(&store)?.len(), 3);
    Ok(())
}

#[test]
fn cyclic_roots_are_skipped() -> Result<()> {
    let temp = tempdir()?;
    let store = open_store(temp.path())?;
    store.ingest_code_batch(&cyclic_code())?;

    let outcome = WorkflowMaterializer::new(&TracelinkConfig::default()).materialize(&store)?;
    assert!(outcome.workflows.is_empty());
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].entry_point, "loop_entry");
    assert!(outcome.skipped[0].reason.contains("a -> b -> a"));

    let engine = TraversalEngine::load(&store, &TracelinkConfig::default().traversal)?;
    assert!(engine.forward(&NodeSelector::name("b"), Some(1)).is_ok());
    Ok(())
}
