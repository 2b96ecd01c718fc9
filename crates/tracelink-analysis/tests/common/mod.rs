#![allow(dead_code)]

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tracelink_config::StorageConfig;
use tracelink_core::{
    ApiExposure, CodeAttributes, CodeKind, CodeNodeId, LogFields, RelationshipType, Severity,
};
use tracelink_store::{
    CodeBatch, CodeEdgeRecord, CodeNodeFilter, CodeNodeRecord, GraphStore, LogBatch,
    LogEventRecord, SqliteGraphStore,
};

pub const RETAIL_TRACE: &str = "trace-retail-001";
pub const ALGO_TRACE: &str = "trace-algo-001";

pub fn open_store(workspace: &Path) -> Result<SqliteGraphStore> {
    SqliteGraphStore::open(workspace, &StorageConfig::default()).context("open graph store")
}

pub fn function(name: &str, service: &str, summary: &str) -> CodeNodeRecord {
    CodeNodeRecord {
        key: format!("{service}::{name}"),
        name: name.to_owned(),
        kind: CodeKind::Function,
        service: service.to_owned(),
        api: None,
        parameters: Vec::new(),
        summary: summary.to_owned(),
        snippet: String::new(),
        file_path: format!("{service}/main.py"),
        attributes: CodeAttributes::default(),
    }
}

pub fn exposed(
    name: &str,
    service: &str,
    method: &str,
    path: &str,
    summary: &str,
) -> CodeNodeRecord {
    CodeNodeRecord {
        api: Some(ApiExposure::new(method, path)),
        ..function(name, service, summary)
    }
}

pub fn edge(
    from: &CodeNodeRecord,
    to: &CodeNodeRecord,
    kind: RelationshipType,
    call_order: Option<u32>,
) -> CodeEdgeRecord {
    CodeEdgeRecord {
        from_key: from.key.clone(),
        to_key: to.key.clone(),
        kind,
        call_order,
        line: None,
        description: String::new(),
    }
}

pub fn calls(from: &CodeNodeRecord, to: &CodeNodeRecord, call_order: u32) -> CodeEdgeRecord {
    edge(from, to, RelationshipType::Calls, Some(call_order))
}

/// place_order -> validate_trade -> validate_account_balance, one call each.
pub fn order_chain_code() -> CodeBatch {
    let place_order = exposed(
        "place_order",
        "orchestrator",
        "POST",
        "/orders",
        "Accepts a retail order",
    );
    let validate_trade = function("validate_trade", "trade_service", "Validates trade fields");
    let balance = function(
        "validate_account_balance",
        "trade_service",
        "Checks buying power",
    );

    CodeBatch {
        batch_id: "code-chain".to_owned(),
        edges: vec![
            calls(&place_order, &validate_trade, 1),
            calls(&validate_trade, &balance, 1),
        ],
        nodes: vec![place_order, validate_trade, balance],
    }
}

/// Two order entry points sharing the validation path, a risk service
/// reached over HTTP, and a standalone health check.
pub fn trade_platform_code() -> CodeBatch {
    let place_order = exposed(
        "place_order",
        "orchestrator",
        "POST",
        "/orders",
        "Accepts a retail order",
    );
    let place_algo_order = exposed(
        "place_algo_order",
        "orchestrator",
        "POST",
        "/algo/orders",
        "Accepts an algo order",
    );
    let health_check = exposed("health_check", "orchestrator", "GET", "/health", "");
    let validate_trade = function("validate_trade", "trade_service", "Validates trade fields");
    let balance = function(
        "validate_account_balance",
        "trade_service",
        "Checks buying power",
    );
    let quantity = function("validate_quantity", "trade_service", "");
    let execute_trade = function("execute_trade", "trade_service", "Executes the trade");
    let price = function("get_market_price", "market_service", "Fetches latest price");
    let assess_risk = exposed(
        "assess_risk",
        "risk_service",
        "POST",
        "/risk/assess",
        "Scores trade risk",
    );
    let risk_engine = CodeNodeRecord {
        kind: CodeKind::Class,
        ..function("RiskEngine", "risk_service", "")
    };

    CodeBatch {
        batch_id: "code-platform".to_owned(),
        edges: vec![
            calls(&place_order, &validate_trade, 1),
            calls(&place_order, &execute_trade, 2),
            calls(&validate_trade, &balance, 1),
            calls(&validate_trade, &quantity, 2),
            calls(&execute_trade, &price, 1),
            edge(&execute_trade, &assess_risk, RelationshipType::ApiCalls, Some(2)),
            calls(&place_algo_order, &validate_trade, 1),
            edge(&place_algo_order, &assess_risk, RelationshipType::ApiCalls, Some(2)),
            edge(&risk_engine, &assess_risk, RelationshipType::Contains, None),
        ],
        nodes: vec![
            place_order,
            place_algo_order,
            health_check,
            validate_trade,
            balance,
            quantity,
            execute_trade,
            price,
            assess_risk,
            risk_engine,
        ],
    }
}

/// loop_entry -> a -> b -> a
pub fn cyclic_code() -> CodeBatch {
    let entry = exposed("loop_entry", "loop_service", "POST", "/loop", "Starts the loop");
    let a = function("a", "loop_service", "");
    let b = function("b", "loop_service", "");

    CodeBatch {
        batch_id: "code-cycle".to_owned(),
        edges: vec![calls(&entry, &a, 1), calls(&a, &b, 1), calls(&b, &a, 1)],
        nodes: vec![entry, a, b],
    }
}

pub fn at(second: i64) -> DateTime<Utc> {
    let base = Utc
        .with_ymd_and_hms(2024, 1, 15, 10, 30, 0)
        .single()
        .expect("valid base timestamp");
    base + Duration::seconds(second)
}

pub fn event(
    key: &str,
    trace_id: &str,
    second: i64,
    service: &str,
    level: Severity,
    message: &str,
) -> LogEventRecord {
    LogEventRecord {
        key: key.to_owned(),
        timestamp: at(second),
        service: service.to_owned(),
        level,
        trace_id: trace_id.to_owned(),
        message: message.to_owned(),
        fields: LogFields::default(),
    }
}

pub fn trade_platform_logs() -> LogBatch {
    let mut quantity_error = event(
        "r3",
        RETAIL_TRACE,
        2,
        "trade_service",
        Severity::Error,
        "Invalid quantity: -50",
    );
    quantity_error.fields.function = Some("validate_quantity".to_owned());
    quantity_error.fields.error_code = Some("E_QTY".to_owned());

    let mut rejected = event(
        "r4",
        RETAIL_TRACE,
        3,
        "orchestrator",
        Severity::Error,
        "Order ORD-1 rejected",
    );
    rejected.fields.error_code = Some("E_VALIDATION".to_owned());

    LogBatch {
        batch_id: "logs-1".to_owned(),
        events: vec![
            event(
                "r1",
                RETAIL_TRACE,
                0,
                "orchestrator",
                Severity::Info,
                "[place_order] Received order ORD-1 for AAPL",
            ),
            event(
                "r2",
                RETAIL_TRACE,
                1,
                "trade_service",
                Severity::Info,
                "[validate_trade] Validating order ORD-1",
            ),
            quantity_error,
            rejected,
            event(
                "a1",
                ALGO_TRACE,
                10,
                "orchestrator",
                Severity::Info,
                "[place_algo_order] Slicing parent order",
            ),
            event(
                "a2",
                ALGO_TRACE,
                11,
                "risk_service",
                Severity::Error,
                "Risk assessment failed: exposure limit breached",
            ),
            event(
                "a3",
                ALGO_TRACE,
                12,
                "market_service",
                Severity::Info,
                "price feed heartbeat",
            ),
        ],
        next_log: Vec::new(),
    }
}

pub fn seed_trade_platform(store: &SqliteGraphStore) -> Result<()> {
    store
        .ingest_code_batch(&trade_platform_code())
        .context("ingest trade platform code")?;
    store
        .ingest_log_batch(&trade_platform_logs())
        .context("ingest trade platform logs")?;
    Ok(())
}

pub fn id_of(store: &SqliteGraphStore, name: &str) -> Result<CodeNodeId> {
    let nodes = store.code_nodes(&CodeNodeFilter::named(name))?;
    nodes
        .first()
        .map(|node| node.id)
        .with_context(|| format!("code node {name} exists"))
}
