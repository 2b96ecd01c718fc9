use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use tracelink_config::{StorageConfig, tracelink_dir};
use tracelink_core::{
    ApiExposure, CodeAttributes, CodeKind, CodeNode, CodeNodeId, Direction, LogEvent, LogEventId, LogFields,
    NodeKind, NodeRef, Relationship, RelationshipType, Severity,
};
use tracing::{debug, info};

use crate::{
    CodeBatch, CodeIngestOutcome, CodeNodeFilter, EdgeFilter, GraphStore, LogBatch,
    LogEventFilter, LogIngestOutcome, NewRelationship, StoreError, run_migrations,
};

const SEVERITIES: [Severity; 5] = [
    Severity::Debug,
    Severity::Info,
    Severity::Warning,
    Severity::Error,
    Severity::Critical,
];

const CODE_NODE_COLUMNS: &str = "id, node_key, name, kind, service, http_method, http_path, \
     parameters, summary, snippet, file_path, attributes, batch_id";

const LOG_EVENT_COLUMNS: &str = "id, event_key, timestamp_us, service, level, trace_id, message, \
     error_code, error_type, duration_ms, function_name, order_id, exception, batch_id";

const RELATIONSHIP_COLUMNS: &str = "id, rel_type, from_kind, from_id, to_kind, to_id, \
     call_order, line, description, created_at, batch_id";

const INSERT_RELATIONSHIP: &str = r#"
    INSERT INTO relationships (
        rel_type, from_kind, from_id, to_kind, to_id, call_order, line, description, created_at, batch_id
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    ON CONFLICT(from_kind, from_id, to_kind, to_id, rel_type) DO NOTHING
"#;

/// SQLite-backed graph. Reads open their own connection; writes are
/// serialized through `write_lock` and run inside one transaction each.
pub struct SqliteGraphStore {
    sqlite_path: PathBuf,
    write_lock: Mutex<()>,
}

impl SqliteGraphStore {
    pub fn open(
        workspace_root: impl AsRef<Path>,
        config: &StorageConfig,
    ) -> Result<Self, StoreError> {
        let tracelink_dir = tracelink_dir(workspace_root);
        let sqlite_path = tracelink_dir.join(&config.sqlite_file);

        fs::create_dir_all(&tracelink_dir)?;

        let conn = Connection::open(&sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            sqlite_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    pub(crate) fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.sqlite_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub(crate) fn write<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl GraphStore for SqliteGraphStore {
    fn ingest_code_batch(&self, batch: &CodeBatch) -> Result<CodeIngestOutcome, StoreError> {
        let checked = batch.check()?;
        let created_at = Utc::now().to_rfc3339();

        let outcome = self.write(|tx| {
            let replaced_nodes =
                tx.query_row("SELECT COUNT(*) FROM code_nodes", [], |row| row.get::<_, i64>(0))?;
            tx.execute(
                "DELETE FROM relationships WHERE from_kind = 'code' OR to_kind = 'code'",
                [],
            )?;
            tx.execute("DELETE FROM workflow_functions", [])?;
            tx.execute("DELETE FROM workflow_catalog", [])?;
            tx.execute("DELETE FROM code_nodes", [])?;

            let mut ids = HashMap::with_capacity(batch.nodes.len());
            {
                let mut stmt = tx.prepare(
                    r#"
                    INSERT INTO code_nodes (
                        node_key, name, kind, service, http_method, http_path,
                        parameters, summary, snippet, file_path, attributes, batch_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                    "#,
                )?;
                for node in &batch.nodes {
                    let id = stmt.insert(params![
                        node.key,
                        node.name,
                        node.kind.as_str(),
                        node.service,
                        node.api.as_ref().map(|api| api.method.as_str()),
                        node.api.as_ref().map(|api| api.path.as_str()),
                        serde_json::to_string(&node.parameters)?,
                        node.summary,
                        node.snippet,
                        node.file_path,
                        node.attributes.to_json()?,
                        batch.batch_id,
                    ])?;
                    ids.insert(node.key.as_str(), id);
                }
            }

            let mut edges_written = 0usize;
            {
                let mut stmt = tx.prepare(INSERT_RELATIONSHIP)?;
                for edge in &checked.edges {
                    let (Some(from), Some(to)) = (
                        ids.get(edge.from_key.as_str()),
                        ids.get(edge.to_key.as_str()),
                    ) else {
                        return Err(StoreError::ConstraintViolation(format!(
                            "{} edge {} -> {} lost its endpoints",
                            edge.kind, edge.from_key, edge.to_key
                        )));
                    };
                    edges_written += stmt.execute(params![
                        edge.kind.as_str(),
                        NodeKind::Code.as_str(),
                        from,
                        NodeKind::Code.as_str(),
                        to,
                        edge.call_order,
                        edge.line,
                        edge.description,
                        created_at,
                        batch.batch_id,
                    ])?;
                }
            }

            Ok(CodeIngestOutcome {
                batch_id: batch.batch_id.clone(),
                nodes_written: ids.len(),
                edges_written,
                duplicate_edges: checked.duplicates,
                replaced_nodes: replaced_nodes as usize,
            })
        })?;

        info!(
            batch_id = %outcome.batch_id,
            nodes = outcome.nodes_written,
            edges = outcome.edges_written,
            replaced = outcome.replaced_nodes,
            "ingested code batch"
        );
        Ok(outcome)
    }

    fn ingest_log_batch(&self, batch: &LogBatch) -> Result<LogIngestOutcome, StoreError> {
        let chain = batch.check()?;
        let traces = batch
            .trace_ids()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        let created_at = Utc::now().to_rfc3339();

        let outcome = self.write(|tx| {
            for trace_id in &traces {
                let stored = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM log_events WHERE trace_id = ?1)",
                    params![trace_id],
                    |row| row.get::<_, bool>(0),
                )?;
                if stored {
                    return Err(StoreError::ConstraintViolation(format!(
                        "trace '{trace_id}' is already stored; traces are ingested once"
                    )));
                }
            }

            let mut ids = HashMap::with_capacity(batch.events.len());
            {
                let mut exists =
                    tx.prepare("SELECT EXISTS(SELECT 1 FROM log_events WHERE event_key = ?1)")?;
                let mut stmt = tx.prepare(
                    r#"
                    INSERT INTO log_events (
                        event_key, timestamp_us, service, level, trace_id, message,
                        error_code, error_type, duration_ms, function_name, order_id, exception, batch_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    "#,
                )?;
                for event in &batch.events {
                    if exists.query_row(params![event.key], |row| row.get::<_, bool>(0))? {
                        return Err(StoreError::ConstraintViolation(format!(
                            "log event key '{}' is already stored",
                            event.key
                        )));
                    }
                    let id = stmt.insert(params![
                        event.key,
                        event.timestamp.timestamp_micros(),
                        event.service,
                        event.level.as_str(),
                        event.trace_id,
                        event.message,
                        event.fields.error_code,
                        event.fields.error_type,
                        event.fields.duration_ms,
                        event.fields.function,
                        event.fields.order_id,
                        event.fields.exception,
                        batch.batch_id,
                    ])?;
                    ids.insert(event.key.as_str(), id);
                }
            }

            let mut next_log_written = 0usize;
            {
                let mut stmt = tx.prepare(INSERT_RELATIONSHIP)?;
                for link in &chain {
                    let (Some(from), Some(to)) =
                        (ids.get(link.from_key.as_str()), ids.get(link.to_key.as_str()))
                    else {
                        continue;
                    };
                    next_log_written += stmt.execute(params![
                        RelationshipType::NextLog.as_str(),
                        NodeKind::Log.as_str(),
                        from,
                        NodeKind::Log.as_str(),
                        to,
                        Option::<u32>::None,
                        Option::<u32>::None,
                        "Next log in trace",
                        created_at,
                        batch.batch_id,
                    ])?;
                }
            }

            Ok(LogIngestOutcome {
                batch_id: batch.batch_id.clone(),
                events_written: ids.len(),
                next_log_written,
                traces: traces.clone(),
            })
        })?;

        info!(
            batch_id = %outcome.batch_id,
            events = outcome.events_written,
            traces = outcome.traces.len(),
            next_log = outcome.next_log_written,
            "ingested log batch"
        );
        Ok(outcome)
    }

    fn create_edges(
        &self,
        batch_id: &str,
        edges: &[NewRelationship],
    ) -> Result<usize, StoreError> {
        for edge in edges {
            if edge.kind == RelationshipType::NextLog {
                return Err(StoreError::ConstraintViolation(
                    "next_log edges are derived during log ingestion".to_owned(),
                ));
            }
            validate_relationship(edge)?;
        }

        let created_at = Utc::now().to_rfc3339();
        self.write(|tx| {
            let mut written = 0usize;
            for edge in edges {
                ensure_node(tx, edge.from)?;
                ensure_node(tx, edge.to)?;
                if let Some(order) = edge.call_order {
                    let next = next_call_order(tx, edge.from.id)?;
                    if order != next {
                        return Err(StoreError::ConstraintViolation(format!(
                            "call_order {order} on {} would break the dense sequence, expected {next}",
                            edge.from
                        )));
                    }
                }
                written += insert_relationship(tx, batch_id, edge, &created_at)?;
            }
            Ok(written)
        })
    }

    fn replace_link_edges(
        &self,
        batch_id: &str,
        edges: &[NewRelationship],
    ) -> Result<usize, StoreError> {
        for edge in edges {
            if !edge.kind.is_link() {
                return Err(StoreError::ConstraintViolation(format!(
                    "{} is not a link edge type",
                    edge.kind
                )));
            }
            validate_relationship(edge)?;
        }

        let created_at = Utc::now().to_rfc3339();
        let (removed, written) = self.write(|tx| {
            let removed = tx.execute(
                "DELETE FROM relationships WHERE rel_type IN (?1, ?2, ?3)",
                params![
                    RelationshipType::ExecutedIn.as_str(),
                    RelationshipType::LoggedError.as_str(),
                    RelationshipType::ServiceContext.as_str(),
                ],
            )?;
            let mut written = 0usize;
            for edge in edges {
                ensure_node(tx, edge.from)?;
                ensure_node(tx, edge.to)?;
                written += insert_relationship(tx, batch_id, edge, &created_at)?;
            }
            Ok((removed, written))
        })?;

        debug!(batch_id, removed, written, "replaced link edges");
        Ok(written)
    }

    fn delete_edges(&self, filter: &EdgeFilter) -> Result<usize, StoreError> {
        let mut clauses = Clauses::default();
        clauses.kinds(&filter.kinds);
        if let Some(batch_id) = &filter.batch_id {
            clauses.push("batch_id = ?", [Value::Text(batch_id.clone())]);
        }
        if let Some(node) = filter.node {
            clauses.push(
                "((from_kind = ? AND from_id = ?) OR (to_kind = ? AND to_id = ?))",
                [
                    Value::Text(node.kind.as_str().to_owned()),
                    Value::Integer(node.id),
                    Value::Text(node.kind.as_str().to_owned()),
                    Value::Integer(node.id),
                ],
            );
        }

        let sql = format!("DELETE FROM relationships{}", clauses.where_sql());
        self.write(|tx| Ok(tx.execute(&sql, params_from_iter(clauses.values.iter()))?))
    }

    fn code_node(&self, id: CodeNodeId) -> Result<Option<CodeNode>, StoreError> {
        let conn = self.connection()?;
        let node = conn
            .query_row(
                &format!("SELECT {CODE_NODE_COLUMNS} FROM code_nodes WHERE id = ?1"),
                params![id],
                code_node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    fn code_nodes(&self, filter: &CodeNodeFilter) -> Result<Vec<CodeNode>, StoreError> {
        let mut clauses = Clauses::default();
        if let Some(name) = &filter.name {
            clauses.push("name = ?", [Value::Text(name.trim().to_owned())]);
        }
        if let Some(service) = &filter.service {
            clauses.push("service = ?", [Value::Text(service.trim().to_owned())]);
        }
        if let Some(kind) = filter.kind {
            clauses.push("kind = ?", [Value::Text(kind.as_str().to_owned())]);
        }
        match filter.api_exposed {
            Some(true) => clauses.push("http_method IS NOT NULL", None),
            Some(false) => clauses.push("http_method IS NULL", None),
            None => {}
        }
        if let Some(endpoint) = &filter.endpoint {
            clauses.push(
                "http_method = ? AND http_path = ?",
                [
                    Value::Text(endpoint.method.clone()),
                    Value::Text(endpoint.path.clone()),
                ],
            );
        }

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CODE_NODE_COLUMNS} FROM code_nodes{} ORDER BY service ASC, name ASC, id ASC",
            clauses.where_sql()
        ))?;
        let rows = stmt.query_map(params_from_iter(clauses.values.iter()), code_node_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn log_event(&self, id: LogEventId) -> Result<Option<LogEvent>, StoreError> {
        let conn = self.connection()?;
        let event = conn
            .query_row(
                &format!("SELECT {LOG_EVENT_COLUMNS} FROM log_events WHERE id = ?1"),
                params![id],
                log_event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    fn log_events(&self, filter: &LogEventFilter) -> Result<Vec<LogEvent>, StoreError> {
        let mut clauses = Clauses::default();
        if let Some(trace_id) = &filter.trace_id {
            clauses.push("trace_id = ?", [Value::Text(trace_id.clone())]);
        }
        if let Some(service) = &filter.service {
            clauses.push("service = ?", [Value::Text(service.clone())]);
        }
        if let Some(batch_id) = &filter.batch_id {
            clauses.push("batch_id = ?", [Value::Text(batch_id.clone())]);
        }
        if let Some(min_level) = filter.min_level {
            let levels = SEVERITIES
                .into_iter()
                .filter(|level| *level >= min_level)
                .map(|level| Value::Text(level.as_str().to_owned()))
                .collect::<Vec<_>>();
            clauses.push(
                &format!("level IN ({})", placeholders(levels.len())),
                levels,
            );
        }

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_EVENT_COLUMNS} FROM log_events{} ORDER BY timestamp_us ASC, id ASC",
            clauses.where_sql()
        ))?;
        let rows = stmt.query_map(params_from_iter(clauses.values.iter()), log_event_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn edges(
        &self,
        node: NodeRef,
        direction: Direction,
        kinds: &[RelationshipType],
    ) -> Result<Vec<Relationship>, StoreError> {
        let mut clauses = Clauses::default();
        let anchor = match direction {
            Direction::Outgoing => "from_kind = ? AND from_id = ?",
            Direction::Incoming => "to_kind = ? AND to_id = ?",
        };
        clauses.push(
            anchor,
            [
                Value::Text(node.kind.as_str().to_owned()),
                Value::Integer(node.id),
            ],
        );
        clauses.kinds(kinds);

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationships{} \
             ORDER BY call_order IS NULL, call_order ASC, id ASC",
            clauses.where_sql()
        ))?;
        let rows = stmt.query_map(
            params_from_iter(clauses.values.iter()),
            relationship_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn edges_of_types(&self, kinds: &[RelationshipType]) -> Result<Vec<Relationship>, StoreError> {
        let mut clauses = Clauses::default();
        clauses.kinds(kinds);

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationships{} ORDER BY id ASC",
            clauses.where_sql()
        ))?;
        let rows = stmt.query_map(
            params_from_iter(clauses.values.iter()),
            relationship_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn trace_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT trace_id
            FROM log_events
            GROUP BY trace_id
            ORDER BY MIN(timestamp_us) ASC, trace_id ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.write(|tx| {
            tx.execute_batch(
                r#"
                DELETE FROM workflow_functions;
                DELETE FROM workflow_catalog;
                DELETE FROM relationships;
                DELETE FROM log_events;
                DELETE FROM code_nodes;
                "#,
            )?;
            Ok(())
        })?;
        info!(path = %self.sqlite_path.display(), "cleared graph store");
        Ok(())
    }
}

/// Accumulates `AND`-joined predicates with anonymous `?` parameters.
#[derive(Default)]
struct Clauses {
    predicates: Vec<String>,
    values: Vec<Value>,
}

impl Clauses {
    fn push(&mut self, predicate: &str, values: impl IntoIterator<Item = Value>) {
        self.predicates.push(predicate.to_owned());
        self.values.extend(values);
    }

    fn kinds(&mut self, kinds: &[RelationshipType]) {
        if kinds.is_empty() {
            return;
        }
        self.push(
            &format!("rel_type IN ({})", placeholders(kinds.len())),
            kinds
                .iter()
                .map(|kind| Value::Text(kind.as_str().to_owned())),
        );
    }

    fn where_sql(&self) -> String {
        if self.predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.predicates.join(" AND "))
        }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn validate_relationship(edge: &NewRelationship) -> Result<(), StoreError> {
    edge.kind
        .validate(edge.from.kind, edge.to.kind, edge.call_order)
        .map_err(|err| StoreError::ConstraintViolation(format!("{} -> {}: {err}", edge.from, edge.to)))
}

fn ensure_node(conn: &Connection, node: NodeRef) -> Result<(), StoreError> {
    let sql = match node.kind {
        NodeKind::Code => "SELECT EXISTS(SELECT 1 FROM code_nodes WHERE id = ?1)",
        NodeKind::Log => "SELECT EXISTS(SELECT 1 FROM log_events WHERE id = ?1)",
    };
    let exists = conn.query_row(sql, params![node.id], |row| row.get::<_, bool>(0))?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::NotFound(node.to_string()))
    }
}

fn next_call_order(conn: &Connection, caller: CodeNodeId) -> Result<u32, StoreError> {
    let next = conn.query_row(
        r#"
        SELECT COALESCE(MAX(call_order), 0) + 1
        FROM relationships
        WHERE from_kind = 'code'
          AND from_id = ?1
          AND rel_type IN (?2, ?3, ?4)
        "#,
        params![
            caller,
            RelationshipType::Calls.as_str(),
            RelationshipType::ApiCalls.as_str(),
            RelationshipType::Exposes.as_str(),
        ],
        |row| row.get(0),
    )?;
    Ok(next)
}

fn insert_relationship(
    conn: &Connection,
    batch_id: &str,
    edge: &NewRelationship,
    created_at: &str,
) -> Result<usize, StoreError> {
    let written = conn.execute(
        INSERT_RELATIONSHIP,
        params![
            edge.kind.as_str(),
            edge.from.kind.as_str(),
            edge.from.id,
            edge.to.kind.as_str(),
            edge.to.id,
            edge.call_order,
            edge.line,
            edge.description,
            created_at,
            batch_id,
        ],
    )?;
    Ok(written)
}

fn conversion_error(
    index: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err.into())
}

pub(crate) fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| conversion_error(index, err))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    index: usize,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| conversion_error(index, err))
}

fn code_node_from_row(row: &Row<'_>) -> rusqlite::Result<CodeNode> {
    let kind: String = row.get(3)?;
    let http_method: Option<String> = row.get(5)?;
    let http_path: Option<String> = row.get(6)?;
    let parameters: String = row.get(7)?;
    let attributes: String = row.get(11)?;

    Ok(CodeNode {
        id: row.get(0)?,
        key: row.get(1)?,
        name: row.get(2)?,
        kind: kind
            .parse::<CodeKind>()
            .map_err(|err| conversion_error(3, err))?,
        service: row.get(4)?,
        api: http_method
            .zip(http_path)
            .map(|(method, path)| ApiExposure::new(method, path)),
        parameters: parse_json(7, &parameters)?,
        summary: row.get(8)?,
        snippet: row.get(9)?,
        file_path: row.get(10)?,
        attributes: CodeAttributes::from_json(&attributes)
            .map_err(|err| conversion_error(11, err))?,
        batch_id: row.get(12)?,
    })
}

fn log_event_from_row(row: &Row<'_>) -> rusqlite::Result<LogEvent> {
    let timestamp_us: i64 = row.get(2)?;
    let level: String = row.get(4)?;

    Ok(LogEvent {
        id: row.get(0)?,
        key: row.get(1)?,
        timestamp: DateTime::<Utc>::from_timestamp_micros(timestamp_us)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, timestamp_us))?,
        service: row.get(3)?,
        level: level
            .parse::<Severity>()
            .map_err(|err| conversion_error(4, err))?,
        trace_id: row.get(5)?,
        message: row.get(6)?,
        fields: LogFields {
            error_code: row.get(7)?,
            error_type: row.get(8)?,
            duration_ms: row.get(9)?,
            function: row.get(10)?,
            order_id: row.get(11)?,
            exception: row.get(12)?,
        },
        batch_id: row.get(13)?,
    })
}

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    let kind: String = row.get(1)?;
    let from_kind: String = row.get(2)?;
    let to_kind: String = row.get(4)?;
    let created_at: String = row.get(9)?;

    Ok(Relationship {
        id: row.get(0)?,
        kind: kind
            .parse::<RelationshipType>()
            .map_err(|err| conversion_error(1, err))?,
        from: NodeRef {
            kind: from_kind
                .parse::<NodeKind>()
                .map_err(|err| conversion_error(2, err))?,
            id: row.get(3)?,
        },
        to: NodeRef {
            kind: to_kind
                .parse::<NodeKind>()
                .map_err(|err| conversion_error(4, err))?,
            id: row.get(5)?,
        },
        call_order: row.get(6)?,
        line: row.get(7)?,
        description: row.get(8)?,
        created_at: parse_timestamp(9, &created_at)?,
        batch_id: row.get(10)?,
    })
}
