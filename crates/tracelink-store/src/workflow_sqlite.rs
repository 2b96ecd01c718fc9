use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use tracing::info;

use crate::graph_sqlite::{parse_json, parse_timestamp};
use crate::{
    NewWorkflow, SqliteGraphStore, StoreError, WorkflowMembership, WorkflowRecord,
    WorkflowStepRecord, WorkflowStore,
};

const WORKFLOW_COLUMNS: &str = "c.workflow_id, c.entry_point_name, c.entry_node_id, c.endpoint, \
     c.workflow_type, c.full_route, c.workflow_summary, c.total_steps, c.services_involved, \
     c.graph_fingerprint, c.created_at";

const STEP_COLUMNS: &str = "f.workflow_id, f.step_order, f.function_name, f.node_id, \
     f.service_name, f.depth, f.sort_key, f.function_summary, f.data_contracts";

impl WorkflowStore for SqliteGraphStore {
    fn replace_workflows(&self, workflows: &[NewWorkflow]) -> Result<Vec<i64>, StoreError> {
        let created_at = Utc::now().to_rfc3339();

        let ids = self.write(|tx| {
            tx.execute("DELETE FROM workflow_functions", [])?;
            tx.execute("DELETE FROM workflow_catalog", [])?;

            let mut ids = Vec::with_capacity(workflows.len());
            let mut catalog = tx.prepare(
                r#"
                INSERT INTO workflow_catalog (
                    entry_point_name, entry_node_id, endpoint, workflow_type, full_route,
                    workflow_summary, total_steps, services_involved, graph_fingerprint, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;
            let mut functions = tx.prepare(
                r#"
                INSERT INTO workflow_functions (
                    workflow_id, step_order, function_name, node_id, service_name,
                    depth, sort_key, function_summary, data_contracts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;

            for workflow in workflows {
                let workflow_id = catalog.insert(params![
                    workflow.entry_point,
                    workflow.entry_node_id,
                    workflow.endpoint,
                    workflow.workflow_type,
                    serde_json::to_string(&workflow.route)?,
                    workflow.summary,
                    workflow.steps.len() as i64,
                    serde_json::to_string(&workflow.services)?,
                    workflow.graph_fingerprint,
                    created_at,
                ])?;

                for (index, step) in workflow.steps.iter().enumerate() {
                    functions.execute(params![
                        workflow_id,
                        index as i64 + 1,
                        step.function_name,
                        step.node_id,
                        step.service,
                        step.depth,
                        step.sort_key,
                        step.summary,
                        serde_json::to_string(&step.contract)?,
                    ])?;
                }
                ids.push(workflow_id);
            }

            Ok(ids)
        })?;

        info!(workflows = ids.len(), "replaced workflow catalog");
        Ok(ids)
    }

    fn workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_catalog c \
             ORDER BY c.workflow_type ASC, c.entry_point_name ASC, c.workflow_id ASC"
        ))?;
        let rows = stmt.query_map([], workflow_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn workflow(&self, workflow_id: i64) -> Result<Option<WorkflowRecord>, StoreError> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflow_catalog c WHERE c.workflow_id = ?1"),
                params![workflow_id],
                workflow_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn workflows_by_entry(&self, entry_point: &str) -> Result<Vec<WorkflowRecord>, StoreError> {
        let entry_point = entry_point.trim();
        if entry_point.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_catalog c \
             WHERE c.entry_point_name = ?1 ORDER BY c.workflow_id ASC"
        ))?;
        let rows = stmt.query_map(params![entry_point], workflow_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn workflow_steps(&self, workflow_id: i64) -> Result<Vec<WorkflowStepRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_functions f \
             WHERE f.workflow_id = ?1 ORDER BY f.step_order ASC"
        ))?;
        let rows = stmt.query_map(params![workflow_id], step_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn workflows_containing(
        &self,
        function: &str,
    ) -> Result<Vec<WorkflowMembership>, StoreError> {
        let function = function.trim();
        if function.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}, {STEP_COLUMNS}
            FROM workflow_functions f
            JOIN workflow_catalog c ON c.workflow_id = f.workflow_id
            WHERE f.function_name = ?1
            ORDER BY c.workflow_type ASC, c.entry_point_name ASC, f.step_order ASC
            "#
        ))?;
        let rows = stmt.query_map(params![function], |row| {
            Ok(WorkflowMembership {
                workflow: workflow_from_row(row)?,
                step: step_at(row, 11)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn workflows_involving_service(
        &self,
        service: &str,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let service = service.trim();
        let mut records = self.workflows()?;
        records.retain(|record| record.services.iter().any(|name| name == service));
        records.sort_by(|left, right| {
            right
                .total_steps
                .cmp(&left.total_steps)
                .then_with(|| left.entry_point.cmp(&right.entry_point))
        });
        Ok(records)
    }
}

fn workflow_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRecord> {
    let route: String = row.get(5)?;
    let services: String = row.get(8)?;
    let created_at: String = row.get(10)?;

    Ok(WorkflowRecord {
        workflow_id: row.get(0)?,
        entry_point: row.get(1)?,
        entry_node_id: row.get(2)?,
        endpoint: row.get(3)?,
        workflow_type: row.get(4)?,
        route: parse_json(5, &route)?,
        summary: row.get(6)?,
        total_steps: row.get(7)?,
        services: parse_json(8, &services)?,
        graph_fingerprint: row.get(9)?,
        created_at: parse_timestamp(10, &created_at)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowStepRecord> {
    step_at(row, 0)
}

fn step_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<WorkflowStepRecord> {
    let contract: String = row.get(offset + 8)?;

    Ok(WorkflowStepRecord {
        workflow_id: row.get(offset)?,
        step_order: row.get(offset + 1)?,
        function_name: row.get(offset + 2)?,
        node_id: row.get(offset + 3)?,
        service: row.get(offset + 4)?,
        depth: row.get(offset + 5)?,
        sort_key: row.get(offset + 6)?,
        summary: row.get(offset + 7)?,
        contract: parse_json(offset + 8, &contract)?,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tracelink_config::StorageConfig;
    use tracelink_core::DataContract;

    use super::*;
    use crate::NewWorkflowStep;

    fn step(name: &str, service: &str, depth: u32, sort_key: &str) -> NewWorkflowStep {
        NewWorkflowStep {
            function_name: name.to_owned(),
            node_id: 1,
            service: service.to_owned(),
            depth,
            sort_key: sort_key.to_owned(),
            summary: format!("{name} does work"),
            contract: DataContract {
                parameters: vec!["order".to_owned()],
                return_type: Some("dict".to_owned()),
                fields_accessed: vec!["quantity".to_owned()],
            },
        }
    }

    fn workflow(entry: &str, workflow_type: &str, steps: Vec<NewWorkflowStep>) -> NewWorkflow {
        let mut services = steps
            .iter()
            .map(|step| step.service.clone())
            .collect::<Vec<_>>();
        services.sort();
        services.dedup();
        NewWorkflow {
            entry_point: entry.to_owned(),
            entry_node_id: 1,
            endpoint: Some("POST /orders".to_owned()),
            workflow_type: workflow_type.to_owned(),
            route: steps.iter().map(|step| step.function_name.clone()).collect(),
            summary: format!("{entry} workflow"),
            services,
            graph_fingerprint: "abc".to_owned(),
            steps,
        }
    }

    #[test]
    fn replacing_the_catalog_persists_steps_and_contracts() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open(temp.path(), &StorageConfig::default()).expect("open");

        let ids = store
            .replace_workflows(&[
                workflow(
                    "place_order",
                    "retail",
                    vec![
                        step("place_order", "api_gateway", 0, "0"),
                        step("validate_trade", "trade_service", 1, "1"),
                    ],
                ),
                workflow(
                    "rebalance",
                    "algo",
                    vec![step("rebalance", "algo_service", 0, "0")],
                ),
            ])
            .expect("replace workflows");
        assert_eq!(ids.len(), 2);

        let steps = store.workflow_steps(ids[0]).expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].step_order, 2);
        assert_eq!(steps[1].contract.fields_accessed, vec!["quantity"]);

        let record = store.workflow(ids[0]).expect("lookup").expect("exists");
        assert_eq!(record.total_steps, 2);
        assert_eq!(record.route, vec!["place_order", "validate_trade"]);

        let containing = store
            .workflows_containing("validate_trade")
            .expect("containing");
        assert_eq!(containing.len(), 1);
        assert_eq!(containing[0].workflow.entry_point, "place_order");
        assert_eq!(containing[0].step.depth, 1);

        let involving = store
            .workflows_involving_service("trade_service")
            .expect("involving");
        assert_eq!(involving.len(), 1);

        let listed = store.workflows().expect("list");
        assert_eq!(listed[0].workflow_type, "algo");

        let replaced = store
            .replace_workflows(&[workflow(
                "rebalance",
                "algo",
                vec![step("rebalance", "algo_service", 0, "0")],
            )])
            .expect("replace again");
        assert_eq!(store.workflows().expect("list").len(), 1);
        assert!(store.workflow_steps(ids[0]).expect("steps").is_empty());
        assert_eq!(
            store.workflows_by_entry("rebalance").expect("by entry")[0].workflow_id,
            replaced[0]
        );
    }
}
