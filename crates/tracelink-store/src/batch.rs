use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracelink_core::{NodeKind, RelationshipType};

use crate::{CodeBatch, CodeEdgeRecord, LogBatch, NextLogRecord, StoreError};

type EdgeIdentity<'a> = (&'a str, &'a str, RelationshipType);

/// Edges of a code batch after duplicate `(from, to, type)` triples collapse.
pub(crate) struct CheckedCodeEdges<'a> {
    pub edges: Vec<&'a CodeEdgeRecord>,
    pub duplicates: usize,
}

impl CodeBatch {
    /// Collapses duplicate edges and numbers the outgoing call edges of every
    /// caller 1..=k, keeping any order already given, then source line, then
    /// declaration order.
    pub fn assign_call_orders(&mut self) {
        let mut seen = HashSet::new();
        self.edges.retain(|edge| {
            seen.insert((edge.from_key.clone(), edge.to_key.clone(), edge.kind))
        });

        let mut by_caller = BTreeMap::<String, Vec<usize>>::new();
        for (index, edge) in self.edges.iter().enumerate() {
            if edge.kind.is_call() {
                by_caller.entry(edge.from_key.clone()).or_default().push(index);
            }
        }

        for indices in by_caller.into_values() {
            let mut ranked = indices
                .into_iter()
                .map(|index| {
                    let edge = &self.edges[index];
                    (
                        edge.call_order.unwrap_or(u32::MAX),
                        edge.line.unwrap_or(u32::MAX),
                        index,
                    )
                })
                .collect::<Vec<_>>();
            ranked.sort_unstable();
            for (position, (_, _, index)) in ranked.into_iter().enumerate() {
                self.edges[index].call_order = Some(position as u32 + 1);
            }
        }
    }

    pub(crate) fn check(&self) -> Result<CheckedCodeEdges<'_>, StoreError> {
        if self.batch_id.trim().is_empty() {
            return Err(violation("code batch is missing a batch_id"));
        }

        let mut keys = HashSet::new();
        for node in &self.nodes {
            if node.key.trim().is_empty() {
                return Err(violation(format!("code node '{}' has an empty key", node.name)));
            }
            if node.name.trim().is_empty() || node.service.trim().is_empty() {
                return Err(violation(format!(
                    "code node '{}' needs a name and a service",
                    node.key
                )));
            }
            if !keys.insert(node.key.as_str()) {
                return Err(violation(format!("duplicate code node key '{}'", node.key)));
            }
        }

        let mut seen = HashSet::<EdgeIdentity<'_>>::new();
        let mut edges = Vec::with_capacity(self.edges.len());
        let mut duplicates = 0usize;
        for edge in &self.edges {
            for key in [&edge.from_key, &edge.to_key] {
                if !keys.contains(key.as_str()) {
                    return Err(violation(format!(
                        "{} edge references unknown code node '{key}'",
                        edge.kind
                    )));
                }
            }
            edge.kind
                .validate(NodeKind::Code, NodeKind::Code, edge.call_order)
                .map_err(|err| {
                    violation(format!("{} -> {}: {err}", edge.from_key, edge.to_key))
                })?;

            if seen.insert((edge.from_key.as_str(), edge.to_key.as_str(), edge.kind)) {
                edges.push(edge);
            } else {
                duplicates += 1;
            }
        }

        let mut orders = BTreeMap::<&str, Vec<u32>>::new();
        for edge in &edges {
            if let Some(order) = edge.call_order {
                orders.entry(edge.from_key.as_str()).or_default().push(order);
            }
        }
        for (caller, mut caller_orders) in orders {
            caller_orders.sort_unstable();
            let dense = caller_orders
                .iter()
                .enumerate()
                .all(|(position, order)| *order == position as u32 + 1);
            if !dense {
                return Err(violation(format!(
                    "call_order values of '{caller}' must be unique and dense from 1, found {caller_orders:?}"
                )));
            }
        }

        Ok(CheckedCodeEdges { edges, duplicates })
    }
}

impl LogBatch {
    /// Chronological `next_log` pairs for every trace in the batch. Equal
    /// timestamps keep batch order.
    pub fn temporal_chain(&self) -> Vec<NextLogRecord> {
        let mut traces = BTreeMap::<&str, Vec<usize>>::new();
        for (index, event) in self.events.iter().enumerate() {
            traces.entry(event.trace_id.as_str()).or_default().push(index);
        }

        let mut chain = Vec::new();
        for mut indices in traces.into_values() {
            indices.sort_by_key(|index| (self.events[*index].timestamp, *index));
            chain.extend(indices.windows(2).map(|pair| NextLogRecord {
                from_key: self.events[pair[0]].key.clone(),
                to_key: self.events[pair[1]].key.clone(),
            }));
        }
        chain
    }

    pub fn trace_ids(&self) -> BTreeSet<&str> {
        self.events.iter().map(|event| event.trace_id.as_str()).collect()
    }

    /// Validates the batch and returns the `next_log` edges to write.
    pub(crate) fn check(&self) -> Result<Vec<NextLogRecord>, StoreError> {
        if self.batch_id.trim().is_empty() {
            return Err(violation("log batch is missing a batch_id"));
        }

        let mut keys = HashMap::new();
        for event in &self.events {
            if event.key.trim().is_empty() {
                return Err(violation("log event has an empty key"));
            }
            if event.trace_id.trim().is_empty() || event.service.trim().is_empty() {
                return Err(violation(format!(
                    "log event '{}' needs a trace_id and a service",
                    event.key
                )));
            }
            if keys.insert(event.key.as_str(), event.trace_id.as_str()).is_some() {
                return Err(violation(format!("duplicate log event key '{}'", event.key)));
            }
        }

        let derived = self.temporal_chain();
        if self.next_log.is_empty() {
            return Ok(derived);
        }

        for edge in &self.next_log {
            match (keys.get(edge.from_key.as_str()), keys.get(edge.to_key.as_str())) {
                (Some(from), Some(to)) if from == to => {}
                (Some(_), Some(_)) => {
                    return Err(violation(format!(
                        "next_log {} -> {} crosses traces",
                        edge.from_key, edge.to_key
                    )));
                }
                _ => {
                    return Err(violation(format!(
                        "next_log {} -> {} references an event outside the batch",
                        edge.from_key, edge.to_key
                    )));
                }
            }
        }

        let supplied = self.next_log.iter().collect::<BTreeSet<_>>();
        let expected = derived.iter().collect::<BTreeSet<_>>();
        if supplied != expected || supplied.len() != self.next_log.len() {
            return Err(violation(
                "supplied next_log edges do not form the chronological chain of each trace",
            ));
        }

        Ok(derived)
    }
}

fn violation(message: impl Into<String>) -> StoreError {
    StoreError::ConstraintViolation(message.into())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tracelink_core::{CodeAttributes, CodeKind, LogFields, Severity};

    use super::*;
    use crate::{CodeNodeRecord, LogEventRecord};

    fn node(key: &str) -> CodeNodeRecord {
        CodeNodeRecord {
            key: key.to_owned(),
            name: key.to_owned(),
            kind: CodeKind::Function,
            service: "trade_service".to_owned(),
            api: None,
            parameters: Vec::new(),
            summary: String::new(),
            snippet: String::new(),
            file_path: "trade.py".to_owned(),
            attributes: CodeAttributes::default(),
        }
    }

    fn call(from: &str, to: &str, call_order: Option<u32>, line: Option<u32>) -> CodeEdgeRecord {
        CodeEdgeRecord {
            from_key: from.to_owned(),
            to_key: to.to_owned(),
            kind: RelationshipType::Calls,
            call_order,
            line,
            description: String::new(),
        }
    }

    fn event(key: &str, trace: &str, second: u32) -> LogEventRecord {
        LogEventRecord {
            key: key.to_owned(),
            timestamp: Utc
                .with_ymd_and_hms(2024, 1, 15, 10, 30, second)
                .single()
                .expect("valid timestamp"),
            service: "trade_service".to_owned(),
            level: Severity::Info,
            trace_id: trace.to_owned(),
            message: format!("event {key}"),
            fields: LogFields::default(),
        }
    }

    #[test]
    fn assign_call_orders_uses_lines_and_collapses_duplicates() {
        let mut batch = CodeBatch {
            batch_id: "b1".to_owned(),
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![
                call("a", "c", None, Some(20)),
                call("a", "b", None, Some(10)),
                call("a", "b", None, Some(30)),
            ],
        };
        batch.assign_call_orders();

        assert_eq!(batch.edges.len(), 2);
        assert_eq!(batch.edges[0].to_key, "c");
        assert_eq!(batch.edges[0].call_order, Some(2));
        assert_eq!(batch.edges[1].to_key, "b");
        assert_eq!(batch.edges[1].call_order, Some(1));
        assert!(batch.check().is_ok());
    }

    #[test]
    fn sparse_or_repeated_call_orders_are_rejected() {
        let gap = CodeBatch {
            batch_id: "b1".to_owned(),
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![call("a", "b", Some(1), None), call("a", "c", Some(3), None)],
        };
        assert!(matches!(gap.check(), Err(StoreError::ConstraintViolation(_))));

        let repeated = CodeBatch {
            edges: vec![call("a", "b", Some(1), None), call("a", "c", Some(1), None)],
            ..gap
        };
        assert!(matches!(
            repeated.check(),
            Err(StoreError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn callers_past_the_call_order_limit_are_rejected() {
        let callees = (1..=1000).map(|index| format!("f{index}")).collect::<Vec<_>>();
        let mut nodes = vec![node("root")];
        nodes.extend(callees.iter().map(|key| node(key)));
        let mut batch = CodeBatch {
            batch_id: "b1".to_owned(),
            nodes,
            edges: callees
                .iter()
                .enumerate()
                .map(|(index, key)| call("root", key, None, Some(index as u32 + 1)))
                .collect(),
        };
        batch.assign_call_orders();
        assert_eq!(batch.edges.last().and_then(|edge| edge.call_order), Some(1000));

        assert!(matches!(
            batch.check(),
            Err(StoreError::ConstraintViolation(message)) if message.contains("exceeds the limit")
        ));

        batch.edges.pop();
        batch.nodes.pop();
        assert!(batch.check().is_ok());
    }

    #[test]
    fn edges_to_unknown_keys_and_bad_kinds_are_rejected() {
        let dangling = CodeBatch {
            batch_id: "b1".to_owned(),
            nodes: vec![node("a")],
            edges: vec![call("a", "ghost", None, None)],
        };
        assert!(matches!(
            dangling.check(),
            Err(StoreError::ConstraintViolation(message)) if message.contains("ghost")
        ));

        let mut contains = call("a", "a", Some(1), None);
        contains.kind = RelationshipType::Contains;
        let ordered_contains = CodeBatch {
            batch_id: "b1".to_owned(),
            nodes: vec![node("a")],
            edges: vec![contains],
        };
        assert!(ordered_contains.check().is_err());
    }

    #[test]
    fn temporal_chain_sorts_each_trace_and_keeps_batch_order_on_ties() {
        let batch = LogBatch {
            batch_id: "logs-1".to_owned(),
            events: vec![
                event("t1-late", "t1", 5),
                event("t2-only", "t2", 1),
                event("t1-early", "t1", 1),
                event("t1-tie", "t1", 5),
            ],
            next_log: Vec::new(),
        };

        let chain = batch.check().expect("valid batch");
        let pairs = chain
            .iter()
            .map(|edge| (edge.from_key.as_str(), edge.to_key.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec![("t1-early", "t1-late"), ("t1-late", "t1-tie")]);
    }

    #[test]
    fn supplied_chain_must_match_chronology() {
        let mut batch = LogBatch {
            batch_id: "logs-1".to_owned(),
            events: vec![event("e1", "t1", 1), event("e2", "t1", 2), event("e3", "t1", 3)],
            next_log: vec![
                NextLogRecord {
                    from_key: "e1".to_owned(),
                    to_key: "e2".to_owned(),
                },
                NextLogRecord {
                    from_key: "e2".to_owned(),
                    to_key: "e3".to_owned(),
                },
            ],
        };
        assert_eq!(batch.check().expect("valid chain").len(), 2);

        batch.next_log[1] = NextLogRecord {
            from_key: "e1".to_owned(),
            to_key: "e3".to_owned(),
        };
        assert!(matches!(batch.check(), Err(StoreError::ConstraintViolation(_))));
    }
}
