use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod contract;

pub use contract::{DataContract, extract_data_contract};

pub type CodeNodeId = i64;
pub type LogEventId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("invalid code kind '{0}', expected one of: function, class, method, module")]
    InvalidCodeKind(String),
    #[error("invalid severity '{0}', expected one of: DEBUG, INFO, WARNING, ERROR, CRITICAL")]
    InvalidSeverity(String),
    #[error("invalid relationship type '{0}'")]
    InvalidRelationshipType(String),
    #[error("{kind} cannot connect {from} -> {to}")]
    EndpointMismatch {
        kind: RelationshipType,
        from: NodeKind,
        to: NodeKind,
    },
    #[error("call_order is only valid on CALLS, API_CALLS and EXPOSES edges, found on {0}")]
    UnexpectedCallOrder(RelationshipType),
    #[error("call_order is 1-based, found 0")]
    ZeroCallOrder,
    #[error("call_order {0} exceeds the limit of {MAX_CALL_ORDER} calls per caller")]
    CallOrderTooLarge(u32),
    #[error("unrecognized attribute key '{0}'")]
    UnrecognizedAttribute(String),
    #[error("invalid attribute payload: {0}")]
    InvalidAttributes(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Code,
    Log,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "code" => Ok(Self::Code),
            "log" => Ok(Self::Log),
            other => Err(format!("invalid node kind '{other}', expected code or log")),
        }
    }
}

/// Typed reference to either node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub id: i64,
}

impl NodeRef {
    pub fn code(id: CodeNodeId) -> Self {
        Self {
            kind: NodeKind::Code,
            id,
        }
    }

    pub fn log(id: LogEventId) -> Self {
        Self {
            kind: NodeKind::Log,
            id,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Function,
    Class,
    Method,
    Module,
}

impl CodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::Module => "module",
        }
    }

    /// Functions and methods run and can therefore emit log lines.
    pub fn is_executable(self) -> bool {
        matches!(self, Self::Function | Self::Method)
    }
}

impl std::str::FromStr for CodeKind {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "method" => Ok(Self::Method),
            "module" => Ok(Self::Module),
            other => Err(ModelError::InvalidCodeKind(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiExposure {
    pub method: String,
    pub path: String,
}

impl ApiExposure {
    pub fn new(method: impl AsRef<str>, path: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().trim().to_ascii_uppercase(),
            path: path.into(),
        }
    }

    /// Parses `"POST /orders"`.
    pub fn parse(endpoint: &str) -> Option<Self> {
        let (method, path) = endpoint.trim().split_once(char::is_whitespace)?;
        let path = path.trim();
        if method.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self::new(method, path))
    }

    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Recognized keys of the code node attribute mapping.
pub const RECOGNIZED_ATTRIBUTE_KEYS: &[&str] =
    &["return_type", "fields_accessed", "start_line", "enrichment"];

/// Typed metadata carried by a code node. Enrichment values (LLM summaries,
/// embedding references) are opaque strings produced outside this workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_accessed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enrichment: BTreeMap<String, String>,
}

impl CodeAttributes {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let value: Value =
            serde_json::from_str(raw).map_err(|err| ModelError::InvalidAttributes(err.to_string()))?;
        let Value::Object(map) = &value else {
            return Err(ModelError::InvalidAttributes(
                "expected a JSON object".to_owned(),
            ));
        };
        if let Some(key) = map
            .keys()
            .find(|key| !RECOGNIZED_ATTRIBUTE_KEYS.contains(&key.as_str()))
        {
            return Err(ModelError::UnrecognizedAttribute(key.clone()));
        }

        serde_json::from_value(value).map_err(|err| ModelError::InvalidAttributes(err.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        serde_json::to_string(self).map_err(|err| ModelError::InvalidAttributes(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeNode {
    pub id: CodeNodeId,
    pub key: String,
    pub name: String,
    pub kind: CodeKind,
    pub service: String,
    pub api: Option<ApiExposure>,
    pub parameters: Vec<String>,
    pub summary: String,
    pub snippet: String,
    pub file_path: String,
    pub attributes: CodeAttributes,
    pub batch_id: String,
}

impl CodeNode {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef::code(self.id)
    }

    pub fn is_api_exposed(&self) -> bool {
        self.api.is_some()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.api.as_ref().map(ApiExposure::endpoint)
    }

    /// `service:name`, the form used in ambiguity reports.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.service, self.name)
    }

    /// Final segment of a dotted `Class.method` name.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

impl std::str::FromStr for Severity {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" | "FATAL" => Ok(Self::Critical),
            _ => Err(ModelError::InvalidSeverity(value.trim().to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Originating function reported by the emitting service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// A runtime log line. `id` is assigned in insertion order and breaks
/// timestamp ties inside a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: LogEventId,
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub level: Severity,
    pub trace_id: String,
    pub message: String,
    pub fields: LogFields,
    pub batch_id: String,
}

impl LogEvent {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef::log(self.id)
    }

    pub fn error_code(&self) -> Option<&str> {
        self.fields
            .error_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }

    pub fn has_error_signal(&self) -> bool {
        self.level.is_error() || self.error_code().is_some()
    }

    /// Total order inside a trace: timestamp, then insertion order.
    pub fn chronological_key(&self) -> (DateTime<Utc>, LogEventId) {
        (self.timestamp, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationshipType {
    #[serde(rename = "CALLS")]
    Calls,
    #[serde(rename = "CONTAINS")]
    Contains,
    #[serde(rename = "API_CALLS")]
    ApiCalls,
    #[serde(rename = "EXPOSES")]
    Exposes,
    #[serde(rename = "next_log")]
    NextLog,
    #[serde(rename = "executed_in")]
    ExecutedIn,
    #[serde(rename = "logged_error")]
    LoggedError,
    #[serde(rename = "service_context")]
    ServiceContext,
}

/// Largest call_order a caller may use. Sort keys pad each segment to three
/// digits, so larger values would break segment-wise string ordering.
pub const MAX_CALL_ORDER: u32 = 999;

impl RelationshipType {
    pub const ALL: [Self; 8] = [
        Self::Calls,
        Self::Contains,
        Self::ApiCalls,
        Self::Exposes,
        Self::NextLog,
        Self::ExecutedIn,
        Self::LoggedError,
        Self::ServiceContext,
    ];

    /// Edge types followed by call-path traversal.
    pub const CALL_TYPES: [Self; 3] = [Self::Calls, Self::ApiCalls, Self::Exposes];

    /// Edge types produced by the linker.
    pub const LINK_TYPES: [Self; 3] = [Self::ExecutedIn, Self::LoggedError, Self::ServiceContext];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calls => "CALLS",
            Self::Contains => "CONTAINS",
            Self::ApiCalls => "API_CALLS",
            Self::Exposes => "EXPOSES",
            Self::NextLog => "next_log",
            Self::ExecutedIn => "executed_in",
            Self::LoggedError => "logged_error",
            Self::ServiceContext => "service_context",
        }
    }

    pub fn endpoints(self) -> (NodeKind, NodeKind) {
        match self {
            Self::Calls | Self::Contains | Self::ApiCalls | Self::Exposes => {
                (NodeKind::Code, NodeKind::Code)
            }
            Self::NextLog => (NodeKind::Log, NodeKind::Log),
            Self::ExecutedIn | Self::LoggedError | Self::ServiceContext => {
                (NodeKind::Code, NodeKind::Log)
            }
        }
    }

    pub fn is_call(self) -> bool {
        Self::CALL_TYPES.contains(&self)
    }

    pub fn is_link(self) -> bool {
        Self::LINK_TYPES.contains(&self)
    }

    pub fn validate(
        self,
        from: NodeKind,
        to: NodeKind,
        call_order: Option<u32>,
    ) -> Result<(), ModelError> {
        if self.endpoints() != (from, to) {
            return Err(ModelError::EndpointMismatch {
                kind: self,
                from,
                to,
            });
        }
        match call_order {
            Some(_) if !self.is_call() => Err(ModelError::UnexpectedCallOrder(self)),
            Some(0) => Err(ModelError::ZeroCallOrder),
            Some(order) if order > MAX_CALL_ORDER => Err(ModelError::CallOrderTooLarge(order)),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ModelError::InvalidRelationshipType(value.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: i64,
    pub kind: RelationshipType,
    pub from: NodeRef,
    pub to: NodeRef,
    pub call_order: Option<u32>,
    pub line: Option<u32>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub batch_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Hash of the code structure that call-path traversal depends on: code
/// nodes plus call edges. Link and log edges do not contribute.
pub fn graph_fingerprint(nodes: &[CodeNode], edges: &[Relationship]) -> String {
    let mut lines = nodes
        .iter()
        .map(|node| {
            format!(
                "n|{}|{}|{}|{}|{}",
                node.id,
                node.key,
                node.name,
                node.service,
                node.endpoint().unwrap_or_default()
            )
        })
        .chain(edges.iter().filter(|edge| edge.kind.is_call()).map(|edge| {
            format!(
                "e|{}|{}|{}|{}",
                edge.from,
                edge.to,
                edge.kind,
                edge.call_order.map(|order| order.to_string()).unwrap_or_default()
            )
        }))
        .collect::<Vec<_>>();
    lines.sort();

    blake3::hash(lines.join("\n").as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, name: &str) -> CodeNode {
        CodeNode {
            id,
            key: format!("svc::{name}"),
            name: name.to_owned(),
            kind: CodeKind::Function,
            service: "svc".to_owned(),
            api: None,
            parameters: Vec::new(),
            summary: String::new(),
            snippet: String::new(),
            file_path: "src/app.py".to_owned(),
            attributes: CodeAttributes::default(),
            batch_id: "b1".to_owned(),
        }
    }

    fn edge(kind: RelationshipType, from: NodeRef, to: NodeRef, call_order: Option<u32>) -> Relationship {
        Relationship {
            id: 1,
            kind,
            from,
            to,
            call_order,
            line: None,
            description: String::new(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            batch_id: "b1".to_owned(),
        }
    }

    #[test]
    fn relationship_validation_enforces_endpoint_kinds() {
        assert!(
            RelationshipType::Calls
                .validate(NodeKind::Code, NodeKind::Code, Some(1))
                .is_ok()
        );
        assert!(
            RelationshipType::NextLog
                .validate(NodeKind::Log, NodeKind::Log, None)
                .is_ok()
        );
        assert_eq!(
            RelationshipType::ExecutedIn.validate(NodeKind::Log, NodeKind::Code, None),
            Err(ModelError::EndpointMismatch {
                kind: RelationshipType::ExecutedIn,
                from: NodeKind::Log,
                to: NodeKind::Code,
            })
        );
        assert_eq!(
            RelationshipType::Contains.validate(NodeKind::Code, NodeKind::Code, Some(2)),
            Err(ModelError::UnexpectedCallOrder(RelationshipType::Contains))
        );
        assert_eq!(
            RelationshipType::ApiCalls.validate(NodeKind::Code, NodeKind::Code, Some(0)),
            Err(ModelError::ZeroCallOrder)
        );
        assert!(
            RelationshipType::Calls
                .validate(NodeKind::Code, NodeKind::Code, Some(MAX_CALL_ORDER))
                .is_ok()
        );
        assert_eq!(
            RelationshipType::Calls.validate(NodeKind::Code, NodeKind::Code, Some(1000)),
            Err(ModelError::CallOrderTooLarge(1000))
        );
    }

    #[test]
    fn relationship_type_names_round_trip_through_from_str() {
        for kind in RelationshipType::ALL {
            assert_eq!(kind.as_str().parse::<RelationshipType>(), Ok(kind));
        }
        assert!("calls".parse::<RelationshipType>().is_err());
    }

    #[test]
    fn severity_parsing_accepts_aliases() {
        assert_eq!("warn".parse::<Severity>(), Ok(Severity::Warning));
        assert_eq!("Fatal".parse::<Severity>(), Ok(Severity::Critical));
        assert!("ERROR".parse::<Severity>().is_ok_and(Severity::is_error));
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn api_exposure_normalizes_method_and_parses_endpoints() {
        let api = ApiExposure::parse("post   /orders").expect("parse endpoint");
        assert_eq!(api.method, "POST");
        assert_eq!(api.endpoint(), "POST /orders");
        assert!(ApiExposure::parse("GET").is_none());
    }

    #[test]
    fn attributes_reject_unrecognized_keys_on_read() {
        let parsed = CodeAttributes::from_json(
            r#"{"return_type":"dict","enrichment":{"llm_summary":"validates trades"}}"#,
        )
        .expect("parse attributes");
        assert_eq!(parsed.return_type.as_deref(), Some("dict"));
        assert_eq!(
            parsed.enrichment.get("llm_summary").map(String::as_str),
            Some("validates trades")
        );

        assert_eq!(
            CodeAttributes::from_json(r#"{"colour":"blue"}"#),
            Err(ModelError::UnrecognizedAttribute("colour".to_owned()))
        );
        assert!(CodeAttributes::from_json("[1,2]").is_err());
        assert_eq!(CodeAttributes::from_json("  "), Ok(CodeAttributes::default()));
    }

    #[test]
    fn short_name_uses_last_dotted_segment() {
        assert_eq!(node(1, "TradeValidator.validate").short_name(), "validate");
        assert_eq!(node(2, "place_order").short_name(), "place_order");
    }

    #[test]
    fn fingerprint_ignores_link_edges_but_tracks_call_order() {
        let nodes = vec![node(1, "a"), node(2, "b")];
        let calls = edge(RelationshipType::Calls, NodeRef::code(1), NodeRef::code(2), Some(1));
        let link = edge(RelationshipType::ExecutedIn, NodeRef::code(1), NodeRef::log(9), None);

        let base = graph_fingerprint(&nodes, std::slice::from_ref(&calls));
        let with_link = graph_fingerprint(&nodes, &[calls.clone(), link]);
        assert_eq!(base, with_link);

        let reordered = edge(RelationshipType::Calls, NodeRef::code(1), NodeRef::code(2), Some(2));
        assert_ne!(base, graph_fingerprint(&nodes, &[reordered]));
    }
}
