use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::CodeNode;

const MAX_FIELDS_ACCESSED: usize = 10;

/// Per-step data lineage facts persisted alongside materialized workflows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataContract {
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default)]
    pub fields_accessed: Vec<String>,
}

fn re_field_get() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\.get\(\s*['"](\w+)['"]"#).expect("field access regex is valid")
    })
}

/// Builds the data contract of a code node. Ingestor-supplied parameters and
/// attributes win; anything missing is recovered from the snippet.
pub fn extract_data_contract(node: &CodeNode) -> DataContract {
    let signature = parse_signature(node.short_name(), &node.snippet);

    let parameters = if node.parameters.is_empty() {
        signature
            .as_ref()
            .map(|(params, _)| params.clone())
            .unwrap_or_default()
    } else {
        node.parameters
            .iter()
            .map(|param| param.trim())
            .filter(|param| !param.is_empty() && !is_receiver(param))
            .map(str::to_owned)
            .collect()
    };

    let return_type = node
        .attributes
        .return_type
        .clone()
        .or_else(|| signature.and_then(|(_, returns)| returns));

    let fields_accessed = if node.attributes.fields_accessed.is_empty() {
        re_field_get()
            .captures_iter(&node.snippet)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_owned()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .take(MAX_FIELDS_ACCESSED)
            .collect()
    } else {
        node.attributes.fields_accessed.clone()
    };

    DataContract {
        parameters,
        return_type,
        fields_accessed,
    }
}

fn is_receiver(param: &str) -> bool {
    matches!(param, "self" | "cls")
}

/// Finds `def name(...) -> T:` in a snippet and returns the parameter list and
/// optional return annotation.
fn parse_signature(name: &str, snippet: &str) -> Option<(Vec<String>, Option<String>)> {
    let marker = format!("def {name}");
    let start = snippet.find(&marker)? + marker.len();
    let rest = snippet[start..].trim_start();
    let rest = rest.strip_prefix('(')?;

    let mut depth = 0usize;
    let mut current = String::new();
    let mut params = Vec::new();
    let mut close = None;
    for (index, ch) in rest.char_indices() {
        match ch {
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' if depth == 0 => {
                close = Some(index);
                break;
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => params.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    let close = close?;
    params.push(current);

    let params = params
        .into_iter()
        .map(|param| param.trim().to_owned())
        .filter(|param| !param.is_empty() && !is_receiver(param))
        .collect();

    let after = rest[close + 1..].trim_start();
    let returns = after.strip_prefix("->").and_then(|tail| {
        let annotation = tail.split(':').next().unwrap_or_default().trim();
        (!annotation.is_empty()).then(|| annotation.to_owned())
    });

    Some((params, returns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodeAttributes, CodeKind};

    fn node(name: &str, snippet: &str) -> CodeNode {
        CodeNode {
            id: 1,
            key: name.to_owned(),
            name: name.to_owned(),
            kind: CodeKind::Function,
            service: "trade_service".to_owned(),
            api: None,
            parameters: Vec::new(),
            summary: String::new(),
            snippet: snippet.to_owned(),
            file_path: "src/trade.py".to_owned(),
            attributes: CodeAttributes::default(),
            batch_id: "b1".to_owned(),
        }
    }

    #[test]
    fn signature_parsing_handles_annotations_and_defaults() {
        let snippet = r#"def validate_trade(self, order: Dict[str, Any], limit: int = 5) -> bool:
    qty = order.get('quantity')
    sym = order.get("symbol")
    again = order.get('quantity')
    return qty > 0
"#;
        let contract = extract_data_contract(&node("validate_trade", snippet));
        assert_eq!(
            contract.parameters,
            vec!["order: Dict[str, Any]", "limit: int = 5"]
        );
        assert_eq!(contract.return_type.as_deref(), Some("bool"));
        assert_eq!(contract.fields_accessed, vec!["quantity", "symbol"]);
    }

    #[test]
    fn declared_parameters_and_attributes_take_precedence() {
        let mut method = node("Validator.check", "def check(self, x):\n    return x\n");
        method.parameters = vec!["self".to_owned(), "amount".to_owned()];
        method.attributes.return_type = Some("None".to_owned());
        method.attributes.fields_accessed = vec!["balance".to_owned()];

        let contract = extract_data_contract(&method);
        assert_eq!(contract.parameters, vec!["amount"]);
        assert_eq!(contract.return_type.as_deref(), Some("None"));
        assert_eq!(contract.fields_accessed, vec!["balance"]);
    }

    #[test]
    fn missing_signature_yields_empty_contract() {
        let contract = extract_data_contract(&node("ghost", "class Ghost: pass"));
        assert_eq!(contract, DataContract::default());
    }
}
