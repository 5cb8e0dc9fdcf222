//! Index-value extraction from record payloads.
//!
//! Rules carry path expressions over the JSON payload: dotted segments with
//! implicit array flattening, `|`-separated union alternatives, and an
//! optional leading resource-type segment. Leaf values are converted into
//! the rule's typed family, navigating the common complex shapes (codeable
//! concepts, identifiers, references, quantities) the same way the write
//! path always has.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::ExtractError;
use crate::types::{dedup_entries, IndexEntry, IndexValue, ParamKind};

use super::params::{SearchParameterDefinition, SearchParameterRegistry};

/// Extracts typed index entries for a set of rules.
///
/// Returns entries for every rule that applies to `resource_type`, with
/// duplicates collapsed. Rules whose expression matches nothing contribute
/// no entries; that is not an error.
pub fn extract_values(
    params: &[Arc<SearchParameterDefinition>],
    resource_type: &str,
    payload: &Value,
) -> Result<Vec<IndexEntry>, ExtractError> {
    if !payload.is_object() {
        return Err(ExtractError::InvalidPayload {
            message: "payload must be a JSON object".to_string(),
        });
    }

    let mut entries = Vec::new();
    for param in params {
        if !param.applies_to(resource_type) {
            continue;
        }
        for alternative in param.expression.split('|') {
            let path = strip_type_prefix(alternative.trim(), resource_type);
            if path.is_empty() {
                return Err(ExtractError::UnsupportedExpression {
                    expression: param.expression.clone(),
                });
            }
            let mut leaves = Vec::new();
            walk_path(payload, path, &mut leaves);
            for leaf in leaves {
                convert_leaf(param, leaf, &mut entries);
            }
        }
    }
    Ok(dedup_entries(entries))
}

/// Drops a leading `Type.` or `Resource.` segment from an expression.
fn strip_type_prefix<'a>(expression: &'a str, resource_type: &str) -> &'a str {
    for prefix in [resource_type, "Resource"] {
        if let Some(rest) = expression.strip_prefix(prefix) {
            if let Some(rest) = rest.strip_prefix('.') {
                return rest;
            }
            if rest.is_empty() {
                return rest;
            }
        }
    }
    expression
}

/// Collects every leaf reachable through the dotted path, flattening arrays
/// at each step.
fn walk_path<'a>(value: &'a Value, path: &str, out: &mut Vec<&'a Value>) {
    let (segment, rest) = match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    };

    let step = match value {
        Value::Array(items) => {
            for item in items {
                walk_path(item, path, out);
            }
            return;
        }
        Value::Object(map) => map.get(segment),
        _ => None,
    };

    let Some(next) = step else {
        return;
    };

    match rest {
        Some(tail) => walk_path(next, tail, out),
        None => match next {
            Value::Array(items) => out.extend(items.iter()),
            other => out.push(other),
        },
    }
}

/// Converts one leaf value into zero or more typed entries for a rule.
fn convert_leaf(param: &SearchParameterDefinition, leaf: &Value, out: &mut Vec<IndexEntry>) {
    match param.kind {
        ParamKind::String => {
            if let Some(s) = leaf.as_str() {
                out.push(entry(param, IndexValue::string(s)));
            }
        }
        ParamKind::Token => convert_token(param, leaf, out),
        ParamKind::Reference => {
            let reference = leaf
                .as_str()
                .map(str::to_string)
                .or_else(|| {
                    leaf.get("reference")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            if let Some(reference) = reference {
                out.push(entry(param, IndexValue::reference(reference)));
            }
        }
        ParamKind::Quantity => {
            if let Some(value) = leaf.get("value").and_then(Value::as_f64) {
                out.push(entry(
                    param,
                    IndexValue::Quantity {
                        value,
                        system: leaf
                            .get("system")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        code: leaf.get("code").and_then(Value::as_str).map(str::to_string),
                    },
                ));
            } else if let Some(value) = leaf.as_f64() {
                out.push(entry(
                    param,
                    IndexValue::Quantity {
                        value,
                        system: None,
                        code: None,
                    },
                ));
            }
        }
        ParamKind::Date => {
            if let Some(s) = leaf.as_str() {
                out.push(entry(param, IndexValue::date(normalize_date(s))));
            }
        }
        ParamKind::Number => {
            if let Some(value) = leaf.as_f64() {
                out.push(entry(param, IndexValue::Number { value }));
            }
        }
        ParamKind::Uri => {
            if let Some(s) = leaf.as_str() {
                out.push(entry(param, IndexValue::uri(s)));
            }
        }
        // Composite rules are materialized from their component rules by the
        // registry configuration; a bare composite expression yields nothing.
        ParamKind::Composite => {}
    }
}

/// Token conversion handles bare codes, Coding objects, CodeableConcepts,
/// and Identifiers.
fn convert_token(param: &SearchParameterDefinition, leaf: &Value, out: &mut Vec<IndexEntry>) {
    match leaf {
        Value::String(code) => out.push(entry(param, IndexValue::token(None, code.clone()))),
        Value::Bool(b) => out.push(entry(param, IndexValue::token(None, b.to_string()))),
        Value::Object(map) => {
            if let Some(codings) = map.get("coding").and_then(Value::as_array) {
                for coding in codings {
                    push_coding(param, coding, out);
                }
            } else if map.contains_key("code") || map.contains_key("value") {
                push_coding(param, leaf, out);
            }
        }
        _ => {}
    }
}

fn push_coding(param: &SearchParameterDefinition, coding: &Value, out: &mut Vec<IndexEntry>) {
    let system = coding
        .get("system")
        .and_then(Value::as_str)
        .map(str::to_string);
    // Identifier carries its token in "value", Coding in "code".
    let code = coding
        .get("code")
        .or_else(|| coding.get("value"))
        .and_then(Value::as_str);
    if let Some(code) = code {
        out.push(entry(param, IndexValue::token(system, code)));
    }
}

fn entry(param: &SearchParameterDefinition, value: IndexValue) -> IndexEntry {
    IndexEntry::new(param.code.clone(), param.url.clone(), value)
}

/// Pads partial dates so range comparisons work on the stored strings.
fn normalize_date(value: &str) -> String {
    if value.contains('T') {
        value.to_string()
    } else {
        match value.len() {
            10 => format!("{}T00:00:00", value),
            7 => format!("{}-01T00:00:00", value),
            4 => format!("{}-01-01T00:00:00", value),
            _ => value.to_string(),
        }
    }
}

/// Registry-backed extractor used by the backends on the write path.
///
/// Every upsert indexes against the full materializable rule set and stamps
/// the record with the matching rule-set hash.
pub struct ParamExtractor {
    registry: Arc<RwLock<SearchParameterRegistry>>,
}

impl ParamExtractor {
    /// Creates an extractor over a shared registry.
    pub fn new(registry: Arc<RwLock<SearchParameterRegistry>>) -> Self {
        Self { registry }
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<RwLock<SearchParameterRegistry>> {
        &self.registry
    }

    /// Extracts entries from a raw payload for the current materializable
    /// rule set. Non-JSON payloads produce no entries.
    pub fn extract(&self, resource_type: &str, raw: &[u8]) -> Vec<IndexEntry> {
        let Ok(payload) = serde_json::from_slice::<Value>(raw) else {
            return Vec::new();
        };
        let params = self.registry.read().materializable_params(resource_type);
        match extract_values(&params, resource_type, &payload) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(resource_type, error = %err, "index extraction failed");
                Vec::new()
            }
        }
    }

    /// Current rule-set hash for a type.
    pub fn param_hash(&self, resource_type: &str) -> String {
        self.registry.read().param_hash(resource_type)
    }
}

impl std::fmt::Debug for ParamExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamExtractor").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::params::ParamStatus;
    use serde_json::json;

    fn param(code: &str, kind: ParamKind, expression: &str) -> Arc<SearchParameterDefinition> {
        Arc::new(
            SearchParameterDefinition::new(
                format!("http://example.org/sp/{}", code),
                code,
                kind,
                expression,
            )
            .with_base(vec!["Patient", "Observation"]),
        )
    }

    #[test]
    fn extracts_strings_through_arrays() {
        let params = vec![param("family", ParamKind::String, "Patient.name.family")];
        let payload = json!({
            "resourceType": "Patient",
            "name": [{"family": "Smith"}, {"family": "Jones"}]
        });

        let entries = extract_values(&params, "Patient", &payload).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, IndexValue::string("smith"));
        assert_eq!(entries[1].value, IndexValue::string("jones"));
    }

    #[test]
    fn extracts_codeable_concept_tokens() {
        let params = vec![param("code", ParamKind::Token, "Observation.code")];
        let payload = json!({
            "resourceType": "Observation",
            "code": {"coding": [
                {"system": "http://loinc.org", "code": "8867-4"},
                {"system": "http://snomed.info/sct", "code": "364075005"}
            ]}
        });

        let entries = extract_values(&params, "Observation", &payload).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].value,
            IndexValue::token(Some("http://loinc.org".to_string()), "8867-4")
        );
    }

    #[test]
    fn extracts_identifier_tokens() {
        let params = vec![param("identifier", ParamKind::Token, "Patient.identifier")];
        let payload = json!({
            "resourceType": "Patient",
            "identifier": [{"system": "http://example.org/mrn", "value": "12345"}]
        });

        let entries = extract_values(&params, "Patient", &payload).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].value,
            IndexValue::token(Some("http://example.org/mrn".to_string()), "12345")
        );
    }

    #[test]
    fn extracts_references_and_unions() {
        let params = vec![param(
            "subject",
            ParamKind::Reference,
            "Observation.subject | Observation.patient",
        )];
        let payload = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/p1"}
        });

        let entries = extract_values(&params, "Observation", &payload).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, IndexValue::reference("Patient/p1"));
    }

    #[test]
    fn extracts_quantities_and_dates() {
        let params = vec![
            param("value", ParamKind::Quantity, "Observation.valueQuantity"),
            param("date", ParamKind::Date, "Observation.effectiveDateTime"),
        ];
        let payload = json!({
            "resourceType": "Observation",
            "valueQuantity": {"value": 72.5, "system": "http://unitsofmeasure.org", "code": "kg"},
            "effectiveDateTime": "2024-03"
        });

        let entries = extract_values(&params, "Observation", &payload).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1].value,
            IndexValue::date("2024-03-01T00:00:00")
        );
    }

    #[test]
    fn missing_paths_produce_no_entries() {
        let params = vec![param("family", ParamKind::String, "Patient.name.family")];
        let payload = json!({"resourceType": "Patient"});
        let entries = extract_values(&params, "Patient", &payload).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn duplicate_values_collapse() {
        let params = vec![param("status", ParamKind::Token, "Observation.status")];
        let payload = json!({"resourceType": "Observation", "status": "final"});
        // Applying the same rule twice still yields one row.
        let doubled = vec![params[0].clone(), params[0].clone()];
        let entries = extract_values(&doubled, "Observation", &payload).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rejects_non_object_payload() {
        let params = vec![param("family", ParamKind::String, "Patient.name.family")];
        let err = extract_values(&params, "Patient", &json!(["x"])).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPayload { .. }));
    }

    #[test]
    fn extractor_skips_disabled_rules() {
        let mut registry = SearchParameterRegistry::new();
        registry.register(
            SearchParameterDefinition::new(
                "http://example.org/sp/status",
                "status",
                ParamKind::Token,
                "Observation.status",
            )
            .with_base(vec!["Observation"])
            .with_status(ParamStatus::Disabled),
        );
        let extractor = ParamExtractor::new(Arc::new(RwLock::new(registry)));

        let raw = serde_json::to_vec(&json!({"resourceType": "Observation", "status": "final"}))
            .unwrap();
        assert!(extractor.extract("Observation", &raw).is_empty());
    }

    #[test]
    fn extractor_tolerates_non_json_payload() {
        let extractor = ParamExtractor::new(Arc::new(RwLock::new(
            SearchParameterRegistry::new(),
        )));
        assert!(extractor.extract("Binary", b"\x00\x01").is_empty());
    }
}
