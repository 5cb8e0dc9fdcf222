//! Search index row types.
//!
//! Each index row belongs to a typed family. A row carries the extraction
//! rule that produced it and a family-specific payload; rows live only for
//! the current non-deleted version of a record.

use serde::{Deserialize, Serialize};

/// The typed families an extraction rule can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Coded value, optionally namespaced by a system URI.
    Token,
    /// Case-folded string.
    String,
    /// Reference to another record by `Type/id`.
    Reference,
    /// Number with unit.
    Quantity,
    /// Instant or partial date.
    Date,
    /// Bare number.
    Number,
    /// URI value.
    Uri,
    /// Tuple of component values sharing a group id.
    Composite,
}

impl ParamKind {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::Token => "token",
            ParamKind::String => "string",
            ParamKind::Reference => "reference",
            ParamKind::Quantity => "quantity",
            ParamKind::Date => "date",
            ParamKind::Number => "number",
            ParamKind::Uri => "uri",
            ParamKind::Composite => "composite",
        }
    }

    /// Parses the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "token" => Some(ParamKind::Token),
            "string" => Some(ParamKind::String),
            "reference" => Some(ParamKind::Reference),
            "quantity" => Some(ParamKind::Quantity),
            "date" => Some(ParamKind::Date),
            "number" => Some(ParamKind::Number),
            "uri" => Some(ParamKind::Uri),
            "composite" => Some(ParamKind::Composite),
            _ => None,
        }
    }
}

/// A value extracted and converted for the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexValue {
    /// String value, stored case-folded.
    String {
        /// The folded value.
        value: String,
    },

    /// Token value (code with optional system).
    Token {
        /// Code system URI.
        system: Option<String>,
        /// Code value.
        code: String,
    },

    /// Reference to another record.
    Reference {
        /// Reference string (e.g. "Patient/123").
        reference: String,
    },

    /// Quantity with optional unit.
    Quantity {
        /// Numeric value.
        value: f64,
        /// Unit system URI.
        system: Option<String>,
        /// Unit code.
        code: Option<String>,
    },

    /// Date/dateTime value, ISO 8601.
    Date {
        /// The stored instant or partial date.
        value: String,
    },

    /// Bare numeric value.
    Number {
        /// The value.
        value: f64,
    },

    /// URI value.
    Uri {
        /// The value.
        value: String,
    },
}

impl IndexValue {
    /// Creates a folded string value.
    pub fn string(s: impl Into<String>) -> Self {
        IndexValue::String {
            value: s.into().to_lowercase(),
        }
    }

    /// Creates a token value.
    pub fn token(system: Option<String>, code: impl Into<String>) -> Self {
        IndexValue::Token {
            system,
            code: code.into(),
        }
    }

    /// Creates a reference value.
    pub fn reference(reference: impl Into<String>) -> Self {
        IndexValue::Reference {
            reference: reference.into(),
        }
    }

    /// Creates a date value.
    pub fn date(value: impl Into<String>) -> Self {
        IndexValue::Date {
            value: value.into(),
        }
    }

    /// Creates a uri value.
    pub fn uri(value: impl Into<String>) -> Self {
        IndexValue::Uri {
            value: value.into(),
        }
    }

    /// The family this value belongs to.
    pub fn kind(&self) -> ParamKind {
        match self {
            IndexValue::String { .. } => ParamKind::String,
            IndexValue::Token { .. } => ParamKind::Token,
            IndexValue::Reference { .. } => ParamKind::Reference,
            IndexValue::Quantity { .. } => ParamKind::Quantity,
            IndexValue::Date { .. } => ParamKind::Date,
            IndexValue::Number { .. } => ParamKind::Number,
            IndexValue::Uri { .. } => ParamKind::Uri,
        }
    }
}

/// One search index row for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Code of the extraction rule that produced this row.
    pub param_code: String,

    /// Canonical URL of the extraction rule.
    pub param_url: String,

    /// The typed payload.
    pub value: IndexValue,

    /// Rows of one composite match share a group id.
    pub composite_group: Option<u32>,
}

impl IndexEntry {
    /// Creates an entry.
    pub fn new(
        param_code: impl Into<String>,
        param_url: impl Into<String>,
        value: IndexValue,
    ) -> Self {
        Self {
            param_code: param_code.into(),
            param_url: param_url.into(),
            value,
            composite_group: None,
        }
    }

    /// Assigns a composite group.
    pub fn with_composite_group(mut self, group: u32) -> Self {
        self.composite_group = Some(group);
        self
    }
}

/// Collapses duplicate rows for the same `(param, value)` pair.
///
/// Order of first occurrence is preserved.
pub fn dedup_entries(entries: Vec<IndexEntry>) -> Vec<IndexEntry> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        // f64 payloads keep IndexValue out of Eq/Hash; the serialized form
        // is the distinctness key.
        let key = serde_json::to_string(&entry).unwrap_or_default();
        if seen.insert(key) {
            out.push(entry);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_values_fold_case() {
        let value = IndexValue::string("Smith");
        assert_eq!(
            value,
            IndexValue::String {
                value: "smith".to_string()
            }
        );
        assert_eq!(value.kind(), ParamKind::String);
    }

    #[test]
    fn param_kind_round_trip() {
        for kind in [
            ParamKind::Token,
            ParamKind::String,
            ParamKind::Reference,
            ParamKind::Quantity,
            ParamKind::Date,
            ParamKind::Number,
            ParamKind::Uri,
            ParamKind::Composite,
        ] {
            assert_eq!(ParamKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ParamKind::parse("bogus"), None);
    }

    #[test]
    fn dedup_collapses_identical_rows() {
        let entries = vec![
            IndexEntry::new("status", "u", IndexValue::token(None, "final")),
            IndexEntry::new("status", "u", IndexValue::token(None, "final")),
            IndexEntry::new("status", "u", IndexValue::token(None, "amended")),
        ];
        let deduped = dedup_entries(entries);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn dedup_keeps_distinct_composite_groups() {
        let a = IndexEntry::new("code-value", "u", IndexValue::token(None, "x"))
            .with_composite_group(0);
        let b = IndexEntry::new("code-value", "u", IndexValue::token(None, "x"))
            .with_composite_group(1);
        assert_eq!(dedup_entries(vec![a, b]).len(), 2);
    }
}
