//! Extraction-rule (search parameter) definitions and registry.
//!
//! The registry is the in-memory source of truth for which rules exist, what
//! lifecycle state they are in, and the deterministic hash of the rule set
//! applicable to each resource type. Records stamped with an older hash are
//! stale and eligible for reindexing.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::ParamKind;

/// Lifecycle state of an extraction rule.
///
/// New rules enter as `Supported`: the engine can materialize their index
/// rows, but the query layer does not honor them until a completed reindex
/// proves every persisted record carries them, at which point they are
/// promoted to `Searchable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamStatus {
    /// Honored by the query layer.
    Searchable,
    /// Materializable but not yet proven complete.
    #[default]
    Supported,
    /// Excluded from extraction and querying.
    Disabled,
}

impl ParamStatus {
    /// Whether index rows are produced for rules in this state.
    pub fn is_materializable(&self) -> bool {
        !matches!(self, ParamStatus::Disabled)
    }
}

/// Definition of one extraction rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParameterDefinition {
    /// Canonical URL, the rule's unique identifier.
    pub url: String,

    /// Parameter code (the query-string name, e.g. "name", "identifier").
    pub code: String,

    /// The value family this rule produces.
    pub kind: ParamKind,

    /// Path expression over the payload. Dotted segments with implicit
    /// array flattening; `|` separates union alternatives.
    pub expression: String,

    /// Resource types this rule applies to.
    pub base: Vec<String>,

    /// Current lifecycle state.
    pub status: ParamStatus,
}

impl SearchParameterDefinition {
    /// Creates a rule in the `Supported` state.
    pub fn new(
        url: impl Into<String>,
        code: impl Into<String>,
        kind: ParamKind,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            code: code.into(),
            kind,
            expression: expression.into(),
            base: Vec::new(),
            status: ParamStatus::Supported,
        }
    }

    /// Sets the base resource types.
    pub fn with_base<I, S>(mut self, base: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = base.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the lifecycle state.
    pub fn with_status(mut self, status: ParamStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether this rule applies to the given resource type.
    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.base
            .iter()
            .any(|b| b == resource_type || b == "Resource")
    }
}

/// In-memory registry of extraction rules.
///
/// Indexed by canonical URL and by resource type for fast lookup on the
/// write path.
pub struct SearchParameterRegistry {
    params_by_url: HashMap<String, Arc<SearchParameterDefinition>>,
    params_by_type: HashMap<String, Vec<Arc<SearchParameterDefinition>>>,
}

impl SearchParameterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            params_by_url: HashMap::new(),
            params_by_type: HashMap::new(),
        }
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.params_by_url.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.params_by_url.is_empty()
    }

    /// Registers a rule, replacing any prior definition with the same URL.
    pub fn register(&mut self, param: SearchParameterDefinition) {
        let param = Arc::new(param);
        if let Some(old) = self
            .params_by_url
            .insert(param.url.clone(), Arc::clone(&param))
        {
            for base in &old.base {
                if let Some(list) = self.params_by_type.get_mut(base) {
                    list.retain(|p| p.url != old.url);
                }
            }
        }
        for base in &param.base {
            self.params_by_type
                .entry(base.clone())
                .or_default()
                .push(Arc::clone(&param));
        }
    }

    /// Looks a rule up by canonical URL.
    pub fn get_by_url(&self, url: &str) -> Option<Arc<SearchParameterDefinition>> {
        self.params_by_url.get(url).cloned()
    }

    /// Rules for a resource type in the given state.
    pub fn params_with_status(
        &self,
        resource_type: &str,
        status: ParamStatus,
    ) -> Vec<Arc<SearchParameterDefinition>> {
        self.params_by_type
            .get(resource_type)
            .map(|params| {
                params
                    .iter()
                    .filter(|p| p.status == status)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All materializable rules for a resource type (searchable and
    /// supported alike).
    pub fn materializable_params(
        &self,
        resource_type: &str,
    ) -> Vec<Arc<SearchParameterDefinition>> {
        self.params_by_type
            .get(resource_type)
            .map(|params| {
                params
                    .iter()
                    .filter(|p| p.status.is_materializable())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Moves a rule to a new lifecycle state. Unknown URLs are ignored.
    pub fn set_status(&mut self, url: &str, status: ParamStatus) {
        let Some(old) = self.params_by_url.get(url) else {
            return;
        };
        let mut updated = (**old).clone();
        updated.status = status;
        self.register(updated);
    }

    /// Resource types that have at least one registered rule.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.params_by_type.keys().cloned().collect();
        types.sort();
        types
    }

    /// Deterministic hash of the materializable rule set for a type.
    ///
    /// Stable across processes: the URLs are sorted before hashing, so two
    /// deployments with the same rule set agree on the hash.
    pub fn param_hash(&self, resource_type: &str) -> String {
        let mut urls: Vec<&str> = self
            .params_by_type
            .get(resource_type)
            .map(|params| {
                params
                    .iter()
                    .filter(|p| p.status.is_materializable())
                    .map(|p| p.url.as_str())
                    .collect()
            })
            .unwrap_or_default();
        urls.sort_unstable();

        let mut hasher = Sha256::new();
        for url in urls {
            hasher.update(url.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Default for SearchParameterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SearchParameterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchParameterRegistry")
            .field("params", &self.params_by_url.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_param() -> SearchParameterDefinition {
        SearchParameterDefinition::new(
            "http://example.org/sp/Patient-name",
            "name",
            ParamKind::String,
            "Patient.name.family",
        )
        .with_base(vec!["Patient"])
        .with_status(ParamStatus::Searchable)
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = SearchParameterRegistry::new();
        registry.register(name_param());

        assert_eq!(registry.len(), 1);
        assert!(registry
            .get_by_url("http://example.org/sp/Patient-name")
            .is_some());
        assert_eq!(
            registry
                .params_with_status("Patient", ParamStatus::Searchable)
                .len(),
            1
        );
        assert!(registry
            .params_with_status("Observation", ParamStatus::Searchable)
            .is_empty());
    }

    #[test]
    fn status_transition_moves_buckets() {
        let mut registry = SearchParameterRegistry::new();
        registry.register(name_param().with_status(ParamStatus::Supported));

        assert_eq!(
            registry
                .params_with_status("Patient", ParamStatus::Supported)
                .len(),
            1
        );

        registry.set_status("http://example.org/sp/Patient-name", ParamStatus::Searchable);
        assert!(registry
            .params_with_status("Patient", ParamStatus::Supported)
            .is_empty());
        assert_eq!(
            registry
                .params_with_status("Patient", ParamStatus::Searchable)
                .len(),
            1
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn hash_is_order_independent_and_status_sensitive() {
        let a = SearchParameterDefinition::new("http://e/sp/a", "a", ParamKind::Token, "R.a")
            .with_base(vec!["Observation"]);
        let b = SearchParameterDefinition::new("http://e/sp/b", "b", ParamKind::Token, "R.b")
            .with_base(vec!["Observation"]);

        let mut one = SearchParameterRegistry::new();
        one.register(a.clone());
        one.register(b.clone());

        let mut two = SearchParameterRegistry::new();
        two.register(b.clone());
        two.register(a.clone());

        assert_eq!(one.param_hash("Observation"), two.param_hash("Observation"));

        // Disabling a rule changes the materializable set, so the hash moves.
        two.set_status("http://e/sp/b", ParamStatus::Disabled);
        assert_ne!(one.param_hash("Observation"), two.param_hash("Observation"));
    }

    #[test]
    fn hash_of_empty_type_is_stable() {
        let registry = SearchParameterRegistry::new();
        assert_eq!(registry.param_hash("Patient"), registry.param_hash("Patient"));
        assert_eq!(registry.param_hash("Patient").len(), 32);
    }

    #[test]
    fn applies_to_resource_base() {
        let param = SearchParameterDefinition::new("u", "c", ParamKind::Date, "R.meta.lastUpdated")
            .with_base(vec!["Resource"]);
        assert!(param.applies_to("Patient"));
        assert!(param.applies_to("Observation"));
    }
}
