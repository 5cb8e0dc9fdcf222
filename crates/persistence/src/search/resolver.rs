//! Support resolver: the reindex task's read-only oracle over the rule set.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StoreResult;

use super::params::{ParamStatus, SearchParameterDefinition, SearchParameterRegistry};

/// Reports which extraction rules can be materialized, the stable hash per
/// resource type, and promotes rules once a reindex proves completion.
#[async_trait]
pub trait SupportResolver: Send + Sync {
    /// Rules the query layer honors for a type.
    fn searchable_parameters(&self, resource_type: &str) -> Vec<Arc<SearchParameterDefinition>>;

    /// Rules that can be materialized but are not yet searchable.
    fn supported_but_not_searchable(
        &self,
        resource_type: &str,
    ) -> Vec<Arc<SearchParameterDefinition>>;

    /// Every materializable rule for a type.
    fn materializable_parameters(
        &self,
        resource_type: &str,
    ) -> Vec<Arc<SearchParameterDefinition>>;

    /// Deterministic hash over the materializable rules for a type.
    fn hash(&self, resource_type: &str) -> String;

    /// Resource types with at least one registered rule.
    fn resource_types(&self) -> Vec<String>;

    /// Marks the given rule URLs `Searchable` and persists the change.
    async fn promote(&self, urls: &[String]) -> StoreResult<()>;
}

/// Resolver backed by the shared in-memory registry.
#[derive(Debug)]
pub struct RegistryResolver {
    registry: Arc<RwLock<SearchParameterRegistry>>,
}

impl RegistryResolver {
    /// Creates a resolver over a shared registry.
    pub fn new(registry: Arc<RwLock<SearchParameterRegistry>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SupportResolver for RegistryResolver {
    fn searchable_parameters(&self, resource_type: &str) -> Vec<Arc<SearchParameterDefinition>> {
        self.registry
            .read()
            .params_with_status(resource_type, ParamStatus::Searchable)
    }

    fn supported_but_not_searchable(
        &self,
        resource_type: &str,
    ) -> Vec<Arc<SearchParameterDefinition>> {
        self.registry
            .read()
            .params_with_status(resource_type, ParamStatus::Supported)
    }

    fn materializable_parameters(
        &self,
        resource_type: &str,
    ) -> Vec<Arc<SearchParameterDefinition>> {
        self.registry.read().materializable_params(resource_type)
    }

    fn hash(&self, resource_type: &str) -> String {
        self.registry.read().param_hash(resource_type)
    }

    fn resource_types(&self) -> Vec<String> {
        self.registry.read().resource_types()
    }

    async fn promote(&self, urls: &[String]) -> StoreResult<()> {
        let mut registry = self.registry.write();
        for url in urls {
            registry.set_status(url, ParamStatus::Searchable);
        }
        tracing::info!(count = urls.len(), "promoted search parameters");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamKind;

    fn registry_with_supported() -> Arc<RwLock<SearchParameterRegistry>> {
        let mut registry = SearchParameterRegistry::new();
        registry.register(
            SearchParameterDefinition::new(
                "http://example.org/sp/color",
                "color",
                ParamKind::Token,
                "Observation.color",
            )
            .with_base(vec!["Observation"]),
        );
        Arc::new(RwLock::new(registry))
    }

    #[tokio::test]
    async fn promote_flips_supported_to_searchable() {
        let registry = registry_with_supported();
        let resolver = RegistryResolver::new(Arc::clone(&registry));

        assert_eq!(resolver.supported_but_not_searchable("Observation").len(), 1);
        assert!(resolver.searchable_parameters("Observation").is_empty());

        let before = resolver.hash("Observation");
        resolver
            .promote(&["http://example.org/sp/color".to_string()])
            .await
            .unwrap();

        assert!(resolver.supported_but_not_searchable("Observation").is_empty());
        assert_eq!(resolver.searchable_parameters("Observation").len(), 1);
        // Promotion does not change the materializable set, so the hash holds.
        assert_eq!(resolver.hash("Observation"), before);
    }

    #[test]
    fn resource_types_are_sorted() {
        let registry = registry_with_supported();
        registry.write().register(
            SearchParameterDefinition::new("http://e/sp/n", "name", ParamKind::String, "P.name")
                .with_base(vec!["Patient"]),
        );
        let resolver = RegistryResolver::new(registry);
        assert_eq!(resolver.resource_types(), vec!["Observation", "Patient"]);
    }
}
