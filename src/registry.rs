//! Model registry.
//!
//! Each logical entity model registers its ordered identity-path list at
//! startup; the engine iterates this registry rather than inspecting loaded
//! code at runtime. The registry is a consumed interface: hosts may back it
//! with configuration, a schema service, or the in-memory implementation
//! shipped here.

use std::fmt;
use std::sync::RwLock;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of a logical entity model (e.g. `customer`, `asset`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelName(String);

impl ModelName {
    /// Creates a model name. Surrounding whitespace is trimmed.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_string())
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payload path that yields identity candidate values.
///
/// Paths address either a flat payload key (which may itself contain dots)
/// or a dotted descent through nested maps; the extractor tries the flat key
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityPath(String);

impl IdentityPath {
    /// Creates an identity path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim().to_string())
    }

    /// Returns the full path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates the dotted segments of the path.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for IdentityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of entity models and their identity paths.
pub trait ModelRegistry: Send + Sync {
    /// Ordered identity-path list declared for the model.
    ///
    /// # Errors
    /// - `ConfigError::UnknownModel` if the model was never registered.
    fn identity_paths(&self, model: &ModelName) -> Result<Vec<IdentityPath>, ConfigError>;

    /// All registered models, in registration order.
    fn list_models(&self) -> Vec<ModelName>;
}

/// Thread-safe in-memory registry for embedded use and tests.
#[derive(Debug, Default)]
pub struct InMemoryModelRegistry {
    models: RwLock<IndexMap<ModelName, Vec<IdentityPath>>>,
}

impl InMemoryModelRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a model and its identity paths.
    pub fn register(&self, model: ModelName, paths: Vec<IdentityPath>) {
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
        models.insert(model, paths);
    }
}

impl ModelRegistry for InMemoryModelRegistry {
    fn identity_paths(&self, model: &ModelName) -> Result<Vec<IdentityPath>, ConfigError> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        models
            .get(model)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownModel {
                model: model.to_string(),
            })
    }

    fn list_models(&self) -> Vec<ModelName> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        models.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the trait is object-safe.
    fn _assert_registry_object_safe(_: &dyn ModelRegistry) {}

    #[test]
    fn register_and_list_in_order() {
        let registry = InMemoryModelRegistry::new();
        registry.register(
            ModelName::new("customer"),
            vec![IdentityPath::new("customerCode")],
        );
        registry.register(ModelName::new("asset"), vec![IdentityPath::new("serial")]);

        let models = registry.list_models();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].as_str(), "customer");
        assert_eq!(models[1].as_str(), "asset");
    }

    #[test]
    fn unknown_model_is_a_config_error() {
        let registry = InMemoryModelRegistry::new();
        let err = registry
            .identity_paths(&ModelName::new("ghost"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModel { .. }));
    }

    #[test]
    fn paths_keep_declaration_order() {
        let registry = InMemoryModelRegistry::new();
        registry.register(
            ModelName::new("customer"),
            vec![
                IdentityPath::new("customerCode"),
                IdentityPath::new("external.id"),
            ],
        );
        let paths = registry
            .identity_paths(&ModelName::new("customer"))
            .unwrap();
        assert_eq!(paths[0].as_str(), "customerCode");
        assert_eq!(paths[1].as_str(), "external.id");
    }

    #[test]
    fn path_segments_split_on_dots() {
        let path = IdentityPath::new("external.system.id");
        let segs: Vec<&str> = path.segments().collect();
        assert_eq!(segs, vec!["external", "system", "id"]);
    }

    #[test]
    fn model_name_trims() {
        assert_eq!(ModelName::new("  customer ").as_str(), "customer");
    }
}
