//! Write-once facade configuration.
//!
//! Options arrive either as a typed [`KeeperOptions`] or as loosely-typed JSON
//! or TOML. The loose forms reject unknown keys; a rejected call resets the
//! configuration to defaults rather than applying part of it.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::BackendType;
use crate::error::{KeeperError, KeeperResult};
use crate::namespace::{namespace_prefix, validate_component};

/// Default store identity name.
pub const DEFAULT_NAME: &str = "kv-keeper";

/// Default record-collection name.
pub const DEFAULT_RECORD_COLLECTION: &str = "items";

/// Schema version requested when opening the transactional store.
pub const SCHEMA_VERSION: u32 = 1;

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperConfig {
    name: String,
    record_collection: String,
    default_type: BackendType,
    prefix: String,
}

impl KeeperConfig {
    fn build(name: String, record_collection: String, default_type: BackendType) -> Self {
        let prefix = namespace_prefix(&name, &record_collection);
        Self {
            name,
            record_collection,
            default_type,
            prefix,
        }
    }

    /// Store identity name (transactional connection identity).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record-collection name (transactional schema collection).
    #[must_use]
    pub fn record_collection(&self) -> &str {
        &self.record_collection
    }

    /// Backend used when a caller names none.
    #[must_use]
    pub fn default_type(&self) -> BackendType {
        self.default_type
    }

    /// Flat-store namespace prefix derived from name and collection.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self::build(
            DEFAULT_NAME.to_owned(),
            DEFAULT_RECORD_COLLECTION.to_owned(),
            BackendType::default(),
        )
    }
}

/// Options accepted by [`KvKeeper::configure`](crate::KvKeeper::configure).
///
/// Unset fields keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct KeeperOptions {
    /// Store identity name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Record-collection name.
    #[serde(
        default,
        alias = "storeName",
        skip_serializing_if = "Option::is_none"
    )]
    pub record_collection_name: Option<String>,
    /// Default backend type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_type: Option<BackendType>,
}

impl KeeperOptions {
    /// Empty options (all defaults).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store identity name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the record-collection name.
    #[must_use]
    pub fn with_record_collection(mut self, collection: impl Into<String>) -> Self {
        self.record_collection_name = Some(collection.into());
        self
    }

    /// Set the default backend type.
    #[must_use]
    pub fn with_default_type(mut self, default_type: BackendType) -> Self {
        self.default_type = Some(default_type);
        self
    }

    /// Parse options from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::Validation`] on unknown keys, wrong value types,
    /// or an unknown `defaultType`.
    pub fn from_json(value: serde_json::Value) -> KeeperResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| KeeperError::Validation(format!("invalid options: {e}")))
    }

    /// Parse options from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::Validation`] on syntax errors, unknown keys, or
    /// an unknown `defaultType`.
    pub fn from_toml(document: &str) -> KeeperResult<Self> {
        toml::from_str(document)
            .map_err(|e| KeeperError::Validation(format!("invalid options: {e}")))
    }

    fn resolve(self) -> KeeperResult<KeeperConfig> {
        let name = self.name.unwrap_or_else(|| DEFAULT_NAME.to_owned());
        let collection = self
            .record_collection_name
            .unwrap_or_else(|| DEFAULT_RECORD_COLLECTION.to_owned());
        validate_component("name", &name)?;
        validate_component("recordCollectionName", &collection)?;
        Ok(KeeperConfig::build(
            name,
            collection,
            self.default_type.unwrap_or_default(),
        ))
    }
}

#[derive(Debug, Default)]
struct ConfigState {
    current: Arc<KeeperConfig>,
    configured: bool,
}

/// Write-once holder for the active [`KeeperConfig`].
#[derive(Debug, Default)]
pub(crate) struct ConfigCell {
    state: Mutex<ConfigState>,
}

impl ConfigCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the active configuration.
    pub(crate) fn current(&self) -> Arc<KeeperConfig> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state.current)
    }

    /// Apply the outcome of parsing options. Consumes the single
    /// configuration opportunity whether or not `parsed` is `Ok`.
    pub(crate) fn apply(&self, parsed: KeeperResult<KeeperOptions>) -> KeeperResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.configured {
            return Err(KeeperError::Validation(
                "Configuration can be applied only once".into(),
            ));
        }
        state.configured = true;

        match parsed.and_then(KeeperOptions::resolve) {
            Ok(config) => {
                debug!(
                    name = config.name(),
                    collection = config.record_collection(),
                    default_type = %config.default_type(),
                    "configured"
                );
                state.current = Arc::new(config);
                Ok(())
            },
            Err(e) => {
                warn!(error = %e, "configuration rejected, using defaults");
                state.current = Arc::new(KeeperConfig::default());
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KeeperConfig::default();
        assert_eq!(config.name(), DEFAULT_NAME);
        assert_eq!(config.record_collection(), DEFAULT_RECORD_COLLECTION);
        assert_eq!(config.default_type(), BackendType::Auto);
        assert_eq!(config.prefix(), "kv-keeper:items:");
    }

    #[test]
    fn test_apply_once() {
        let cell = ConfigCell::new();
        cell.apply(Ok(KeeperOptions::new().with_name("app")))
            .unwrap();
        assert_eq!(cell.current().name(), "app");
        assert_eq!(cell.current().prefix(), "app:items:");

        let err = cell
            .apply(Ok(KeeperOptions::new().with_name("other")))
            .unwrap_err();
        assert!(matches!(err, KeeperError::Validation(_)));
        assert_eq!(cell.current().name(), "app");
    }

    #[test]
    fn test_same_options_twice_fails() {
        let cell = ConfigCell::new();
        let opts = KeeperOptions::new().with_default_type(BackendType::Flat);
        cell.apply(Ok(opts.clone())).unwrap();
        assert!(cell.apply(Ok(opts)).is_err());
        assert_eq!(cell.current().default_type(), BackendType::Flat);
    }

    #[test]
    fn test_failed_first_call_resets_and_locks() {
        let cell = ConfigCell::new();
        let parsed = KeeperOptions::from_json(serde_json::json!({
            "name": "app",
            "bogus": true,
        }));
        assert!(cell.apply(parsed).is_err());
        assert_eq!(*cell.current(), KeeperConfig::default());

        assert!(cell.apply(Ok(KeeperOptions::new().with_name("app"))).is_err());
        assert_eq!(*cell.current(), KeeperConfig::default());
    }

    #[test]
    fn test_from_json_recognized_keys() {
        let opts = KeeperOptions::from_json(serde_json::json!({
            "name": "app",
            "recordCollectionName": "records",
            "defaultType": "flat",
        }))
        .unwrap();
        assert_eq!(opts.name.as_deref(), Some("app"));
        assert_eq!(opts.record_collection_name.as_deref(), Some("records"));
        assert_eq!(opts.default_type, Some(BackendType::Flat));
    }

    #[test]
    fn test_from_json_store_name_alias() {
        let opts = KeeperOptions::from_json(serde_json::json!({ "storeName": "records" })).unwrap();
        assert_eq!(opts.record_collection_name.as_deref(), Some("records"));
    }

    #[test]
    fn test_from_json_rejects_bad_default_type() {
        let err = KeeperOptions::from_json(serde_json::json!({ "defaultType": "sql" }))
            .unwrap_err();
        assert!(matches!(err, KeeperError::Validation(_)));
    }

    #[test]
    fn test_from_toml() {
        let opts = KeeperOptions::from_toml(
            r#"
            name = "app"
            defaultType = "transactional"
            "#,
        )
        .unwrap();
        assert_eq!(opts.name.as_deref(), Some("app"));
        assert_eq!(opts.default_type, Some(BackendType::Transactional));

        assert!(KeeperOptions::from_toml("unknown = 1").is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let cell = ConfigCell::new();
        assert!(cell.apply(Ok(KeeperOptions::new().with_name(""))).is_err());
        assert_eq!(*cell.current(), KeeperConfig::default());
    }
}
