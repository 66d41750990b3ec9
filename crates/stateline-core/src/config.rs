//! Execution context and factory configuration
//!
//! Every consumed option is a typed field; there is no lookup by property
//! name. Options are fixed for the life of a context except the few exposed
//! through [`ContextOption`].

use serde::Deserialize;
use std::num::NonZeroUsize;

use crate::errors::{Result, StatelineError};

/// Level-1 cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum L1CacheKind {
    /// Never evicts
    #[default]
    Strong,
    /// Evicts least-recently-used entries not pinned by the transaction
    Lru { capacity: usize },
}

/// L2 retrieve or store mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Use,
    /// Skip the L2 without clearing it
    Bypass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Flush at commit and when the dirty count reaches the auto limit
    #[default]
    Auto,
    /// Flush only at commit or on explicit request
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub l1_cache: L1CacheKind,
    pub l2_retrieve_mode: CacheMode,
    pub l2_store_mode: CacheMode,
    pub l2_batch_size: usize,
    pub detach_all_on_commit: bool,
    pub detach_on_close: bool,
    pub copy_on_attach: bool,
    pub flush_mode: FlushMode,
    pub flush_auto_object_limit: usize,
    pub max_flush_rounds: usize,
    pub nontransactional_atomic_write: bool,
    pub optimistic: bool,
    pub reachability_at_commit: bool,
    pub managed_relations: bool,
    pub managed_relations_checks: bool,
    pub managed_relations_strict: bool,
    pub multithreaded: bool,
    pub retain_values: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            l1_cache: L1CacheKind::Strong,
            l2_retrieve_mode: CacheMode::Use,
            l2_store_mode: CacheMode::Use,
            l2_batch_size: 50,
            detach_all_on_commit: false,
            detach_on_close: false,
            copy_on_attach: true,
            flush_mode: FlushMode::Auto,
            flush_auto_object_limit: 1000,
            max_flush_rounds: 2,
            nontransactional_atomic_write: true,
            optimistic: false,
            reachability_at_commit: false,
            managed_relations: true,
            managed_relations_checks: true,
            managed_relations_strict: false,
            multithreaded: false,
            retain_values: true,
        }
    }
}

impl ContextConfig {
    /// Parse a TOML fragment; absent keys keep their defaults
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the TOML does not parse or fails
    /// [`validate`](Self::validate).
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: ContextConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero sizes or caps.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(StatelineError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.l2_batch_size == 0 {
            return invalid("l2_batch_size must be at least 1");
        }
        if self.max_flush_rounds == 0 {
            return invalid("max_flush_rounds must be at least 1");
        }
        if self.flush_auto_object_limit == 0 {
            return invalid("flush_auto_object_limit must be at least 1");
        }
        if let L1CacheKind::Lru { capacity } = self.l1_cache {
            if NonZeroUsize::new(capacity).is_none() {
                return invalid("l1 lru capacity must be at least 1");
            }
        }
        Ok(())
    }
}

/// Options that may be changed on an open context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextOption {
    L1Cache(L1CacheKind),
    FlushMode(FlushMode),
    L2RetrieveMode(CacheMode),
    L2StoreMode(CacheMode),
    DetachAllOnCommit(bool),
    DetachOnClose(bool),
    CopyOnAttach(bool),
    FlushAutoObjectLimit(usize),
    Optimistic(bool),
    ReachabilityAtCommit(bool),
    ManagedRelations(bool),
}

impl ContextOption {
    pub fn name(&self) -> &'static str {
        match self {
            ContextOption::L1Cache(_) => "l1_cache",
            ContextOption::FlushMode(_) => "flush_mode",
            ContextOption::L2RetrieveMode(_) => "l2_retrieve_mode",
            ContextOption::L2StoreMode(_) => "l2_store_mode",
            ContextOption::DetachAllOnCommit(_) => "detach_all_on_commit",
            ContextOption::DetachOnClose(_) => "detach_on_close",
            ContextOption::CopyOnAttach(_) => "copy_on_attach",
            ContextOption::FlushAutoObjectLimit(_) => "flush_auto_object_limit",
            ContextOption::Optimistic(_) => "optimistic",
            ContextOption::ReachabilityAtCommit(_) => "reachability_at_commit",
            ContextOption::ManagedRelations(_) => "managed_relations",
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            ContextOption::L1Cache(_)
                | ContextOption::FlushMode(_)
                | ContextOption::L2RetrieveMode(_)
                | ContextOption::L2StoreMode(_)
        )
    }
}

/// Process-wide settings owned by the context factory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// `"strong"`, `"lru"`, `"none"`, or a registered backend name
    pub l2_backend: String,
    pub l2_capacity: usize,
    pub context: ContextConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            l2_backend: "strong".to_string(),
            l2_capacity: 10_000,
            context: ContextConfig::default(),
        }
    }
}

impl FactoryConfig {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the TOML does not parse or the embedded
    /// context configuration is invalid.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: FactoryConfig = toml::from_str(input)?;
        config.context.validate()?;
        if config.l2_capacity == 0 {
            return Err(StatelineError::InvalidConfig {
                reason: "l2_capacity must be at least 1".to_string(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.max_flush_rounds, 2);
        assert_eq!(config.l1_cache, L1CacheKind::Strong);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_overrides_subset() {
        let config = ContextConfig::from_toml_str(
            r#"
            flush_mode = "manual"
            l2_batch_size = 3
            reachability_at_commit = true
            l1_cache = { type = "lru", capacity = 16 }
            "#,
        )
        .unwrap();
        assert_eq!(config.flush_mode, FlushMode::Manual);
        assert_eq!(config.l2_batch_size, 3);
        assert!(config.reachability_at_commit);
        assert_eq!(config.l1_cache, L1CacheKind::Lru { capacity: 16 });
        assert!(config.managed_relations);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = ContextConfig::from_toml_str("l2_batch_size = 0").unwrap_err();
        assert!(matches!(err, StatelineError::InvalidConfig { .. }));
    }

    #[test]
    fn test_malformed_toml_is_invalid_config() {
        let err = ContextConfig::from_toml_str("flush_mode = ").unwrap_err();
        assert!(matches!(err, StatelineError::InvalidConfig { .. }));
    }

    #[test]
    fn test_factory_config_nested_context() {
        let config = FactoryConfig::from_toml_str(
            r#"
            l2_backend = "lru"
            l2_capacity = 8

            [context]
            optimistic = true
            "#,
        )
        .unwrap();
        assert_eq!(config.l2_backend, "lru");
        assert!(config.context.optimistic);
    }

    #[test]
    fn test_mutable_options() {
        assert!(ContextOption::FlushMode(FlushMode::Manual).is_mutable());
        assert!(!ContextOption::Optimistic(true).is_mutable());
        assert_eq!(ContextOption::Optimistic(true).name(), "optimistic");
    }
}
