//! Cached executable units
//!
//! An executable unit is a long-lived operator instance kept across
//! invocations to amortize setup cost. Units are cached per workspace
//! under a structured [`CacheKey`]; there is no process-wide registry.

use std::collections::HashMap;
use std::fmt;

use crate::error::ForgeResult;
use crate::workspace::Workspace;

/// Structured cache key identifying one operator instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Operator family, e.g. `"Conv2d"`
    pub unit_type: String,
    /// Instance discriminator, usually the operator's graph-level name
    pub instance: String,
}

impl CacheKey {
    /// Build a cache key
    pub fn new(unit_type: impl Into<String>, instance: impl Into<String>) -> Self {
        CacheKey {
            unit_type: unit_type.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.unit_type, self.instance)
    }
}

/// Definition a unit is constructed from and re-derived against
#[derive(Debug, Clone, Default)]
pub struct UnitDef {
    /// Operator family
    pub unit_type: String,
    /// Operator name
    pub name: String,
    /// Cache under this key; `None` means construct, run and discard
    pub cache_key: Option<CacheKey>,
    /// Free-form parameters, re-supplied on every invocation
    pub args: HashMap<String, String>,
}

impl UnitDef {
    /// Build a definition with no cache key
    pub fn new(unit_type: impl Into<String>, name: impl Into<String>) -> Self {
        UnitDef {
            unit_type: unit_type.into(),
            name: name.into(),
            cache_key: None,
            args: HashMap::new(),
        }
    }

    /// Cache the constructed unit under `key`
    pub fn with_cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    /// Add a parameter
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// A runnable operator instance owned by a workspace's unit cache
pub trait ExecutableUnit: Send {
    /// Absorb the updated parameters of a new definition before a cached
    /// re-run; the default keeps the construction-time state.
    fn derive_from(&mut self, _def: &UnitDef) -> ForgeResult<()> {
        Ok(())
    }

    /// Execute against the workspace's tensors
    fn run(&mut self, workspace: &mut Workspace) -> ForgeResult<()>;
}
