//! Session-scoped tensor registry
//!
//! A `Workspace` isolates the resources of one computation session: it
//! owns every tensor created in it, borrows tensors merged from sibling
//! workspaces, resolves aliases, hands out collision-free names, pools
//! shared scratch buffers and caches executable units across invocations.

mod unit;

pub use unit::{CacheKey, ExecutableUnit, UnitDef};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::device::DeviceContext;
use crate::error::{ForgeResult, TensorForgeError};
use crate::tensor::Tensor;

/// Shared handle to a workspace-owned (or borrowed) tensor
pub type TensorRef = Arc<Mutex<Tensor>>;

/// Names starting with this prefix are workspace-internal and are never
/// exported by [`Workspace::merge_from`]
pub const RESERVED_PREFIX: &str = "/";

/// Control-flag tensor registered at construction and re-initialized by
/// [`Workspace::clear`]
pub const FLAG_TENSOR: &str = "flagged/recomp";

const SHARED_BUFFER_PREFIX: &str = "/share/buffer/";

/// Diagnostic snapshot of one owned tensor
#[derive(Debug, Clone, Serialize)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<i64>,
    pub nbytes: usize,
}

/// Sandbox isolating the tensors, caches and scratch pools of one session.
pub struct Workspace {
    name: String,
    tensors: HashMap<String, TensorRef>,
    external: HashMap<String, Weak<Mutex<Tensor>>>,
    aliases: HashMap<String, String>,
    unique_index: HashMap<String, HashMap<String, i64>>,
    units: HashMap<CacheKey, Box<dyn ExecutableUnit>>,
}

impl Workspace {
    /// Create a workspace, registering the empty placeholder tensor and
    /// the control-flag tensor
    pub fn new(name: impl Into<String>) -> ForgeResult<Self> {
        let mut ws = Workspace {
            name: name.into(),
            tensors: HashMap::new(),
            external: HashMap::new(),
            aliases: HashMap::new(),
            unique_index: HashMap::new(),
            units: HashMap::new(),
        };
        ws.create_tensor("");
        ws.reset_flag()?;
        tracing::debug!(workspace = %ws.name, "workspace created");
        Ok(ws)
    }

    fn reset_flag(&mut self) -> ForgeResult<()> {
        let flag = self.create_tensor(FLAG_TENSOR);
        let mut tensor = flag.lock()?;
        tensor.reshape(&[])?;
        let ptr = tensor.mutable_data::<bool>(&DeviceContext::Host)?;
        // SAFETY: scalar bool tensor, freshly materialized
        unsafe { *ptr = false };
        Ok(())
    }

    /// The workspace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a fresh empty tensor, or return the existing one.
    ///
    /// Idempotent by name; aliases and borrowed tensors are consulted
    /// first, so creating an alias target never shadows it.
    pub fn create_tensor(&mut self, name: &str) -> TensorRef {
        if let Some(existing) = self.try_get_tensor(name, true) {
            return existing;
        }
        tracing::trace!(workspace = %self.name, tensor = name, "tensor registered");
        let tensor = Arc::new(Mutex::new(Tensor::with_name(name)));
        self.tensors.insert(name.to_string(), Arc::clone(&tensor));
        tensor
    }

    /// Try to resolve a tensor: alias first (single hop), then the owned
    /// map, then (if `external`) tensors borrowed via merge
    pub fn try_get_tensor(&self, name: &str, external: bool) -> Option<TensorRef> {
        let canonical = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        if let Some(tensor) = self.tensors.get(canonical) {
            return Some(Arc::clone(tensor));
        }
        if external {
            if let Some(weak) = self.external.get(canonical) {
                return weak.upgrade();
            }
        }
        None
    }

    /// Resolve a tensor or fail with the requested name
    pub fn get_tensor(&self, name: &str, external: bool) -> ForgeResult<TensorRef> {
        self.try_get_tensor(name, external)
            .ok_or_else(|| TensorForgeError::TensorNotFound(name.to_string()))
    }

    /// Return whether a tensor resolves
    pub fn has_tensor(&self, name: &str, external: bool) -> bool {
        self.try_get_tensor(name, external).is_some()
    }

    /// Map `alias` to the canonical `target` name (single hop, no chains)
    pub fn set_alias(&mut self, target: &str, alias: &str) {
        self.aliases
            .insert(alias.to_string(), target.to_string());
    }

    /// Names of registered tensors, optionally including borrowed ones
    pub fn tensor_names(&self, external: bool) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        if external {
            names.extend(self.external.keys().cloned());
        }
        names.sort();
        names
    }

    /// Cache keys of the live executable units
    pub fn unit_keys(&self) -> Vec<CacheKey> {
        self.units.keys().cloned().collect()
    }

    /// Return a collision-free name scoped to `(scope, base + suffix)`.
    ///
    /// The counter is monotonically non-decreasing per key; with
    /// `zero_based` the first use omits the counter.
    pub fn unique_name(&mut self, base: &str, suffix: &str, scope: &str, zero_based: bool) -> String {
        let index_map = self.unique_index.entry(scope.to_string()).or_default();
        let required = format!("{}{}", base, suffix);
        let slot = index_map.entry(required.clone()).or_insert(0);
        let index = *slot;
        *slot += 1;
        if index > 0 {
            return format!("{}_{}{}", base, index, suffix);
        }
        if zero_based {
            return required;
        }
        let slot = index_map.entry(required).or_insert(0);
        let next = *slot;
        *slot += 1;
        format!("{}_{}{}", base, next, suffix)
    }

    /// Run an executable unit against this workspace.
    ///
    /// With a cache key the unit is built once via `build`, kept in the
    /// workspace cache, and re-derived from `def` on every call; without
    /// one it is built, run and discarded.
    pub fn run_unit<F>(&mut self, def: &UnitDef, build: F) -> ForgeResult<()>
    where
        F: FnOnce(&UnitDef) -> ForgeResult<Box<dyn ExecutableUnit>>,
    {
        match &def.cache_key {
            None => {
                let mut unit = build(def)?;
                unit.run(self)
            }
            Some(key) => {
                // Take the unit out so it can borrow the workspace while
                // running
                let mut unit = match self.units.remove(key) {
                    Some(unit) => {
                        tracing::trace!(workspace = %self.name, %key, "unit cache hit");
                        unit
                    }
                    None => {
                        tracing::debug!(workspace = %self.name, %key, "unit cache miss, constructing");
                        build(def)?
                    }
                };
                unit.derive_from(def)?;
                let result = unit.run(self);
                self.units.insert(key.clone(), unit);
                result
            }
        }
    }

    /// Re-run an already cached unit; fails if the key was never cached
    /// or was dropped by [`Workspace::clear`]
    pub fn run_cached(&mut self, key: &CacheKey, def: &UnitDef) -> ForgeResult<()> {
        let mut unit = self
            .units
            .remove(key)
            .ok_or_else(|| TensorForgeError::UnitNotFound(key.to_string()))?;
        unit.derive_from(def)?;
        let result = unit.run(self);
        self.units.insert(key.clone(), unit);
        result
    }

    /// Return pointers into consecutive sub-ranges of one pooled scratch
    /// tensor sized to the sum of `segments`.
    ///
    /// The backing tensor lives under a reserved key and is reused across
    /// calls with the same `key`. The caller owns the regions exclusively
    /// for the duration of one kernel invocation.
    pub fn shared_buffer(
        &mut self,
        ctx: &DeviceContext,
        segments: &[usize],
        key: &str,
    ) -> ForgeResult<Vec<*mut u8>> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }
        let total: usize = segments.iter().sum();
        let tensor = self.create_tensor(&format!("{}{}", SHARED_BUFFER_PREFIX, key));
        let mut guard = tensor.lock()?;
        guard.reshape(&[total as i64])?;
        let base = guard.mutable_data::<u8>(ctx)?;
        let mut group = Vec::with_capacity(segments.len());
        let mut offset = 0usize;
        for &segment in segments {
            // SAFETY: offsets stay within the freshly sized backing tensor
            group.push(unsafe { base.add(offset) });
            offset += segment;
        }
        Ok(group)
    }

    /// Import another workspace's non-internal tensors as borrowed
    /// references and merge unique-name counters taking the maximum, so
    /// names generated afterwards collide with neither workspace.
    pub fn merge_from(&mut self, other: &Workspace) {
        for (name, tensor) in &other.tensors {
            if name.is_empty() || name.starts_with(RESERVED_PREFIX) {
                continue;
            }
            self.external.insert(name.clone(), Arc::downgrade(tensor));
        }
        for (scope, index_map) in &other.unique_index {
            let merged = self.unique_index.entry(scope.clone()).or_default();
            for (key, index) in index_map {
                let slot = merged.entry(key.clone()).or_insert(0);
                *slot = (*slot).max(*index);
            }
        }
        tracing::debug!(
            workspace = %self.name,
            donor = %other.name,
            borrowed = self.external.len(),
            "merged workspace resources"
        );
    }

    /// Release the memory of every owned tensor (running external-deleter
    /// hooks) while preserving tensor identities, and drop all cached
    /// units. The control-flag tensor is re-initialized.
    ///
    /// Used between runs to bound peak memory without re-registering
    /// every tensor name.
    pub fn clear(&mut self) -> ForgeResult<()> {
        self.units.clear();
        for tensor in self.tensors.values() {
            tensor.lock()?.reset();
        }
        self.reset_flag()?;
        tracing::debug!(workspace = %self.name, "workspace cleared");
        Ok(())
    }

    /// Diagnostic snapshot of all owned tensors, sorted by name
    pub fn tensor_infos(&self) -> ForgeResult<Vec<TensorInfo>> {
        let mut infos = Vec::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            let guard = tensor.lock()?;
            infos.push(TensorInfo {
                name: name.clone(),
                dims: guard.dims().to_vec(),
                nbytes: guard.nbytes(),
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.name)
            .field("tensors", &self.tensors.len())
            .field("external", &self.external.len())
            .field("units", &self.units.len())
            .finish()
    }
}
