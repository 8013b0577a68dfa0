//! Shape/stride descriptors with lazily materialized memory
//!
//! A `Tensor` is a named shape bound to at most one [`UnifiedMemory`].
//! Reshaping only recomputes metadata; buffers are allocated on the first
//! data access, and a reshape that outgrows the current capacity merely
//! drops the binding so the next access reallocates. This keeps graph
//! construction (which queries shapes long before execution) free of
//! allocations.
//!
//! Reads may synchronize a stale device copy, so even const-typed access
//! takes `&mut self`; handles are shared behind a mutex by the workspace.

use std::sync::{Arc, Mutex};

use crate::device::DeviceContext;
use crate::dtype::{TensorType, TypeMeta};
use crate::error::{ForgeResult, TensorForgeError};
use crate::memory::{MemoryState, UnifiedMemory};

/// Release callback for externally-sourced buffers, run exactly once
pub type ExternalDeleter = Box<dyn FnOnce() + Send>;

/// A named, shaped view over at most one unified buffer.
pub struct Tensor {
    name: String,
    meta: TypeMeta,
    size: usize,
    capacity: usize,
    version: i64,
    dims: Vec<i64>,
    strides: Vec<i64>,
    /// Memory this tensor owns exclusively
    internal: Option<UnifiedMemory>,
    /// Memory borrowed from a workspace pool or another tensor
    external: Option<Arc<Mutex<UnifiedMemory>>>,
    owns_memory: bool,
    external_deleter: Option<ExternalDeleter>,
}

impl Tensor {
    /// Create an empty unnamed tensor
    pub fn new() -> Self {
        Self::with_name(String::new())
    }

    /// Create an empty tensor with the given name
    pub fn with_name(name: impl Into<String>) -> Self {
        Tensor {
            name: name.into(),
            meta: TypeMeta::uninitialized(),
            size: 0,
            capacity: 0,
            version: -1,
            dims: Vec::new(),
            strides: Vec::new(),
            internal: None,
            external: None,
            owns_memory: true,
            external_deleter: None,
        }
    }

    /// The tensor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return whether the tensor name is set
    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }

    /// The tensor version
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Set the tensor version
    pub fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    /// Total number of elements
    pub fn size(&self) -> usize {
        self.size
    }

    /// Memory capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of data bytes for the bound type
    pub fn nbytes(&self) -> usize {
        self.size * self.meta.item_size()
    }

    /// The bound type descriptor
    pub fn meta(&self) -> TypeMeta {
        self.meta
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// The tensor dimensions
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// The row-major strides
    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    /// Return whether the total number of elements is zero
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Return whether any memory is bound
    pub fn has_memory(&self) -> bool {
        if self.owns_memory {
            self.internal.is_some()
        } else {
            self.external.is_some()
        }
    }

    /// Canonicalize an axis, allowing negative indices from the back
    pub fn axis(&self, i: i64) -> ForgeResult<usize> {
        let ndim = self.ndim() as i64;
        if i < -ndim || i >= ndim {
            return Err(TensorForgeError::InvalidShape(format!(
                "tensor '{}' has {} dimensions, axis {} requested",
                self.name, ndim, i
            )));
        }
        Ok(if i < 0 { (i + ndim) as usize } else { i as usize })
    }

    /// Dimension of the given axis
    pub fn dim(&self, i: i64) -> ForgeResult<i64> {
        Ok(self.dims[self.axis(i)?])
    }

    /// Stride of the given axis
    pub fn stride(&self, i: i64) -> ForgeResult<i64> {
        Ok(self.strides[self.axis(i)?])
    }

    /// Number of elements counting along `[start, end)`
    pub fn count_between(&self, start: i64, end: i64) -> ForgeResult<i64> {
        let mut n = 1;
        for i in start..end {
            n *= self.dim(i)?;
        }
        Ok(n)
    }

    /// Format dimensions as `(2,3)` for diagnostics
    pub fn dim_string(&self) -> String {
        if self.dims.is_empty() {
            return "(0,)".to_string();
        }
        let parts: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        if parts.len() == 1 {
            format!("({},)", parts[0])
        } else {
            format!("({})", parts.join(","))
        }
    }

    /// Change the tensor dimensions, recomputing size and strides.
    ///
    /// If the new byte footprint exceeds the current capacity, the memory
    /// binding is dropped; allocation is deferred to the next data access.
    /// An equal footprint under different dims never reallocates.
    pub fn reshape(&mut self, dims: &[i64]) -> ForgeResult<&mut Self> {
        let mut strides = vec![0i64; dims.len()];
        let mut new_size: usize = 1;
        for i in (0..dims.len()).rev() {
            let d = dims[i];
            if d < 0 {
                return Err(TensorForgeError::InvalidShape(format!(
                    "tensor '{}': negative dimension {} at axis {}",
                    self.name, d, i
                )));
            }
            strides[i] = new_size as i64;
            new_size *= d as usize;
        }
        if self.capacity < new_size * self.meta.item_size() {
            tracing::trace!(
                tensor = %self.name,
                required = new_size * self.meta.item_size(),
                capacity = self.capacity,
                "reshape outgrew capacity, dropping memory binding"
            );
            self.external = None;
            self.owns_memory = true;
            self.release_memory();
            self.capacity = 0;
        }
        self.dims = dims.to_vec();
        self.strides = strides;
        self.size = new_size;
        Ok(self)
    }

    /// Change the tensor dimensions to match another tensor
    pub fn reshape_like(&mut self, other: &Tensor) -> ForgeResult<&mut Self> {
        let dims = other.dims.clone();
        self.reshape(&dims)
    }

    /// Current synchronization state of the bound memory
    pub fn memory_state(&self) -> ForgeResult<MemoryState> {
        if self.owns_memory {
            self.internal
                .as_ref()
                .map(|m| m.state())
                .ok_or_else(|| TensorForgeError::MemoryNotSet(self.name.clone()))
        } else {
            let mem = self
                .external
                .as_ref()
                .ok_or_else(|| TensorForgeError::MemoryNotSet(self.name.clone()))?;
            Ok(mem.lock()?.state())
        }
    }

    fn with_memory_mut<R>(
        &mut self,
        f: impl FnOnce(&mut UnifiedMemory) -> ForgeResult<R>,
    ) -> ForgeResult<Option<R>> {
        if self.owns_memory {
            match self.internal.as_mut() {
                Some(mem) => f(mem).map(Some),
                None => Ok(None),
            }
        } else {
            match self.external.as_ref() {
                Some(mem) => {
                    let mut guard = mem.lock()?;
                    f(&mut guard).map(Some)
                }
                None => Ok(None),
            }
        }
    }

    /// Raw pointer for the context, materializing and marking dirty if a
    /// memory binding exists; `None` when no memory is bound.
    fn mutable_data_ptr(&mut self, ctx: &DeviceContext) -> ForgeResult<Option<*mut u8>> {
        let kind = ctx.kind();
        self.with_memory_mut(|mem| {
            let ptr = mem.ensure(ctx)?;
            mem.mark_dirty(kind);
            Ok(ptr)
        })
    }

    /// Raw mutable data pointer, creating memory with the given meta if
    /// none is bound (or the bound meta differs). Fresh allocations run
    /// the meta's constructor hook. Implies a dirty mark for the context's
    /// device kind.
    pub fn raw_mutable_data(
        &mut self,
        ctx: &DeviceContext,
        meta: TypeMeta,
    ) -> ForgeResult<*mut u8> {
        if self.meta == meta {
            if let Some(ptr) = self.mutable_data_ptr(ctx)? {
                return Ok(ptr);
            }
        }
        if meta.is_uninitialized() {
            return Err(TensorForgeError::UntypedAccess(self.name.clone()));
        }
        if self.size == 0 {
            return Err(TensorForgeError::InvalidShape(format!(
                "tensor '{}' with shape {} cannot be materialized",
                self.name,
                self.dim_string()
            )));
        }
        self.external = None;
        self.owns_memory = true;
        self.release_memory();
        self.meta = meta;
        self.capacity = self.size * meta.item_size();
        tracing::debug!(
            tensor = %self.name,
            nbytes = self.capacity,
            dtype = meta.name(),
            "binding fresh memory"
        );
        self.internal = Some(UnifiedMemory::new(self.capacity));
        let ptr = self.mutable_data_ptr(ctx)?.ok_or_else(|| {
            TensorForgeError::Internal(format!(
                "tensor '{}': freshly bound memory vanished",
                self.name
            ))
        })?;
        if let Some(ctor) = meta.ctor() {
            // Hooks assume host-addressable memory, which holds for the
            // built-in backends
            ctor(ptr, self.size);
        }
        Ok(ptr)
    }

    /// Typed mutable data pointer.
    ///
    /// Reinterprets in place when the requested type differs but fits the
    /// existing capacity; reallocates otherwise.
    pub fn mutable_data<T: TensorType>(&mut self, ctx: &DeviceContext) -> ForgeResult<*mut T> {
        let meta = TypeMeta::make::<T>();
        if let Some(ptr) = self.mutable_data_ptr(ctx)? {
            if self.meta == meta {
                return Ok(ptr as *mut T);
            }
            if self.capacity >= self.size * meta.item_size() {
                tracing::trace!(
                    tensor = %self.name,
                    from = self.meta.name(),
                    to = meta.name(),
                    "in-place dtype reinterpretation"
                );
                self.meta = meta;
                return Ok(ptr as *mut T);
            }
        }
        Ok(self.raw_mutable_data(ctx, meta)? as *mut T)
    }

    /// Raw const data pointer; fails if no memory is bound
    pub fn raw_data(&mut self, ctx: &DeviceContext) -> ForgeResult<*const u8> {
        let ptr = self.with_memory_mut(|mem| mem.ensure(ctx))?;
        ptr.map(|p| p as *const u8)
            .ok_or_else(|| TensorForgeError::MemoryNotSet(self.name.clone()))
    }

    /// Typed const data pointer; the bound type must match exactly
    pub fn data<T: TensorType>(&mut self, ctx: &DeviceContext) -> ForgeResult<*const T> {
        if self.meta.is_uninitialized() {
            return Err(TensorForgeError::UntypedAccess(self.name.clone()));
        }
        let requested = TypeMeta::make::<T>();
        if self.meta != requested {
            return Err(TensorForgeError::TypeMismatch {
                tensor: self.name.clone(),
                expected: self.meta.name(),
                requested: requested.name(),
            });
        }
        Ok(self.raw_data(ctx)? as *const T)
    }

    /// Copy memory from another tensor on the given context.
    ///
    /// Element counts must match; the destination adopts the source's
    /// type. A copy between views of the same physical region is a no-op.
    pub fn copy_from(&mut self, other: &mut Tensor, ctx: &DeviceContext) -> ForgeResult<&mut Self> {
        if self.size != other.size {
            return Err(TensorForgeError::SizeMismatch {
                tensor: self.name.clone(),
                expected: other.size,
                actual: self.size,
            });
        }
        let src_meta = other.meta;
        if src_meta.is_uninitialized() {
            return Err(TensorForgeError::UntypedAccess(other.name.clone()));
        }
        let src = other.raw_data(ctx)?;
        let dst = self.raw_mutable_data(ctx, src_meta)?;
        if dst as *const u8 == src {
            return Ok(self);
        }
        let nbytes = self.nbytes();
        match ctx {
            DeviceContext::Host => {
                // SAFETY: both regions hold nbytes and are distinct
                unsafe { std::ptr::copy_nonoverlapping(src, dst, nbytes) };
            }
            DeviceContext::Accelerator(alloc) => {
                let src = std::ptr::NonNull::new(src as *mut u8).ok_or_else(|| {
                    TensorForgeError::MemoryNotSet(other.name.clone())
                })?;
                let dst = std::ptr::NonNull::new(dst)
                    .ok_or_else(|| TensorForgeError::MemoryNotSet(self.name.clone()))?;
                alloc.copy_device_to_device(src, dst, nbytes)?;
            }
        }
        Ok(self)
    }

    /// Copy host values in, reshaping to a vector of their length
    pub fn copy_from_slice<T: TensorType>(&mut self, values: &[T]) -> ForgeResult<&mut Self> {
        if values.is_empty() {
            return Ok(self);
        }
        self.reshape(&[values.len() as i64])?;
        let dst = self.mutable_data::<T>(&DeviceContext::Host)?;
        // SAFETY: just reshaped to values.len() elements of T
        unsafe { std::ptr::copy_nonoverlapping(values.as_ptr(), dst, values.len()) };
        Ok(self)
    }

    /// Copy the host-resident value out into a vector
    pub fn copy_to_vec<T: TensorType>(&mut self) -> ForgeResult<Vec<T>> {
        let src = self.data::<T>(&DeviceContext::Host)?;
        let mut out = Vec::with_capacity(self.size);
        // SAFETY: the buffer holds self.size elements of T
        unsafe {
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), self.size);
            out.set_len(self.size);
        }
        Ok(out)
    }

    /// Rebind to an externally pooled memory (borrowed, not owned), or
    /// with `None` revert to owning the previously held memory.
    pub fn share(&mut self, memory: Option<Arc<Mutex<UnifiedMemory>>>) -> ForgeResult<()> {
        match memory {
            Some(mem) => {
                let available = mem.lock()?.size();
                if available < self.nbytes() {
                    return Err(TensorForgeError::CapacityExceeded {
                        required: self.nbytes(),
                        available,
                    });
                }
                // Own memory is kept aside so share(None) can revert to it
                self.capacity = available;
                self.external = Some(mem);
                self.owns_memory = false;
            }
            None => {
                let own = self.internal.as_ref().map(|m| m.size()).unwrap_or(0);
                if own < self.nbytes() {
                    // The shape grew while borrowed; the retained memory
                    // no longer fits, so drop it and let the next access
                    // reallocate.
                    self.internal = None;
                    self.capacity = 0;
                } else {
                    self.capacity = own;
                }
                self.external = None;
                self.owns_memory = true;
            }
        }
        Ok(())
    }

    /// Register a release callback for an externally-sourced buffer.
    ///
    /// Runs exactly once, on reset, workspace clear, or drop, whichever
    /// comes first.
    pub fn set_external_deleter(&mut self, deleter: ExternalDeleter) {
        self.external_deleter = Some(deleter);
    }

    /// Release all resources while preserving the tensor's identity.
    ///
    /// Prior handles stay valid but observe an empty tensor.
    pub fn reset(&mut self) {
        self.dims.clear();
        self.strides.clear();
        self.release_memory();
        self.meta = TypeMeta::uninitialized();
        self.size = 0;
        self.capacity = 0;
        self.owns_memory = true;
        self.external = None;
        if let Some(deleter) = self.external_deleter.take() {
            deleter();
        }
    }

    fn release_memory(&mut self) {
        if let Some(dtor) = self.meta.dtor() {
            if let Some(mem) = self.internal.as_ref() {
                if let Some(ptr) = mem.valid_host_ptr() {
                    dtor(ptr.as_ptr(), self.size);
                }
            }
        }
        self.internal = None;
    }
}

impl Default for Tensor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        if let Some(deleter) = self.external_deleter.take() {
            deleter();
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("dims", &self.dims)
            .field("dtype", &self.meta.name())
            .field("capacity", &self.capacity)
            .field("owns_memory", &self.owns_memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::TypeMeta;

    #[test]
    fn test_reshape_metadata() {
        let mut t = Tensor::with_name("x");
        t.reshape(&[2, 3, 4]).expect("reshape");
        assert_eq!(t.size(), 24);
        assert_eq!(t.dims(), &[2, 3, 4]);
        assert_eq!(t.strides(), &[12, 4, 1]);
        assert_eq!(t.dim(-1).expect("axis"), 4);
        assert_eq!(t.stride(-3).expect("axis"), 12);
        assert_eq!(t.count_between(1, 3).expect("count"), 12);
    }

    #[test]
    fn test_negative_dimension_rejected() {
        let mut t = Tensor::new();
        let err = t.reshape(&[2, -1]).unwrap_err();
        assert!(matches!(err, TensorForgeError::InvalidShape(_)));
    }

    #[test]
    fn test_scalar_shape() {
        let mut t = Tensor::new();
        t.reshape(&[]).expect("reshape");
        assert_eq!(t.size(), 1);
        assert_eq!(t.ndim(), 0);
        assert_eq!(t.dim_string(), "(0,)");
    }

    #[test]
    fn test_dim_string() {
        let mut t = Tensor::new();
        t.reshape(&[5]).expect("reshape");
        assert_eq!(t.dim_string(), "(5,)");
        t.reshape(&[2, 3]).expect("reshape");
        assert_eq!(t.dim_string(), "(2,3)");
    }

    #[test]
    fn test_zero_size_materialization_fails() {
        let mut t = Tensor::with_name("z");
        t.reshape(&[0, 5]).expect("reshape");
        assert_eq!(t.size(), 0);
        assert!(t.is_empty());
        let err = t.mutable_data::<f32>(&DeviceContext::Host).unwrap_err();
        assert!(matches!(err, TensorForgeError::InvalidShape(_)));
    }

    #[test]
    fn test_untyped_raw_access_fails() {
        let mut t = Tensor::with_name("u");
        t.reshape(&[4]).expect("reshape");
        let err = t
            .raw_mutable_data(&DeviceContext::Host, TypeMeta::uninitialized())
            .unwrap_err();
        assert!(matches!(err, TensorForgeError::UntypedAccess(_)));
        let err = t.data::<f32>(&DeviceContext::Host).unwrap_err();
        assert!(matches!(err, TensorForgeError::UntypedAccess(_)));
    }

    #[test]
    fn test_ctor_hook_runs_on_fresh_allocation() {
        let mut t = Tensor::with_name("c");
        t.reshape(&[8]).expect("reshape");
        let meta = TypeMeta::make_with_hooks::<i32>(None);
        let ptr = t
            .raw_mutable_data(&DeviceContext::Host, meta)
            .expect("materialize") as *const i32;
        let data = unsafe { std::slice::from_raw_parts(ptr, 8) };
        assert_eq!(data, &[0i32; 8]);
    }

    #[test]
    fn test_version_defaults_negative() {
        let mut t = Tensor::new();
        assert_eq!(t.version(), -1);
        t.set_version(3);
        assert_eq!(t.version(), 3);
    }
}
