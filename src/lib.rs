//! TensorForge - tensor/memory/workspace runtime
//!
//! The subsystem underneath a tensor-computation engine that decides how
//! multi-dimensional arrays are shaped, where their bytes live (host or
//! accelerator memory), when buffers are allocated or reused, and how a
//! computation session tracks, names and garbage-collects the tensors,
//! scratch buffers and cached executable units it owns.
//!
//! Numeric kernels, graph scheduling and device-driver bindings live in
//! other crates; they consume the typed pointers, shape metadata and
//! workspace registry exposed here.

pub mod device;
pub mod dtype;
pub mod error;
pub mod logging;
pub mod memory;
pub mod tensor;
pub mod workspace;

pub use device::{DeviceAllocator, DeviceContext, DeviceKind, EmulatedDevice};
pub use dtype::{TensorType, TypeMeta};
pub use error::{ErrorCategory, ForgeResult, TensorForgeError};
pub use logging::{init_logging_default, init_with_config, LoggingConfig};
pub use memory::{MemoryState, UnifiedMemory};
pub use tensor::Tensor;
pub use workspace::{CacheKey, ExecutableUnit, TensorInfo, TensorRef, UnitDef, Workspace};

#[cfg(test)]
mod library_tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        // Basic smoke test to ensure all re-exports resolve
        let _ = DeviceKind::Host;
        let _ = TypeMeta::uninitialized();
    }
}
