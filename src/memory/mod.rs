//! Buffer abstractions shared by tensors and workspaces

mod unified;

pub use unified::{MemoryState, UnifiedMemory};
