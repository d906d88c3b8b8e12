//! Config store implementations
//!
//! - [`MemoryConfigStore`]: In-memory store mirroring config into state

pub mod memory;

pub use memory::MemoryConfigStore;
