//! # knight-core
//!
//! Memory management primitives for a JIT compiler runtime:
//!
//! - [`page`]: recycling source of OS pages,
//! - [`lump`]: bump arena reclaimed only in bulk,
//! - [`code_cache`]: small blocks of executable memory with reuse,
//! - [`hash_table`]: chained hash table drawing nodes from a pluggable
//!   allocator.
//!
//! Every allocator is an explicit single-threaded object; wrap one in
//! [`Serialized`] to share it. Unsafe code is confined to the modules that
//! touch raw memory.

#![deny(unsafe_code)]

pub mod code_cache;
pub mod config;
pub mod error;
pub mod hash_table;
pub mod lifecycle;
pub mod lump;
pub mod node_alloc;
pub mod page;
pub mod platform;
pub mod sync;

pub use code_cache::{CodeBlock, CodeCache, CodeCacheStats, RegionId, RegionInfo, RegionList};
pub use config::KnightConfig;
pub use error::{KnightError, Result};
pub use hash_table::{ByRef, HashTable, hash_address, hash_str, strings_equal};
pub use lifecycle::{LifecycleLevel, LifecycleLog, LifecycleRecord};
pub use lump::LumpAllocator;
pub use node_alloc::{NodeAllocator, SystemAllocator};
pub use page::{Page, PageAllocator};
pub use platform::{Mapping, MemoryInfo, Protection};
pub use sync::Serialized;
