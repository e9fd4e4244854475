//! Built-in adapter implementations.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlAdapter;
pub use memory::MemoryAdapter;
