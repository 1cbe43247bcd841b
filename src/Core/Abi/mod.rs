pub mod Abi;
pub mod Abi_impl;
pub mod chunk;
mod debug;
pub mod layout;

pub use chunk::Chunk;
pub use layout::{ChunkHeader, ChunkHeaderInit, ChunkState, PageHeader, PageLayout, Packets};
pub use Abi::{AbiStats, SharedMemoryAbi, ShmemMode};
