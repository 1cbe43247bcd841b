pub mod Abi;
pub mod SharedMemory;
pub mod alloc;

pub use SharedMemory::{
    attach_shared_memory, create_shared_memory, HeapSharedMemory, RawHandle, SharedMemoryBackend,
};
