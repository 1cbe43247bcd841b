// Module naming follows project convention (Abi = shared memory layout shared with the service)
#![allow(non_snake_case)]

pub mod Core;
pub mod Debug;
pub mod Producer;
pub mod Proto;
pub mod error;
pub mod testing;

pub use error::{Error, Result};
pub use Core::Abi::{Chunk, ChunkState, PageLayout, Packets, SharedMemoryAbi, ShmemMode}; // re-export for stable path
pub use Core::SharedMemory::{attach_shared_memory, create_shared_memory, HeapSharedMemory, SharedMemoryBackend};
pub use Producer::{
    ArbiterBuilder, ArbiterConfig, BufferExhaustedPolicy, BufferId, CommitDataRequest, FlushCallback,
    NullTraceWriter, ProducerEndpoint, SharedMemoryArbiter, StallConfig, TaskRunner, ThreadTaskRunner,
    TracePacket, TraceWriter, WriterId,
};
