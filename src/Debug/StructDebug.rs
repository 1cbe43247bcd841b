use std::fmt;

use crate::Core::Abi::chunk::Chunk;
use crate::Core::Abi::SharedMemoryAbi;
use crate::Producer::shared_memory_arbiter::SharedMemoryArbiter;
use crate::Producer::trace_writer::{TraceWriter, TraceWriterImpl};

/// Debug function for IdAllocator
///
/// Shows the id range and how many ids are handed out, not the bitset.
pub fn debug_id_allocator(max_id: u32, last_id: u32, allocated: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IdAllocator")
        .field("max_id", &max_id)
        .field("last_id", &last_id)
        .field("allocated", &allocated)
        .finish()
}

/// Debug function for SharedMemoryAbi
///
/// Geometry only; page headers are not walked.
pub fn debug_shared_memory_abi(abi: &SharedMemoryAbi, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedMemoryAbi")
        .field("start", &format_args!("{:p}", abi.start()))
        .field("size", &abi.size())
        .field("page_size", &abi.page_size())
        .field("num_pages", &abi.num_pages())
        .field("shmem_mode", &abi.shmem_mode())
        .finish()
}

/// Debug function for Chunk
///
/// Reads the header through its atomics, never the payload.
pub fn debug_chunk(chunk: &Chunk, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Chunk")
        .field("begin", &format_args!("{:p}", chunk.begin()))
        .field("size", &chunk.size())
        .field("chunk_idx", &chunk.chunk_idx())
        .field("writer_id", &chunk.writer_id())
        .field("chunk_id", &chunk.chunk_id())
        .field("packets", &chunk.packets())
        .finish()
}

pub fn debug_shared_memory_arbiter(arbiter: &SharedMemoryArbiter, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = arbiter.lock_state();
    f.debug_struct("SharedMemoryArbiter")
        .field("abi", arbiter.abi())
        .field("page_layout", &arbiter.page_layout())
        .field("fully_bound", &state.fully_bound)
        .field("was_always_bound", &state.was_always_bound)
        .field("active_writer_ids", &state.active_writer_ids)
        .field("pending_writers", &state.pending_writers.len())
        .field("bytes_pending_commit", &state.bytes_pending_commit)
        .field("direct_patching_enabled", &state.direct_patching_enabled)
        .field("did_shutdown", &state.did_shutdown)
        .finish_non_exhaustive()
}

pub fn debug_trace_writer(writer: &TraceWriterImpl, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TraceWriterImpl")
        .field("writer_id", &writer.writer_id())
        .field("target_buffer", &format_args!("{:#x}", writer.target_buffer()))
        .field("written", &writer.written())
        .field("drop_count", &writer.drop_count())
        .field("dropping", &writer.is_dropping())
        .field("pending_patches", &writer.pending_patches())
        .finish_non_exhaustive()
}
