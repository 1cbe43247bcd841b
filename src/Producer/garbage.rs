use std::cell::UnsafeCell;

use lazy_static::lazy_static;

use crate::Proto::scattered_stream_writer::ContiguousMemoryRange;

pub const GARBAGE_CHUNK_SIZE: usize = 1024;

/// Sink for packets written while a writer has no chunk. Shared by every
/// writer in the process and never read, so concurrent writes only ever
/// produce bytes nobody looks at.
pub struct GarbageChunk {
    bytes: UnsafeCell<[u8; GARBAGE_CHUNK_SIZE]>,
}

// Write-only memory: no reader can observe a torn value.
unsafe impl Sync for GarbageChunk {}

lazy_static! {
    static ref GARBAGE_CHUNK: GarbageChunk = GarbageChunk {
        bytes: UnsafeCell::new([0u8; GARBAGE_CHUNK_SIZE]),
    };
}

pub fn garbage_chunk_range() -> ContiguousMemoryRange {
    let begin = GARBAGE_CHUNK.bytes.get() as *mut u8;
    ContiguousMemoryRange {
        begin,
        end: unsafe { begin.add(GARBAGE_CHUNK_SIZE) },
    }
}
