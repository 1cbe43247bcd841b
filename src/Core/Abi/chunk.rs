use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use super::layout::{ChunkHeader, Packets, CHUNK_HEADER_SIZE};

/// Exclusive handle to one chunk of the shared memory buffer.
///
/// A `Chunk` is handed out by `SharedMemoryAbi::try_acquire_chunk_for_writing`
/// (or `..._for_reading`) and is consumed by `release_chunk_as_complete` /
/// `release_chunk_as_free`. It is deliberately neither `Clone` nor `Copy`.
pub struct Chunk {
    begin: NonNull<u8>,
    size: usize,
    chunk_idx: u8,
}

// The handle is a capability to a region of a mapping that outlives it.
unsafe impl Send for Chunk {}

impl Chunk {
    /// # Safety
    /// `begin` must point to `size` bytes inside a live mapping, 4-byte
    /// aligned, and the caller must own the chunk's current state.
    pub(crate) unsafe fn new(begin: *mut u8, size: usize, chunk_idx: u8) -> Chunk {
        debug_assert!(size > CHUNK_HEADER_SIZE);
        debug_assert_eq!(begin as usize % 4, 0);
        Chunk {
            begin: NonNull::new_unchecked(begin),
            size,
            chunk_idx,
        }
    }

    pub fn begin(&self) -> *mut u8 {
        self.begin.as_ptr()
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.begin.as_ptr().add(self.size) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn chunk_idx(&self) -> u8 {
        self.chunk_idx
    }

    pub fn payload_begin(&self) -> *mut u8 {
        unsafe { self.begin.as_ptr().add(CHUNK_HEADER_SIZE) }
    }

    pub fn payload_size(&self) -> usize {
        self.size - CHUNK_HEADER_SIZE
    }

    pub fn header(&self) -> &ChunkHeader {
        unsafe { &*(self.begin.as_ptr() as *const ChunkHeader) }
    }

    pub fn writer_id(&self) -> u16 {
        self.header().writer_id.load(Ordering::Relaxed)
    }

    pub fn chunk_id(&self) -> u32 {
        self.header().chunk_id.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> Packets {
        Packets::from_raw(self.header().packets.load(Ordering::Acquire))
    }

    /// Bumps the packet count and returns the new value.
    pub fn increment_packet_count(&mut self) -> u16 {
        let mut packets = self.packets();
        debug_assert!(packets.count < Packets::MAX_COUNT);
        packets.count += 1;
        self.header().packets.store(packets.to_raw(), Ordering::Release);
        packets.count
    }

    pub fn set_flag(&mut self, flag: u8) {
        let mut packets = self.packets();
        packets.flags |= flag;
        self.header().packets.store(packets.to_raw(), Ordering::Release);
    }

    pub fn clear_needs_patching_flag(&mut self) {
        let mut packets = self.packets();
        packets.flags &= !Packets::CHUNK_NEEDS_PATCHING;
        self.header().packets.store(packets.to_raw(), Ordering::Release);
    }

    /// Whole chunk, header included.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.begin.as_ptr(), self.size) }
    }

    pub fn payload(&self) -> &[u8] {
        &self.as_slice()[CHUNK_HEADER_SIZE..]
    }
}
