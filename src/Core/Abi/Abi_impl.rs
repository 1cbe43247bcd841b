use std::ptr::NonNull;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crossbeam_utils::Backoff;

use super::chunk::Chunk;
use super::layout::{
    chunk_size_for_layout, ChunkHeaderInit, ChunkState, PageHeader, PageLayout, ALL_CHUNKS_MASK,
    CHUNK_STATE_BITS, CHUNK_STATE_MASK, LAYOUT_SHIFT, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use super::Abi::{layout_from_header_bitmap, AbiStats, SharedMemoryAbi, ShmemMode};
use crate::error::{Error, Result};
use crate::Core::SharedMemory::SHARED_MEMORY_ALIGNMENT;

impl SharedMemoryAbi {
    /// Create an ABI view over an existing memory region.
    ///
    /// # Safety
    /// `start` must point to `size` bytes that stay mapped for the lifetime of
    /// the view and are only mutated through this ABI (by any process).
    pub unsafe fn new(start: *mut u8, size: usize, page_size: usize, shmem_mode: ShmemMode) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE || page_size % MIN_PAGE_SIZE != 0 || page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidPageSize(page_size));
        }
        if size == 0 || size % page_size != 0 {
            return Err(Error::InvalidGeometry { size, page_size });
        }
        let start = NonNull::new(start).ok_or(Error::InvalidGeometry { size, page_size })?;
        if start.as_ptr() as usize % SHARED_MEMORY_ALIGNMENT != 0 {
            return Err(Error::Misaligned(start.as_ptr() as usize));
        }

        let mut chunk_sizes = [0u16; 8];
        for layout in PageLayout::ALL {
            // Bounded by MAX_PAGE_SIZE - 8, fits u16.
            chunk_sizes[layout as usize] = chunk_size_for_layout(page_size, layout) as u16;
        }

        Ok(Self {
            start,
            size,
            page_size,
            num_pages: size / page_size,
            chunk_sizes,
            shmem_mode,
        })
    }

    #[inline]
    pub fn start(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn shmem_mode(&self) -> ShmemMode {
        self.shmem_mode
    }

    pub fn chunk_size_for_layout(&self, layout: PageLayout) -> usize {
        self.chunk_sizes[layout as usize] as usize
    }

    #[inline]
    pub fn page_start(&self, page_idx: usize) -> *mut u8 {
        assert!(page_idx < self.num_pages, "page index {} out of range", page_idx);
        unsafe { self.start.as_ptr().add(page_idx * self.page_size) }
    }

    #[inline]
    pub fn page_header(&self, page_idx: usize) -> &PageHeader {
        unsafe { &*(self.page_start(page_idx) as *const PageHeader) }
    }

    pub fn get_page_header_bitmap(&self, page_idx: usize) -> u32 {
        self.page_header(page_idx).header_bitmap.load(Acquire)
    }

    pub fn is_page_free(&self, page_idx: usize) -> bool {
        self.get_page_header_bitmap(page_idx) == 0
    }

    /// True if the page is partitioned and every chunk is Complete.
    pub fn is_page_complete(&self, page_idx: usize) -> bool {
        let bitmap = self.get_page_header_bitmap(page_idx);
        let num_chunks = Self::num_chunks_from_header_bitmap(bitmap);
        num_chunks > 0
            && (0..num_chunks)
                .all(|idx| Self::chunk_state_from_header_bitmap(bitmap, idx) == ChunkState::Complete)
    }

    pub fn get_page_layout(&self, page_idx: usize) -> PageLayout {
        layout_from_header_bitmap(self.get_page_header_bitmap(page_idx))
    }

    pub fn get_chunk_state(&self, page_idx: usize, chunk_idx: usize) -> ChunkState {
        Self::chunk_state_from_header_bitmap(self.get_page_header_bitmap(page_idx), chunk_idx)
    }

    pub fn chunk_state_from_header_bitmap(bitmap: u32, chunk_idx: usize) -> ChunkState {
        ChunkState::from_bits(bitmap >> (chunk_idx as u32 * CHUNK_STATE_BITS))
    }

    pub fn num_chunks_from_header_bitmap(bitmap: u32) -> usize {
        layout_from_header_bitmap(bitmap).num_chunks()
    }

    /// Claims a free page by stamping `layout` into its header. Returns false if
    /// the page was not free (another thread partitioned it first).
    pub fn try_partition_page(&self, page_idx: usize, layout: PageLayout) -> bool {
        debug_assert!(layout.num_chunks() > 0, "cannot partition with {:?}", layout);
        let expected = 0u32;
        let desired = (layout as u32) << LAYOUT_SHIFT;
        self.page_header(page_idx)
            .header_bitmap
            .compare_exchange(expected, desired, AcqRel, Relaxed)
            .is_ok()
    }

    /// Bitmap with bit `i` set when chunk `i` of the page is Free.
    pub fn get_free_chunks(&self, page_idx: usize) -> u32 {
        let bitmap = self.get_page_header_bitmap(page_idx);
        let num_chunks = Self::num_chunks_from_header_bitmap(bitmap);
        let mut free_chunks = 0u32;
        for idx in 0..num_chunks {
            if Self::chunk_state_from_header_bitmap(bitmap, idx) == ChunkState::Free {
                free_chunks |= 1 << idx;
            }
        }
        free_chunks
    }

    /// Free -> BeingWritten. Stamps `header` into the chunk on success.
    pub fn try_acquire_chunk_for_writing(
        &self,
        page_idx: usize,
        chunk_idx: usize,
        header: &ChunkHeaderInit,
    ) -> Option<Chunk> {
        self.try_acquire_chunk(page_idx, chunk_idx, ChunkState::Free, ChunkState::BeingWritten, Some(header))
    }

    /// Complete -> BeingRead. Used by the service side.
    pub fn try_acquire_chunk_for_reading(&self, page_idx: usize, chunk_idx: usize) -> Option<Chunk> {
        self.try_acquire_chunk(page_idx, chunk_idx, ChunkState::Complete, ChunkState::BeingRead, None)
    }

    fn try_acquire_chunk(
        &self,
        page_idx: usize,
        chunk_idx: usize,
        expected: ChunkState,
        desired: ChunkState,
        header: Option<&ChunkHeaderInit>,
    ) -> Option<Chunk> {
        let phdr = self.page_header(page_idx);
        let bitmap = phdr.header_bitmap.load(Acquire);
        let num_chunks = Self::num_chunks_from_header_bitmap(bitmap);

        // The page might have been de-partitioned or re-partitioned meanwhile.
        if chunk_idx >= num_chunks {
            return None;
        }
        if Self::chunk_state_from_header_bitmap(bitmap, chunk_idx) != expected {
            return None;
        }

        let shift = chunk_idx as u32 * CHUNK_STATE_BITS;
        let next = (bitmap & !(CHUNK_STATE_MASK << shift)) | ((desired as u32) << shift);
        if phdr.header_bitmap.compare_exchange(bitmap, next, AcqRel, Relaxed).is_err() {
            return None;
        }

        let chunk = unsafe { self.get_chunk_unchecked(page_idx, bitmap, chunk_idx) };
        if let Some(header) = header {
            let chdr = chunk.header();
            chdr.writer_id.store(header.writer_id, Relaxed);
            chdr.chunk_id.store(header.chunk_id, Relaxed);
            chdr.packets.store(header.packets.to_raw(), Release);
        }
        Some(chunk)
    }

    /// Builds a handle for a chunk without touching its state.
    ///
    /// # Safety
    /// The caller must already own the chunk (e.g. it is BeingWritten by a
    /// writer that handed it back while it still needs patching) and must not
    /// let two handles to it be released.
    pub unsafe fn get_chunk_unchecked(&self, page_idx: usize, header_bitmap: u32, chunk_idx: usize) -> Chunk {
        let layout = layout_from_header_bitmap(header_bitmap);
        debug_assert!(chunk_idx < layout.num_chunks());
        let chunk_size = self.chunk_size_for_layout(layout);
        let offset = std::mem::size_of::<PageHeader>() + chunk_idx * chunk_size;
        Chunk::new(self.page_start(page_idx).add(offset), chunk_size, chunk_idx as u8)
    }

    /// BeingWritten -> Complete. Returns the page index of the chunk.
    pub fn release_chunk_as_complete(&self, chunk: Chunk) -> usize {
        self.release_chunk(chunk, ChunkState::Complete)
    }

    /// BeingRead -> Free (or Complete -> Free in emulation mode). Returns the
    /// page index of the chunk.
    pub fn release_chunk_as_free(&self, chunk: Chunk) -> usize {
        self.release_chunk(chunk, ChunkState::Free)
    }

    fn release_chunk(&self, chunk: Chunk, desired: ChunkState) -> usize {
        let (page_idx, chunk_idx) = self.get_page_and_chunk_index(&chunk);
        let shift = chunk_idx as u32 * CHUNK_STATE_BITS;
        let phdr = self.page_header(page_idx);
        let backoff = Backoff::new();

        loop {
            let bitmap = phdr.header_bitmap.load(Acquire);
            let state = Self::chunk_state_from_header_bitmap(bitmap, chunk_idx);
            let valid = match desired {
                ChunkState::Complete => state == ChunkState::BeingWritten,
                ChunkState::Free => {
                    state == ChunkState::BeingRead
                        || (self.shmem_mode == ShmemMode::Emulation && state == ChunkState::Complete)
                }
                _ => false,
            };
            assert!(
                valid,
                "chunk {}:{} in unexpected state {:?} when releasing as {:?}",
                page_idx, chunk_idx, state, desired
            );

            let mut next = (bitmap & !(CHUNK_STATE_MASK << shift)) | ((desired as u32) << shift);
            if desired == ChunkState::Free && next & ALL_CHUNKS_MASK == 0 {
                // Last chunk freed, the page becomes unpartitioned.
                next = 0;
            }
            if phdr.header_bitmap.compare_exchange_weak(bitmap, next, AcqRel, Relaxed).is_ok() {
                return page_idx;
            }
            backoff.spin();
        }
    }

    /// Locates a chunk handle in the buffer.
    pub fn get_page_and_chunk_index(&self, chunk: &Chunk) -> (usize, usize) {
        let begin = chunk.begin() as usize;
        let start = self.start.as_ptr() as usize;
        assert!(
            begin >= start && begin < start + self.size,
            "chunk outside of the shared memory buffer"
        );
        ((begin - start) / self.page_size, chunk.chunk_idx() as usize)
    }

    /// Counts chunk and page states across the buffer.
    pub fn get_stats(&self) -> AbiStats {
        let mut stats = AbiStats::default();
        for page_idx in 0..self.num_pages {
            let bitmap = self.get_page_header_bitmap(page_idx);
            if bitmap == 0 {
                stats.pages_free += 1;
                continue;
            }
            let layout = layout_from_header_bitmap(bitmap);
            if matches!(
                layout,
                PageLayout::NotPartitioned | PageLayout::Reserved1 | PageLayout::Reserved2
            ) {
                stats.pages_unexpected += 1;
                continue;
            }
            for idx in 0..layout.num_chunks() {
                match Self::chunk_state_from_header_bitmap(bitmap, idx) {
                    ChunkState::Free => stats.chunks_free += 1,
                    ChunkState::BeingWritten => stats.chunks_being_written += 1,
                    ChunkState::BeingRead => stats.chunks_being_read += 1,
                    ChunkState::Complete => stats.chunks_complete += 1,
                }
            }
        }
        stats
    }
}
