// Page and chunk bookkeeping for the shared memory buffer (SMB).
// The buffer is an array of equal pages; each page header carries the page
// layout plus the state of every chunk, and is the only synchronization point
// between producers and the service.

use std::ptr::NonNull;

use super::layout::{PageLayout, NUM_CHUNKS_FOR_LAYOUT};

/// Whether the service maps the buffer or receives chunk copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ShmemMode {
    /// The service maps the same memory and reads chunks in place.
    #[default]
    Default,
    /// No real sharing: the producer copies each committed chunk into the
    /// commit request and frees it itself.
    Emulation,
}

/// A view over the shared memory buffer implementing the page/chunk ABI.
///
/// ### Concurrency Design:
/// - **Partitioning**: a free page (bitmap == 0) is claimed by CAS-ing the
///   layout into bits 28..30. Losing the race is fine; the page is then just
///   partitioned by someone else.
/// - **Chunk transitions**: each transition is a CAS of the whole header word,
///   so two threads can never both own the same chunk.
/// - **De-partitioning**: freeing the last non-free chunk of a page resets the
///   word to 0 in the same CAS.
///
/// This struct is NOT stored in shared memory. It is a transient view that holds
/// the base pointer and geometry.
pub struct SharedMemoryAbi {
    pub(crate) start: NonNull<u8>,
    pub(crate) size: usize,
    pub(crate) page_size: usize,
    pub(crate) num_pages: usize,

    /// Chunk size for each layout, indexed by `PageLayout` discriminant.
    pub(crate) chunk_sizes: [u16; NUM_CHUNKS_FOR_LAYOUT.len()],

    pub(crate) shmem_mode: ShmemMode,
}

unsafe impl Send for SharedMemoryAbi {}
unsafe impl Sync for SharedMemoryAbi {}

/// Snapshot of chunk and page states, used for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbiStats {
    pub chunks_free: usize,
    pub chunks_being_written: usize,
    pub chunks_being_read: usize,
    pub chunks_complete: usize,
    pub pages_free: usize,
    /// Pages whose layout bits hold a reserved value.
    pub pages_unexpected: usize,
}

pub(crate) fn layout_from_header_bitmap(bitmap: u32) -> PageLayout {
    PageLayout::from_bits((bitmap & super::layout::LAYOUT_MASK) >> super::layout::LAYOUT_SHIFT)
}
