use std::sync::atomic::{AtomicU16, AtomicU32};

use crate::Proto::proto_utils::MAX_MESSAGE_LENGTH;

/// Smallest page size and the granularity every page size must be a multiple of.
pub const MIN_PAGE_SIZE: usize = 4 * 1024;

/// Largest supported page size. Chunk offsets inside a page must fit the
/// 16-bit patch offset.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// A page can be split into at most this many chunks (`PageLayout::Div14`).
pub const MAX_CHUNKS_PER_PAGE: usize = 14;

/// Size of the fragment length prefix written before each packet fragment.
pub const PACKET_HEADER_SIZE: usize = 4;

/// Fragment size telling the service to discard the packet the fragment belongs to.
pub const PACKET_SIZE_DROP_PACKET: u32 = MAX_MESSAGE_LENGTH;

/// Bytes kept free at the end of a chunk so an inflated packet count can be
/// backed by a zero-size fragment when the chunk is returned.
pub const EXTRA_ROOM_FOR_INFLATED_PACKET: usize = 1;

/// Bit position of the page layout inside the page header bitmap.
pub const LAYOUT_SHIFT: u32 = 28;

/// Mask selecting the three layout bits of the page header bitmap.
pub const LAYOUT_MASK: u32 = 0x7000_0000;

/// Two state bits per chunk.
pub const CHUNK_STATE_BITS: u32 = 2;
pub const CHUNK_STATE_MASK: u32 = 0x3;

/// All chunk state bits of a page header (14 chunks x 2 bits).
pub const ALL_CHUNKS_MASK: u32 = 0x0FFF_FFFF;

/// How a page is partitioned into chunks. Encoded in bits 28..30 of the page
/// header bitmap.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageLayout {
    NotPartitioned = 0,
    Div1 = 1,
    Div2 = 2,
    Div4 = 3,
    Div7 = 4,
    Div14 = 5,
    Reserved1 = 6,
    Reserved2 = 7,
}

/// Number of chunks for each `PageLayout`, indexed by its discriminant.
pub const NUM_CHUNKS_FOR_LAYOUT: [usize; 8] = [0, 1, 2, 4, 7, 14, 0, 0];

impl PageLayout {
    pub const ALL: [PageLayout; 8] = [
        PageLayout::NotPartitioned,
        PageLayout::Div1,
        PageLayout::Div2,
        PageLayout::Div4,
        PageLayout::Div7,
        PageLayout::Div14,
        PageLayout::Reserved1,
        PageLayout::Reserved2,
    ];

    pub fn from_bits(bits: u32) -> PageLayout {
        PageLayout::ALL[(bits & 0x7) as usize]
    }

    pub fn num_chunks(self) -> usize {
        NUM_CHUNKS_FOR_LAYOUT[self as usize]
    }
}

/// Lifecycle of a chunk. Only the producer moves Free -> BeingWritten -> Complete,
/// only the service moves Complete -> BeingRead -> Free.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkState {
    Free = 0,
    BeingWritten = 1,
    BeingRead = 2,
    Complete = 3,
}

impl ChunkState {
    pub fn from_bits(bits: u32) -> ChunkState {
        match bits & CHUNK_STATE_MASK {
            0 => ChunkState::Free,
            1 => ChunkState::BeingWritten,
            2 => ChunkState::BeingRead,
            _ => ChunkState::Complete,
        }
    }
}

/// Header at the start of every page.
///
/// `header_bitmap` is the only word mutated concurrently by producer and
/// service; every chunk state transition is a CAS on it.
#[repr(C)]
pub struct PageHeader {
    /// Bits 0..27: 14 two-bit chunk states. Bits 28..30: page layout.
    pub header_bitmap: AtomicU32,

    /// Reserved for future use, keeps the header at 8 bytes.
    pub reserved: u32,
}

/// Header at the start of every chunk, followed by the payload.
#[repr(C)]
pub struct ChunkHeader {
    /// Per-writer monotonic (wrapping) sequence number.
    pub chunk_id: AtomicU32,

    /// Id of the writer that owns the chunk while it is BeingWritten.
    pub writer_id: AtomicU16,

    /// Packed `Packets`: count in the low 10 bits, flags in the high 6.
    pub packets: AtomicU16,
}

/// Unpacked form of `ChunkHeader::packets`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Packets {
    pub count: u16,
    pub flags: u8,
}

impl Packets {
    pub const COUNT_BITS: u32 = 10;
    pub const MAX_COUNT: u16 = (1 << Self::COUNT_BITS) - 1;

    /// The first fragment of the chunk continues a packet from the writer's previous chunk.
    pub const FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK: u8 = 1 << 0;
    /// The last fragment of the chunk is continued in the writer's next chunk.
    pub const LAST_PACKET_CONTINUES_ON_NEXT_CHUNK: u8 = 1 << 1;
    /// Some size field in the chunk will be rewritten by a later patch.
    pub const CHUNK_NEEDS_PATCHING: u8 = 1 << 2;

    pub fn from_raw(raw: u16) -> Packets {
        Packets {
            count: raw & Self::MAX_COUNT,
            flags: (raw >> Self::COUNT_BITS) as u8,
        }
    }

    pub fn to_raw(self) -> u16 {
        debug_assert!(self.count <= Self::MAX_COUNT);
        debug_assert!(self.flags < (1 << 6));
        (self.count & Self::MAX_COUNT) | ((self.flags as u16) << Self::COUNT_BITS)
    }
}

/// Header values stamped into a chunk when it is acquired for writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkHeaderInit {
    pub writer_id: u16,
    pub chunk_id: u32,
    pub packets: Packets,
}

pub const PAGE_HEADER_SIZE: usize = std::mem::size_of::<PageHeader>();
pub const CHUNK_HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();

/// Size of each chunk of a page partitioned with `layout`. Rounded down to a
/// multiple of 4 so every chunk header stays 4-byte aligned.
pub fn chunk_size_for_layout(page_size: usize, layout: PageLayout) -> usize {
    let num_chunks = layout.num_chunks();
    if num_chunks == 0 {
        return 0;
    }
    ((page_size - PAGE_HEADER_SIZE) / num_chunks) & !3
}
