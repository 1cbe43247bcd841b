// A write cursor over a sequence of non-contiguous memory ranges.
// When the current range runs out, the writer asks its delegate for the next
// one. Trace writers hand out shared memory chunks this way; the null writer
// hands out the same scratch buffer over and over.

use std::ptr::{self, NonNull};

use super::patch_list::PatchId;

/// `[begin, end)` of writable memory. A null range has both ends null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguousMemoryRange {
    pub begin: *mut u8,
    pub end: *mut u8,
}

impl ContiguousMemoryRange {
    pub const fn null() -> Self {
        Self {
            begin: ptr::null_mut(),
            end: ptr::null_mut(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.begin.is_null()
    }

    pub fn size(&self) -> usize {
        self.end as usize - self.begin as usize
    }

    pub fn contains(&self, p: *const u8, len: usize) -> bool {
        let p = p as usize;
        self.is_valid() && p >= self.begin as usize && p + len <= self.end as usize
    }
}

/// Where a nested message's length prefix will be written on finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeField {
    /// Four reserved bytes still inside memory owned by the writer.
    Stream(NonNull<u8>),
    /// The bytes were handed to the service already; the length travels as a patch.
    Patch(PatchId),
}

/// Supplies memory to a `ScatteredStreamWriter` and owns the patch list its
/// size fields can be redirected into.
pub trait StreamDelegate {
    /// Called when the current range is exhausted. `write_ptr` is where the
    /// writer stopped in the old range.
    fn get_new_buffer(&mut self, write_ptr: *mut u8) -> ContiguousMemoryRange;

    /// Asked whether `size_field` must move into a patch because its memory is
    /// about to be returned. Returning None discards the length.
    fn annotate_patch(&mut self, size_field: NonNull<u8>) -> Option<SizeField> {
        Some(SizeField::Stream(size_field))
    }

    /// Stores the final length bytes of a size field that lives in a patch.
    fn fill_patch(&mut self, _patch: PatchId, _value: [u8; 4]) {}
}

pub struct ScatteredStreamWriter {
    cur_range: ContiguousMemoryRange,
    write_ptr: *mut u8,
    written_previously: u64,
}

impl Default for ScatteredStreamWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScatteredStreamWriter {
    pub fn new() -> Self {
        Self {
            cur_range: ContiguousMemoryRange::null(),
            write_ptr: ptr::null_mut(),
            written_previously: 0,
        }
    }

    /// Switches to `range`, accounting the bytes written in the old one.
    pub fn reset(&mut self, range: ContiguousMemoryRange) {
        self.written_previously += self.written_in_range() as u64;
        self.cur_range = range;
        self.write_ptr = range.begin;
    }

    #[inline]
    fn written_in_range(&self) -> usize {
        self.write_ptr as usize - self.cur_range.begin as usize
    }

    fn extend<D: StreamDelegate + ?Sized>(&mut self, delegate: &mut D) {
        let range = delegate.get_new_buffer(self.write_ptr);
        assert!(range.is_valid() && range.size() > 0, "delegate returned an empty range");
        self.reset(range);
    }

    #[inline]
    pub fn write_byte<D: StreamDelegate + ?Sized>(&mut self, value: u8, delegate: &mut D) {
        if self.write_ptr >= self.cur_range.end {
            self.extend(delegate);
        }
        unsafe {
            *self.write_ptr = value;
            self.write_ptr = self.write_ptr.add(1);
        }
    }

    /// Writes `src`, hopping across as many ranges as needed.
    pub fn write_bytes<D: StreamDelegate + ?Sized>(&mut self, src: &[u8], delegate: &mut D) {
        if src.len() <= self.bytes_available() {
            self.write_bytes_unsafe(src);
            return;
        }
        let mut remaining = src;
        loop {
            let n = remaining.len().min(self.bytes_available());
            self.write_bytes_unsafe(&remaining[..n]);
            remaining = &remaining[n..];
            if remaining.is_empty() {
                break;
            }
            self.extend(delegate);
        }
    }

    /// Writes `src` into the current range, which must have room for it.
    #[inline]
    pub fn write_bytes_unsafe(&mut self, src: &[u8]) {
        assert!(src.len() <= self.bytes_available());
        if src.is_empty() {
            return;
        }
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.write_ptr, src.len());
            self.write_ptr = self.write_ptr.add(src.len());
        }
    }

    /// Reserves `size` contiguous zeroed bytes to be filled later. Extends at
    /// most once, so `size` must fit in a fresh range.
    pub fn reserve_bytes<D: StreamDelegate + ?Sized>(&mut self, size: usize, delegate: &mut D) -> NonNull<u8> {
        if size > self.bytes_available() {
            self.extend(delegate);
            assert!(size <= self.bytes_available(), "cannot reserve {} bytes in a fresh range", size);
        }
        unsafe {
            let begin = self.write_ptr;
            ptr::write_bytes(begin, 0, size);
            self.write_ptr = begin.add(size);
            NonNull::new_unchecked(begin)
        }
    }

    /// Moves the last `size` bytes back by `offset`, then rewinds the write
    /// pointer by `offset`. Both spans must lie in the current range.
    pub fn rewind(&mut self, size: usize, offset: usize) {
        assert!(
            self.written_in_range() >= size + offset,
            "rewind of {} + {} bytes crosses the current range",
            size,
            offset
        );
        unsafe {
            let src = self.write_ptr.sub(size);
            ptr::copy(src, src.sub(offset), size);
            self.write_ptr = self.write_ptr.sub(offset);
        }
    }

    #[inline]
    pub fn bytes_available(&self) -> usize {
        self.cur_range.end as usize - self.write_ptr as usize
    }

    #[inline]
    pub fn write_ptr(&self) -> *mut u8 {
        self.write_ptr
    }

    #[inline]
    pub fn cur_range(&self) -> ContiguousMemoryRange {
        self.cur_range
    }

    /// Total bytes written through this writer across all ranges.
    pub fn written(&self) -> u64 {
        self.written_previously + self.written_in_range() as u64
    }
}
