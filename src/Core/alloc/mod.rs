// Fixed-capacity allocator of small integer ids (writer ids).
// Ids are handed out round-robin starting after the last one allocated, so a
// freed id is not reused immediately and stale references to it age out.

use std::marker::PhantomData;
mod debug;
mod getters;

/// Integer types the allocator can hand out.
pub trait AllocatorId: Copy {
    fn from_raw(raw: u32) -> Self;
    fn to_raw(self) -> u32;
}

impl AllocatorId for u16 {
    fn from_raw(raw: u32) -> Self {
        raw as u16
    }
    fn to_raw(self) -> u32 {
        self as u32
    }
}

impl AllocatorId for u32 {
    fn from_raw(raw: u32) -> Self {
        raw
    }
    fn to_raw(self) -> u32 {
        self
    }
}

const WORD_BITS: u32 = u64::BITS;

/// Issues ids in `1..=max_id`; 0 means "no id available".
///
/// Backed by a bitset that grows lazily up to `max_id + 1` bits. Not
/// thread-safe by itself, the arbiter keeps it under its lock.
pub struct IdAllocator<T: AllocatorId> {
    max_id: u32,
    last_id: u32,
    words: Vec<u64>,
    _marker: PhantomData<T>,
}

impl<T: AllocatorId> IdAllocator<T> {
    pub fn new(max_id: T) -> Self {
        let max_id = max_id.to_raw();
        assert!(max_id > 0, "IdAllocator needs at least one id");
        Self {
            max_id,
            last_id: 0,
            words: Vec::new(),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn is_set(&self, id: u32) -> bool {
        self.words
            .get((id / WORD_BITS) as usize)
            .map_or(false, |word| word & (1 << (id % WORD_BITS)) != 0)
    }

    #[inline]
    fn set(&mut self, id: u32, value: bool) {
        let word_idx = (id / WORD_BITS) as usize;
        if word_idx >= self.words.len() {
            self.words.resize(word_idx + 1, 0);
        }
        let bit = 1u64 << (id % WORD_BITS);
        if value {
            self.words[word_idx] |= bit;
        } else {
            self.words[word_idx] &= !bit;
        }
    }

    /// Returns a free id, or 0 when all `max_id` ids are in use.
    pub fn allocate(&mut self) -> T {
        for _ in 0..self.max_id {
            self.last_id = if self.last_id < self.max_id { self.last_id + 1 } else { 1 };
            let id = self.last_id;
            if !self.is_set(id) {
                self.set(id, true);
                return T::from_raw(id);
            }
        }
        T::from_raw(0)
    }

    /// Allocates `n` ids or none at all.
    pub fn allocate_multiple(&mut self, n: usize) -> Vec<T> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.allocate();
            if id.to_raw() == 0 {
                for allocated in ids.drain(..) {
                    self.free(allocated);
                }
                return Vec::new();
            }
            ids.push(id);
        }
        ids
    }

    /// Returns `id` to the pool. Freeing 0, an out of range id or an id that
    /// is not allocated is a caller bug.
    pub fn free(&mut self, id: T) {
        let id = id.to_raw();
        if id == 0 || id > self.max_id || !self.is_set(id) {
            debug_assert!(false, "IdAllocator::free(): invalid id {}", id);
            tracing::error!(id, "IdAllocator::free(): invalid id");
            return;
        }
        self.set(id, false);
    }

    /// True when no id is allocated.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }
}
