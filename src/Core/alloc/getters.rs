use super::*;

/// Getter methods used for diagnostics and the Debug output.
impl<T: AllocatorId> IdAllocator<T> {
    /// Highest id the allocator can hand out.
    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    /// The id returned by the most recent successful `allocate()` (0 before
    /// the first one). The next scan starts right after it.
    pub fn last_id(&self) -> u32 {
        self.last_id
    }

    /// Number of ids currently allocated.
    pub fn allocated_count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_allocated(&self, id: T) -> bool {
        self.is_set(id.to_raw())
    }
}
