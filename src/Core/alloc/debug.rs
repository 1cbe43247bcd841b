use super::*;
use std::fmt;

// Debug proxy implementation that calls the standalone debug function
impl<T: AllocatorId> fmt::Debug for IdAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_id_allocator(self.max_id(), self.last_id(), self.allocated_count(), f)
    }
}
