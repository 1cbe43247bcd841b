use std::fmt;

use super::chunk::Chunk;
use super::Abi::SharedMemoryAbi;

// Debug proxy implementations that call the standalone debug functions
impl fmt::Debug for SharedMemoryAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_shared_memory_abi(self, f)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_chunk(self, f)
    }
}
