use std::fmt;

use super::shared_memory_arbiter::SharedMemoryArbiter;
use super::trace_writer::TraceWriterImpl;

impl fmt::Debug for SharedMemoryArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_shared_memory_arbiter(self, f)
    }
}

impl fmt::Debug for TraceWriterImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_trace_writer(self, f)
    }
}
