use crate::Proto::message::{self, MessageContext};
use crate::Proto::message_arena::{MessageArena, MessageId};
use crate::Proto::scattered_stream_writer::{ContiguousMemoryRange, ScatteredStreamWriter, StreamDelegate};

use super::basic_types::{FlushCallback, WriterId};
use super::trace_packet::{PacketContext, TracePacket};
use super::trace_writer::TraceWriter;

const SCRATCH_SIZE: usize = 4096;

/// Writer returned when no real one can be created. Packets are encoded into
/// a private scratch buffer that is reused over and over and never read.
pub struct NullTraceWriter {
    stream: ScatteredStreamWriter,
    sink: NullSink,
}

// The stream only points into `sink.scratch`, which moves with the writer's heap box.
unsafe impl Send for NullTraceWriter {}

struct NullSink {
    scratch: Box<[u8; SCRATCH_SIZE]>,
    arena: MessageArena,
    root: Option<MessageId>,
}

impl Default for NullTraceWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl NullTraceWriter {
    pub fn new() -> Self {
        Self {
            stream: ScatteredStreamWriter::new(),
            sink: NullSink {
                scratch: Box::new([0u8; SCRATCH_SIZE]),
                arena: MessageArena::new(),
                root: None,
            },
        }
    }
}

impl TraceWriter for NullTraceWriter {
    fn new_trace_packet(&mut self) -> TracePacket<'_> {
        self.sink.finish_packet(&mut self.stream);
        self.sink.arena.reset();
        let root = self.sink.arena.new_message();
        self.sink.root = Some(root);
        let range = self.sink.get_new_buffer(self.stream.write_ptr());
        self.stream.reset(range);
        TracePacket::new(&mut self.stream, &mut self.sink, root)
    }

    fn finish_trace_packet(&mut self) {
        self.sink.finish_packet(&mut self.stream);
    }

    fn flush(&mut self, callback: Option<FlushCallback>) {
        if let Some(callback) = callback {
            callback();
        }
    }

    fn writer_id(&self) -> WriterId {
        0
    }

    fn written(&self) -> u64 {
        self.stream.written()
    }

    fn drop_count(&self) -> u64 {
        0
    }
}

impl StreamDelegate for NullSink {
    fn get_new_buffer(&mut self, _write_ptr: *mut u8) -> ContiguousMemoryRange {
        let begin = self.scratch.as_mut_ptr();
        ContiguousMemoryRange {
            begin,
            end: unsafe { begin.add(SCRATCH_SIZE) },
        }
    }
}

impl MessageContext for NullSink {
    fn arena(&mut self) -> &mut MessageArena {
        &mut self.arena
    }
}

impl PacketContext for NullSink {
    fn as_message_context(&mut self) -> &mut dyn MessageContext {
        self
    }

    fn finish_packet(&mut self, stream: &mut ScatteredStreamWriter) {
        if let Some(root) = self.root.take() {
            message::finalize_message(stream, self, root);
        }
    }
}
