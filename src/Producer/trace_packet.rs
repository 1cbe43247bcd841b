use crate::Proto::message::{Message, MessageContext};
use crate::Proto::message_arena::MessageId;
use crate::Proto::scattered_stream_writer::ScatteredStreamWriter;

/// Field numbers of the TracePacket message used by the writer itself.
pub mod fields {
    /// Set on the first packet a writer emits after it lost data.
    pub const PREVIOUS_PACKET_DROPPED: u32 = 42;
}

/// The writer side of an open packet.
pub trait PacketContext: MessageContext {
    fn as_message_context(&mut self) -> &mut dyn MessageContext;

    /// Finalizes the open packet, if any.
    fn finish_packet(&mut self, stream: &mut ScatteredStreamWriter);
}

/// An open trace packet. Fields are written straight into shared memory; the
/// packet is finished when the handle is dropped.
pub struct TracePacket<'w> {
    stream: &'w mut ScatteredStreamWriter,
    ctx: &'w mut dyn PacketContext,
    root: MessageId,
}

impl<'w> TracePacket<'w> {
    pub(crate) fn new(stream: &'w mut ScatteredStreamWriter, ctx: &'w mut dyn PacketContext, root: MessageId) -> Self {
        Self { stream, ctx, root }
    }

    /// The packet as a plain message, for encoders written against `Message`.
    pub fn message(&mut self) -> Message<'_> {
        Message::from_parts(&mut *self.stream, self.ctx.as_message_context(), self.root)
    }

    pub fn append_varint(&mut self, field_id: u32, value: u64) {
        self.message().append_varint(field_id, value);
    }

    pub fn append_int(&mut self, field_id: u32, value: i64) {
        self.message().append_int(field_id, value);
    }

    pub fn append_signed_varint(&mut self, field_id: u32, value: i64) {
        self.message().append_signed_varint(field_id, value);
    }

    pub fn append_bool(&mut self, field_id: u32, value: bool) {
        self.message().append_bool(field_id, value);
    }

    pub fn append_fixed32(&mut self, field_id: u32, value: u32) {
        self.message().append_fixed32(field_id, value);
    }

    pub fn append_fixed64(&mut self, field_id: u32, value: u64) {
        self.message().append_fixed64(field_id, value);
    }

    pub fn append_double(&mut self, field_id: u32, value: f64) {
        self.message().append_double(field_id, value);
    }

    pub fn append_bytes(&mut self, field_id: u32, value: &[u8]) {
        self.message().append_bytes(field_id, value);
    }

    pub fn append_string(&mut self, field_id: u32, value: &str) {
        self.message().append_string(field_id, value);
    }

    pub fn append_raw_proto_bytes(&mut self, bytes: &[u8]) {
        self.message().append_raw_proto_bytes(bytes);
    }

    pub fn begin_nested(&mut self, field_id: u32) -> Message<'_> {
        self.message().into_nested(field_id)
    }

    /// Same as dropping the handle.
    pub fn finish(self) {}
}

impl Drop for TracePacket<'_> {
    fn drop(&mut self) {
        self.ctx.finish_packet(self.stream);
    }
}
