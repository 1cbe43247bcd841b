// Zero-copy protobuf encoder writing straight into a ScatteredStreamWriter.
//
// Length-delimited children reserve a 4-byte size field up front and fill it
// when they are finalized, either in place (possibly compacted to one byte) or
// through a patch if the bytes already left with a returned chunk. A parent has
// at most one open child; touching the parent again finalizes that child.

use std::ptr::NonNull;

use super::message_arena::{MessageArena, MessageId};
use super::proto_utils::{
    make_tag, redundant_varint, write_redundant_varint, write_varint, zigzag_encode, WireType,
    MAX_ONE_BYTE_MESSAGE_LENGTH, MAX_TAG_ENCODED_SIZE, MAX_VARINT_SIZE, MESSAGE_LENGTH_FIELD_SIZE,
};
use super::scattered_stream_writer::{ScatteredStreamWriter, SizeField, StreamDelegate};

/// A stream delegate that also owns the arena holding message state.
pub trait MessageContext: StreamDelegate {
    fn arena(&mut self) -> &mut MessageArena;
}

/// Handle to an open message. Dropping it leaves the message open; it is
/// finalized by `finalize()` or when its parent is written to again.
pub struct Message<'w> {
    stream: &'w mut ScatteredStreamWriter,
    ctx: &'w mut dyn MessageContext,
    id: MessageId,
}

impl<'w> Message<'w> {
    pub fn from_parts(
        stream: &'w mut ScatteredStreamWriter,
        ctx: &'w mut dyn MessageContext,
        id: MessageId,
    ) -> Self {
        Self { stream, ctx, id }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Payload bytes written so far.
    pub fn size(&mut self) -> u32 {
        self.ctx.arena().get(self.id).size
    }

    pub fn is_finalized(&mut self) -> bool {
        self.ctx.arena().get(self.id).finalized
    }

    pub fn append_varint(&mut self, field_id: u32, value: u64) {
        let mut buf = [0u8; MAX_TAG_ENCODED_SIZE + MAX_VARINT_SIZE];
        let mut n = write_varint(make_tag(field_id, WireType::Varint) as u64, &mut buf);
        n += write_varint(value, &mut buf[n..]);
        self.append_raw(&buf[..n]);
    }

    /// int32/int64/enum: negative values take ten bytes.
    pub fn append_int(&mut self, field_id: u32, value: i64) {
        self.append_varint(field_id, value as u64);
    }

    /// sint32/sint64.
    pub fn append_signed_varint(&mut self, field_id: u32, value: i64) {
        self.append_varint(field_id, zigzag_encode(value));
    }

    pub fn append_bool(&mut self, field_id: u32, value: bool) {
        self.append_varint(field_id, value as u64);
    }

    pub fn append_fixed32(&mut self, field_id: u32, value: u32) {
        self.append_fixed(field_id, WireType::Fixed32, &value.to_le_bytes());
    }

    pub fn append_fixed64(&mut self, field_id: u32, value: u64) {
        self.append_fixed(field_id, WireType::Fixed64, &value.to_le_bytes());
    }

    pub fn append_float(&mut self, field_id: u32, value: f32) {
        self.append_fixed32(field_id, value.to_bits());
    }

    pub fn append_double(&mut self, field_id: u32, value: f64) {
        self.append_fixed64(field_id, value.to_bits());
    }

    fn append_fixed(&mut self, field_id: u32, wire_type: WireType, value: &[u8]) {
        let mut buf = [0u8; MAX_TAG_ENCODED_SIZE + 8];
        let n = write_varint(make_tag(field_id, wire_type) as u64, &mut buf);
        buf[n..n + value.len()].copy_from_slice(value);
        self.append_raw(&buf[..n + value.len()]);
    }

    pub fn append_bytes(&mut self, field_id: u32, value: &[u8]) {
        let mut buf = [0u8; MAX_TAG_ENCODED_SIZE + MAX_VARINT_SIZE];
        let mut n = write_varint(make_tag(field_id, WireType::LengthDelimited) as u64, &mut buf);
        n += write_varint(value.len() as u64, &mut buf[n..]);
        self.append_raw(&buf[..n]);
        self.append_raw(value);
    }

    pub fn append_string(&mut self, field_id: u32, value: &str) {
        self.append_bytes(field_id, value.as_bytes());
    }

    /// Appends already serialized fields verbatim.
    pub fn append_raw_proto_bytes(&mut self, bytes: &[u8]) {
        self.append_raw(bytes);
    }

    fn append_raw(&mut self, bytes: &[u8]) {
        append_raw(&mut *self.stream, &mut *self.ctx, self.id, bytes);
    }

    /// Opens a child message in `field_id`, finalizing any open child first.
    pub fn begin_nested(&mut self, field_id: u32) -> Message<'_> {
        let child = begin_nested(&mut *self.stream, &mut *self.ctx, self.id, field_id);
        Message {
            stream: &mut *self.stream,
            ctx: &mut *self.ctx,
            id: child,
        }
    }

    /// Like `begin_nested`, handing this handle's borrow to the child.
    pub fn into_nested(self, field_id: u32) -> Message<'w> {
        let child = begin_nested(&mut *self.stream, &mut *self.ctx, self.id, field_id);
        Message {
            stream: self.stream,
            ctx: self.ctx,
            id: child,
        }
    }

    /// Closes the message and its open descendants, writes the length and
    /// returns the payload size. Idempotent.
    pub fn finalize(&mut self) -> u32 {
        finalize_message(&mut *self.stream, &mut *self.ctx, self.id);
        self.ctx.arena().get(self.id).size
    }
}

pub(crate) fn append_raw(
    stream: &mut ScatteredStreamWriter,
    ctx: &mut dyn MessageContext,
    id: MessageId,
    bytes: &[u8],
) {
    end_nested(stream, ctx, id);
    assert!(!ctx.arena().get(id).finalized, "write to a finalized message");
    stream.write_bytes(bytes, &mut *ctx);
    ctx.arena().get_mut(id).size += bytes.len() as u32;
}

pub(crate) fn begin_nested(
    stream: &mut ScatteredStreamWriter,
    ctx: &mut dyn MessageContext,
    parent: MessageId,
    field_id: u32,
) -> MessageId {
    let mut tag = [0u8; MAX_TAG_ENCODED_SIZE];
    let n = write_varint(make_tag(field_id, WireType::LengthDelimited) as u64, &mut tag);
    append_raw(stream, ctx, parent, &tag[..n]);

    let child = ctx.arena().new_message();
    ctx.arena().get_mut(child).header_len = MESSAGE_LENGTH_FIELD_SIZE as u8;
    // Linked to the parent only once its size field exists, so a chunk switch
    // inside reserve_bytes never sees a half-initialized child.
    let size_field = stream.reserve_bytes(MESSAGE_LENGTH_FIELD_SIZE, &mut *ctx);
    ctx.arena().get_mut(child).size_field = Some(SizeField::Stream(size_field));
    ctx.arena().get_mut(parent).nested = Some(child);
    child
}

/// Finalizes the open child of `id`, if any, and folds its bytes into `id`.
pub(crate) fn end_nested(stream: &mut ScatteredStreamWriter, ctx: &mut dyn MessageContext, id: MessageId) {
    let Some(child) = ctx.arena().get(id).nested else {
        return;
    };
    let occupied = finalize_message(stream, ctx, child);
    ctx.arena().delete_last_message(child);
    let slot = ctx.arena().get_mut(id);
    slot.nested = None;
    slot.size += occupied;
}

/// Returns the bytes the message occupies in its parent: payload plus length prefix.
pub(crate) fn finalize_message(
    stream: &mut ScatteredStreamWriter,
    ctx: &mut dyn MessageContext,
    id: MessageId,
) -> u32 {
    let slot = *ctx.arena().get(id);
    if slot.finalized {
        return slot.size + slot.header_len as u32;
    }

    end_nested(stream, ctx, id);
    let size = ctx.arena().get(id).size;
    let mut header_len = slot.header_len;

    match slot.size_field {
        Some(SizeField::Stream(size_field)) => {
            if can_compact(stream, size_field, size) {
                stream.rewind(size as usize, MESSAGE_LENGTH_FIELD_SIZE - 1);
                unsafe { *size_field.as_ptr() = size as u8 };
                header_len = 1;
            } else {
                unsafe { write_redundant_varint(size, size_field.as_ptr()) };
            }
        }
        Some(SizeField::Patch(patch)) => ctx.fill_patch(patch, redundant_varint(size)),
        None => {}
    }

    let slot = ctx.arena().get_mut(id);
    slot.size_field = None;
    slot.header_len = header_len;
    slot.finalized = true;
    size + header_len as u32
}

/// A short payload sitting right after its size field in the current range can
/// be shifted back over the 3 padding bytes of the redundant varint.
fn can_compact(stream: &ScatteredStreamWriter, size_field: NonNull<u8>, size: u32) -> bool {
    if size > MAX_ONE_BYTE_MESSAGE_LENGTH {
        return false;
    }
    let expected = (stream.write_ptr() as usize).checked_sub(size as usize + MESSAGE_LENGTH_FIELD_SIZE);
    expected == Some(size_field.as_ptr() as usize)
        && stream.cur_range().contains(size_field.as_ptr(), MESSAGE_LENGTH_FIELD_SIZE)
}
