// Per-thread writer turning trace packets into chunk writes.
//
// A packet is a sequence of fragments, one per chunk it touches; each fragment
// starts with a 4-byte size. When a chunk fills up mid-packet the fragment is
// closed, the chunk is flagged as continuing and handed back, and the packet
// goes on in the next chunk. Size fields of open nested messages that stay
// behind in the returned chunk become patches.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::Core::Abi::chunk::Chunk;
use crate::Core::Abi::layout::{
    ChunkHeaderInit, Packets, EXTRA_ROOM_FOR_INFLATED_PACKET, PACKET_HEADER_SIZE, PACKET_SIZE_DROP_PACKET,
};
use crate::Proto::message::{self, MessageContext};
use crate::Proto::message_arena::{MessageArena, MessageId};
use crate::Proto::patch_list::{PatchId, PatchList};
use crate::Proto::proto_utils::{write_redundant_varint, MAX_ONE_BYTE_MESSAGE_LENGTH, MESSAGE_LENGTH_FIELD_SIZE};
use crate::Proto::scattered_stream_writer::{
    ContiguousMemoryRange, ScatteredStreamWriter, SizeField, StreamDelegate,
};

use super::basic_types::{
    BufferExhaustedPolicy, ChunkId, FlushCallback, MaybeUnboundBufferId, WriterId,
};
use super::garbage::garbage_chunk_range;
use super::shared_memory_arbiter::SharedMemoryArbiter;
use super::trace_packet::{fields, PacketContext, TracePacket};

/// A chunk with less room than this is not worth starting a packet in.
const MIN_PACKET_ROOM: usize = PACKET_HEADER_SIZE + 8;

/// Highest packet count a writer puts in a chunk, one below the 10-bit limit
/// so the count can still be inflated.
const MAX_CHUNK_PACKETS: u16 = Packets::MAX_COUNT - 1;

/// Writes trace packets for one thread.
///
/// Obtained from `SharedMemoryArbiter::create_trace_writer`; dropping it
/// flushes and releases its writer id.
pub trait TraceWriter: Send {
    /// Starts a packet. The previous one must have been finished.
    fn new_trace_packet(&mut self) -> TracePacket<'_>;

    /// Finishes the open packet, if any. Dropping the `TracePacket` does this.
    fn finish_trace_packet(&mut self);

    /// Hands the current chunk back and asks the arbiter to commit. The
    /// callback runs once the service acknowledged the commit.
    fn flush(&mut self, callback: Option<FlushCallback>);

    fn writer_id(&self) -> WriterId;

    /// Bytes written so far, including dropped ones.
    fn written(&self) -> u64;

    /// Number of times the writer entered drop mode.
    fn drop_count(&self) -> u64;
}

pub struct TraceWriterImpl {
    stream: ScatteredStreamWriter,
    state: WriterState,
}

// Raw pointers into the shared buffer and the garbage chunk, both outlive the writer.
unsafe impl Send for TraceWriterImpl {}

struct WriterState {
    arbiter: Arc<SharedMemoryArbiter>,
    id: WriterId,
    target_buffer: MaybeUnboundBufferId,
    buffer_exhausted_policy: BufferExhaustedPolicy,

    cur_chunk: Option<Chunk>,
    next_chunk_id: ChunkId,
    cur_chunk_packet_count_inflated: bool,
    reached_max_packets_per_chunk: bool,

    arena: MessageArena,
    root: Option<MessageId>,
    /// A packet is open (and possibly spans several chunks).
    fragmenting_packet: bool,
    cur_fragment_size_field: Option<NonNull<u8>>,
    cur_fragment_start: *mut u8,

    drop_packets: bool,
    previous_packet_dropped: bool,
    drop_count: u64,

    patch_list: PatchList,
}

impl TraceWriterImpl {
    pub(crate) fn new(
        arbiter: Arc<SharedMemoryArbiter>,
        id: WriterId,
        target_buffer: MaybeUnboundBufferId,
        buffer_exhausted_policy: BufferExhaustedPolicy,
    ) -> Self {
        assert!(id != 0, "writer id 0 is invalid");
        Self {
            stream: ScatteredStreamWriter::new(),
            state: WriterState {
                arbiter,
                id,
                target_buffer,
                buffer_exhausted_policy,
                cur_chunk: None,
                next_chunk_id: 0,
                cur_chunk_packet_count_inflated: false,
                reached_max_packets_per_chunk: false,
                arena: MessageArena::new(),
                root: None,
                fragmenting_packet: false,
                cur_fragment_size_field: None,
                cur_fragment_start: ptr::null_mut(),
                drop_packets: false,
                previous_packet_dropped: false,
                drop_count: 0,
                patch_list: PatchList::new(),
            },
        }
    }

    pub fn target_buffer(&self) -> MaybeUnboundBufferId {
        self.state.target_buffer
    }

    pub fn is_dropping(&self) -> bool {
        self.state.drop_packets
    }

    /// Patches not yet handed to the arbiter.
    pub fn pending_patches(&self) -> usize {
        self.state.patch_list.len()
    }
}

impl TraceWriter for TraceWriterImpl {
    fn new_trace_packet(&mut self) -> TracePacket<'_> {
        let state = &mut self.state;
        let stream = &mut self.stream;
        assert!(!state.fragmenting_packet, "new_trace_packet() with a packet still open");

        let chunk_too_full = stream.bytes_available() < MIN_PACKET_ROOM;
        if chunk_too_full || state.reached_max_packets_per_chunk || state.drop_packets {
            state.correct_inflated_packet_count(stream);
            let range = state.get_new_buffer(stream.write_ptr());
            stream.reset(range);
        }

        // Patches are sent at most once per packet, and only when the oldest
        // one is ready.
        if state.patch_list.front_is_patched() {
            state
                .arbiter
                .send_patches(state.id, state.target_buffer, &mut state.patch_list);
        }

        state.arena.reset();
        let root = state.arena.new_message();
        state.root = Some(root);

        let size_field = stream.reserve_bytes(PACKET_HEADER_SIZE, &mut *state);
        state.cur_fragment_size_field = Some(size_field);
        state.cur_fragment_start = stream.write_ptr();
        state.fragmenting_packet = true;

        if !state.drop_packets {
            if let Some(chunk) = state.cur_chunk.as_mut() {
                let count = if state.cur_chunk_packet_count_inflated {
                    state.cur_chunk_packet_count_inflated = false;
                    chunk.packets().count
                } else {
                    chunk.increment_packet_count()
                };
                state.reached_max_packets_per_chunk = count >= MAX_CHUNK_PACKETS;
            }
        }

        let mark_dropped = state.previous_packet_dropped && !state.drop_packets;
        if mark_dropped {
            state.previous_packet_dropped = false;
        }
        let mut packet = TracePacket::new(stream, state, root);
        if mark_dropped {
            packet.append_bool(fields::PREVIOUS_PACKET_DROPPED, true);
        }
        packet
    }

    fn finish_trace_packet(&mut self) {
        self.state.finish_open_packet(&mut self.stream);
    }

    fn flush(&mut self, callback: Option<FlushCallback>) {
        assert!(!self.state.fragmenting_packet, "flush() with a packet still open");
        if self.state.cur_chunk.is_some() {
            self.state.correct_inflated_packet_count(&mut self.stream);
            self.state.return_completed_chunk();
        }
        self.state.arbiter.flush_pending_commit_data_requests(callback);
        self.stream.reset(ContiguousMemoryRange::null());
    }

    fn writer_id(&self) -> WriterId {
        self.state.id
    }

    fn written(&self) -> u64 {
        self.stream.written()
    }

    fn drop_count(&self) -> u64 {
        self.state.drop_count
    }
}

impl Drop for TraceWriterImpl {
    fn drop(&mut self) {
        self.state.finish_open_packet(&mut self.stream);
        if self.state.cur_chunk.is_some() {
            self.flush(None);
        }
        self.state.arbiter.release_writer_id(self.state.id);
    }
}

impl WriterState {
    fn finish_open_packet(&mut self, stream: &mut ScatteredStreamWriter) {
        if !self.fragmenting_packet {
            return;
        }
        if let Some(root) = self.root.take() {
            message::finalize_message(stream, self, root);
        }
        self.finalize_fragment_if_required(stream);
        self.fragmenting_packet = false;

        // Count the next packet now, so a service scraping the chunk sees the
        // finished one as complete. The spare byte backs the count with a
        // zero-size fragment if no packet follows.
        if !self.drop_packets
            && !self.reached_max_packets_per_chunk
            && stream.bytes_available() >= EXTRA_ROOM_FOR_INFLATED_PACKET
        {
            if let Some(chunk) = self.cur_chunk.as_mut() {
                chunk.increment_packet_count();
                self.cur_chunk_packet_count_inflated = true;
            }
        }
    }

    /// Writes the size of the fragment in the current chunk, compacting it to
    /// one byte when it is short and still in the current range.
    fn finalize_fragment_if_required(&mut self, stream: &mut ScatteredStreamWriter) {
        let Some(size_field) = self.cur_fragment_size_field.take() else {
            return;
        };
        let partial_size = stream.write_ptr() as usize - self.cur_fragment_start as usize;
        let in_range = stream.cur_range().contains(size_field.as_ptr(), MESSAGE_LENGTH_FIELD_SIZE);
        if partial_size as u32 <= MAX_ONE_BYTE_MESSAGE_LENGTH && in_range {
            stream.rewind(partial_size, MESSAGE_LENGTH_FIELD_SIZE - 1);
            unsafe { *size_field.as_ptr() = partial_size as u8 };
        } else {
            unsafe { write_redundant_varint(partial_size as u32, size_field.as_ptr()) };
        }
    }

    /// Backs an inflated packet count with a zero-size fragment.
    fn correct_inflated_packet_count(&mut self, stream: &mut ScatteredStreamWriter) {
        if !self.cur_chunk_packet_count_inflated {
            return;
        }
        self.cur_chunk_packet_count_inflated = false;
        stream.write_bytes_unsafe(&[0]);
    }

    fn return_completed_chunk(&mut self) {
        debug_assert!(!self.cur_chunk_packet_count_inflated);
        if let Some(chunk) = self.cur_chunk.take() {
            self.arbiter
                .return_completed_chunk(chunk, self.id, self.target_buffer, &mut self.patch_list);
        }
    }

    /// Ids of the open nested messages, outermost first.
    fn open_nested_messages(&self) -> Vec<MessageId> {
        let mut out = Vec::new();
        let mut cursor = self.root.and_then(|root| self.arena.get(root).nested);
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.arena.get(id).nested;
        }
        out
    }

    fn stream_size_field_in_cur_chunk(&self, id: MessageId) -> Option<NonNull<u8>> {
        let chunk = self.cur_chunk.as_ref()?;
        match self.arena.get(id).size_field {
            Some(SizeField::Stream(ptr)) => {
                let p = ptr.as_ptr() as usize;
                let in_chunk = p >= chunk.payload_begin() as usize
                    && p + MESSAGE_LENGTH_FIELD_SIZE <= chunk.end() as usize;
                in_chunk.then_some(ptr)
            }
            _ => None,
        }
    }

    /// Closes the current fragment before its chunk is handed back mid-packet.
    fn close_fragment_for_continuation(&mut self, write_ptr: *mut u8) {
        if let Some(size_field) = self.cur_fragment_size_field.take() {
            let partial_size = write_ptr as usize - self.cur_fragment_start as usize;
            unsafe { write_redundant_varint(partial_size as u32, size_field.as_ptr()) };
        }
        if let Some(chunk) = self.cur_chunk.as_mut() {
            chunk.set_flag(Packets::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK);
        }
        for id in self.open_nested_messages() {
            if let Some(ptr) = self.stream_size_field_in_cur_chunk(id) {
                let redirected = self.annotate_patch(ptr);
                self.arena.get_mut(id).size_field = redirected;
            }
        }
    }

    /// No chunk available: tell the service to discard the open fragment,
    /// return the chunk and write into the garbage chunk from now on.
    fn enter_drop_mode(&mut self) -> ContiguousMemoryRange {
        if self.fragmenting_packet && !self.drop_packets && self.cur_chunk.is_some() {
            if let Some(size_field) = self.cur_fragment_size_field.take() {
                unsafe { write_redundant_varint(PACKET_SIZE_DROP_PACKET, size_field.as_ptr()) };
            }
            // The chunk leaves, later length writes into it must not happen.
            for id in self.open_nested_messages() {
                if self.stream_size_field_in_cur_chunk(id).is_some() {
                    self.arena.get_mut(id).size_field = None;
                }
            }
        }
        self.return_completed_chunk();

        if !self.drop_packets {
            self.drop_packets = true;
            self.drop_count += 1;
            tracing::warn!(
                writer_id = self.id,
                drop_count = self.drop_count,
                "shared memory buffer exhausted, dropping packets"
            );
        }
        self.garbage_range()
    }

    fn garbage_range(&mut self) -> ContiguousMemoryRange {
        let range = garbage_chunk_range();
        // Fragment sizes are meaningless in the garbage chunk.
        self.cur_fragment_size_field = None;
        self.cur_fragment_start = range.begin;
        range
    }
}

impl StreamDelegate for WriterState {
    fn get_new_buffer(&mut self, write_ptr: *mut u8) -> ContiguousMemoryRange {
        // A dropped packet stays dropped; retry only at the next packet.
        if self.drop_packets && self.fragmenting_packet {
            return self.garbage_range();
        }

        let mut packets = Packets::default();
        if self.fragmenting_packet {
            packets.count = 1;
            packets.flags = Packets::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK;
        }
        let header = ChunkHeaderInit {
            writer_id: self.id,
            chunk_id: self.next_chunk_id,
            packets,
        };

        // The new chunk is acquired before the old one is returned: if none is
        // available the old chunk still has to be marked as dropping.
        let Some(new_chunk) = self.arbiter.get_new_chunk(&header, self.buffer_exhausted_policy) else {
            return self.enter_drop_mode();
        };

        if self.fragmenting_packet {
            self.close_fragment_for_continuation(write_ptr);
        }
        self.return_completed_chunk();

        if self.drop_packets {
            self.drop_packets = false;
            self.previous_packet_dropped = true;
            tracing::debug!(writer_id = self.id, "chunk available again, leaving drop mode");
        }

        self.next_chunk_id = self.next_chunk_id.wrapping_add(1);
        self.reached_max_packets_per_chunk = false;

        let mut begin = new_chunk.payload_begin();
        let end = new_chunk.end();
        self.cur_chunk = Some(new_chunk);

        if self.fragmenting_packet {
            // The continuation fragment gets its own size header.
            unsafe {
                ptr::write_bytes(begin, 0, PACKET_HEADER_SIZE);
                self.cur_fragment_size_field = Some(NonNull::new_unchecked(begin));
                begin = begin.add(PACKET_HEADER_SIZE);
            }
            self.cur_fragment_start = begin;
        }
        ContiguousMemoryRange { begin, end }
    }

    fn annotate_patch(&mut self, size_field: NonNull<u8>) -> Option<SizeField> {
        let chunk = self.cur_chunk.as_mut()?;
        let offset = size_field.as_ptr() as usize - chunk.payload_begin() as usize;
        let patch = self.patch_list.emplace_back(chunk.chunk_id(), offset as u16);
        if chunk.packets().flags & Packets::CHUNK_NEEDS_PATCHING == 0 {
            chunk.set_flag(Packets::CHUNK_NEEDS_PATCHING);
        }
        Some(SizeField::Patch(patch))
    }

    fn fill_patch(&mut self, patch: PatchId, value: [u8; 4]) {
        if let Some(entry) = self.patch_list.get_mut(patch) {
            entry.size_field = value;
        }
    }
}

impl MessageContext for WriterState {
    fn arena(&mut self) -> &mut MessageArena {
        &mut self.arena
    }
}

impl PacketContext for WriterState {
    fn as_message_context(&mut self) -> &mut dyn MessageContext {
        self
    }

    fn finish_packet(&mut self, stream: &mut ScatteredStreamWriter) {
        self.finish_open_packet(stream);
    }
}
