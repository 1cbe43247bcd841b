use super::scattered_stream_writer::SizeField;

pub const MESSAGES_PER_BLOCK: usize = 16;

/// Index of a message slot in a `MessageArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(usize);

/// Encoder state of one (possibly nested) message.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageSlot {
    /// Payload bytes written so far, nested children included once finalized.
    pub(crate) size: u32,
    /// Where the length goes on finalize. None for root messages and for size
    /// fields that were discarded.
    pub(crate) size_field: Option<SizeField>,
    /// Bytes this message occupies in front of its payload in the parent
    /// (4, or 1 after compaction). 0 for roots.
    pub(crate) header_len: u8,
    /// The open child, if any. The chain from the root through `nested` is the
    /// stack of open messages.
    pub(crate) nested: Option<MessageId>,
    pub(crate) finalized: bool,
}

/// Stack-like bump allocator for message slots.
///
/// Slots live in fixed blocks of `MESSAGES_PER_BLOCK`; a new block is only
/// added when the active one is full, and only the most recently allocated
/// slot can be deleted.
#[derive(Debug)]
pub struct MessageArena {
    blocks: Vec<Box<[MessageSlot; MESSAGES_PER_BLOCK]>>,
    len: usize,
}

impl Default for MessageArena {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageArena {
    pub fn new() -> Self {
        Self {
            blocks: vec![Box::new([MessageSlot::default(); MESSAGES_PER_BLOCK])],
            len: 0,
        }
    }

    pub fn new_message(&mut self) -> MessageId {
        let block = self.len / MESSAGES_PER_BLOCK;
        if block == self.blocks.len() {
            self.blocks.push(Box::new([MessageSlot::default(); MESSAGES_PER_BLOCK]));
        }
        let id = MessageId(self.len);
        self.len += 1;
        *self.get_mut(id) = MessageSlot::default();
        id
    }

    /// Releases `id`, which must be the most recently allocated slot.
    pub fn delete_last_message(&mut self, id: MessageId) {
        assert!(
            self.len > 0 && id.0 == self.len - 1,
            "delete_last_message({:?}) out of order, {} slots live",
            id,
            self.len
        );
        self.len -= 1;
        // Drop the block that just became empty, always keeping one.
        let needed = ((self.len + MESSAGES_PER_BLOCK - 1) / MESSAGES_PER_BLOCK).max(1);
        self.blocks.truncate(needed);
    }

    /// Forgets every slot and keeps a single block around.
    pub fn reset(&mut self) {
        self.blocks.truncate(1);
        self.len = 0;
    }

    pub fn get(&self, id: MessageId) -> &MessageSlot {
        debug_assert!(id.0 < self.len);
        &self.blocks[id.0 / MESSAGES_PER_BLOCK][id.0 % MESSAGES_PER_BLOCK]
    }

    pub fn get_mut(&mut self, id: MessageId) -> &mut MessageSlot {
        debug_assert!(id.0 < self.len);
        &mut self.blocks[id.0 / MESSAGES_PER_BLOCK][id.0 % MESSAGES_PER_BLOCK]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}
