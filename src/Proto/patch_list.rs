// Deferred rewrites of nested message size fields that ended up in a chunk
// the writer already handed back. Entries are appended in writing order and
// consumed from the front once filled in.

use std::collections::VecDeque;

use super::proto_utils::MESSAGE_LENGTH_FIELD_SIZE;

/// Stable handle to a patch. Stays valid until the entry is popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub chunk_id: u32,
    /// Offset of the size field from the chunk payload start.
    pub offset: u16,
    pub size_field: [u8; MESSAGE_LENGTH_FIELD_SIZE],
}

impl Patch {
    pub fn new(chunk_id: u32, offset: u16) -> Self {
        Self {
            chunk_id,
            offset,
            size_field: [0; MESSAGE_LENGTH_FIELD_SIZE],
        }
    }

    /// A filled size field is a redundant varint whose first byte is never 0.
    pub fn is_patched(&self) -> bool {
        self.size_field[0] != 0
    }
}

#[derive(Debug, Default)]
pub struct PatchList {
    entries: VecDeque<Patch>,
    /// Id of `entries[0]`.
    first_id: u64,
}

impl PatchList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emplace_back(&mut self, chunk_id: u32, offset: u16) -> PatchId {
        self.entries.push_back(Patch::new(chunk_id, offset));
        PatchId(self.first_id + self.entries.len() as u64 - 1)
    }

    pub fn pop_front(&mut self) -> Option<Patch> {
        let patch = self.entries.pop_front()?;
        self.first_id += 1;
        Some(patch)
    }

    pub fn front(&self) -> Option<&Patch> {
        self.entries.front()
    }

    pub fn back(&self) -> Option<&Patch> {
        self.entries.back()
    }

    pub fn get(&self, id: PatchId) -> Option<&Patch> {
        let idx = id.0.checked_sub(self.first_id)?;
        self.entries.get(idx as usize)
    }

    pub fn get_mut(&mut self, id: PatchId) -> Option<&mut Patch> {
        let idx = id.0.checked_sub(self.first_id)?;
        self.entries.get_mut(idx as usize)
    }

    /// True when the front entry exists and has been filled in.
    pub fn front_is_patched(&self) -> bool {
        self.front().map_or(false, Patch::is_patched)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patch> {
        self.entries.iter()
    }
}
