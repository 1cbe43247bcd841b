/// Identifies a trace writer within one producer. 0 is invalid.
pub type WriterId = u16;

/// Per-writer chunk sequence number. Wraps.
pub type ChunkId = u32;

/// Service-side target buffer id. 0 is invalid and means "discard".
pub type BufferId = u16;

/// Either a `BufferId` (low 16 bits) or a startup reservation id (high 16
/// bits) that is resolved to a buffer once the service assigns one.
pub type MaybeUnboundBufferId = u32;

/// Id carried by a flush request from the service, echoed in the commit that
/// acknowledges it.
pub type FlushRequestId = u64;

pub const INVALID_BUFFER_ID: BufferId = 0;

pub const MAX_WRITER_ID: WriterId = 1024;

/// Callback run once the service acknowledged a commit (or right away when
/// there was nothing to commit).
pub type FlushCallback = Box<dyn FnOnce() + Send + 'static>;

/// What a writer does when no chunk is free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BufferExhaustedPolicy {
    /// Keep writing into the garbage chunk and mark the loss.
    #[default]
    Drop,
    /// Wait for the service to free a chunk. Fatal if it never does.
    Stall,
    /// Wait like `Stall`, then give up and drop.
    StallThenDrop,
}

pub fn is_reservation_target_buffer_id(target_buffer_id: MaybeUnboundBufferId) -> bool {
    (target_buffer_id >> 16) > 0
}

pub fn make_target_buffer_id_for_reservation(reservation_id: u16) -> MaybeUnboundBufferId {
    assert!(reservation_id > 0, "reservation id 0 is invalid");
    (reservation_id as MaybeUnboundBufferId) << 16
}
