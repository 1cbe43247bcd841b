pub mod message;
pub mod message_arena;
pub mod patch_list;
pub mod proto_utils;
pub mod scattered_stream_writer;

pub use message::{Message, MessageContext};
pub use message_arena::{MessageArena, MessageId, MESSAGES_PER_BLOCK};
pub use patch_list::{Patch, PatchId, PatchList};
pub use scattered_stream_writer::{ContiguousMemoryRange, ScatteredStreamWriter, SizeField, StreamDelegate};
