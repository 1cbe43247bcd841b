//! In-process doubles for the service side: a fake endpoint that drains the
//! buffer like the service would, and a manually driven task runner.

pub mod fake_endpoint;
pub mod task_runner;

pub use fake_endpoint::{FakeProducerEndpoint, StoredChunk};
pub use task_runner::TestTaskRunner;

use crate::Proto::proto_utils::parse_varint;

/// A decoded top-level protobuf field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Varint(u64),
    Fixed64(u64),
    Bytes(Vec<u8>),
    Fixed32(u32),
}

/// Splits `buf` into its top-level fields. Length prefixes may be redundant
/// (padded) varints. Returns None on malformed input.
pub fn parse_fields(buf: &[u8]) -> Option<Vec<(u32, FieldValue)>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (tag, used) = parse_varint(&buf[pos..])?;
        pos += used;
        let field_id = (tag >> 3) as u32;
        let value = match tag & 7 {
            0 => {
                let (v, used) = parse_varint(&buf[pos..])?;
                pos += used;
                FieldValue::Varint(v)
            }
            1 => {
                let bytes = buf.get(pos..pos + 8)?;
                pos += 8;
                FieldValue::Fixed64(u64::from_le_bytes(bytes.try_into().ok()?))
            }
            2 => {
                let (len, used) = parse_varint(&buf[pos..])?;
                pos += used;
                let bytes = buf.get(pos..pos + len as usize)?;
                pos += len as usize;
                FieldValue::Bytes(bytes.to_vec())
            }
            5 => {
                let bytes = buf.get(pos..pos + 4)?;
                pos += 4;
                FieldValue::Fixed32(u32::from_le_bytes(bytes.try_into().ok()?))
            }
            _ => return None,
        };
        out.push((field_id, value));
    }
    Some(out)
}
