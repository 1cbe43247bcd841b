// Protobuf wire-format helpers shared by the message encoder and the writer.
// Plain varints go through prost's encoder; the fixed-width "redundant"
// varints used for backfilled size fields are produced here.

use prost::encoding::{decode_varint, encode_varint, encoded_len_varint};

/// Size of a backfilled length field: a 4-byte redundant varint.
pub const MESSAGE_LENGTH_FIELD_SIZE: usize = 4;

/// Largest length a 4-byte redundant varint can carry.
pub const MAX_MESSAGE_LENGTH: u32 = (1 << (MESSAGE_LENGTH_FIELD_SIZE * 7)) - 1;

/// Largest length that fits a single varint byte.
pub const MAX_ONE_BYTE_MESSAGE_LENGTH: u32 = (1 << 7) - 1;

pub const MAX_VARINT_SIZE: usize = 10;

/// A tag is a varint of `field_id << 3 | wire_type` with a 29-bit field id.
pub const MAX_TAG_ENCODED_SIZE: usize = 5;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

#[inline]
pub fn make_tag(field_id: u32, wire_type: WireType) -> u32 {
    (field_id << 3) | wire_type as u32
}

/// Writes `value` as a varint at the start of `buf`, returns the bytes used.
#[inline]
pub fn write_varint(value: u64, buf: &mut [u8]) -> usize {
    let capacity = buf.len();
    let mut cursor: &mut [u8] = buf;
    encode_varint(value, &mut cursor);
    capacity - cursor.len()
}

#[inline]
pub fn varint_size(value: u64) -> usize {
    encoded_len_varint(value)
}

/// Parses a varint from the start of `buf`. Returns the value and the number
/// of bytes consumed, or None on a truncated or overlong varint.
pub fn parse_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut cursor = buf;
    let value = decode_varint(&mut cursor).ok()?;
    Some((value, buf.len() - cursor.len()))
}

#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Encodes `value` as a varint padded to exactly 4 bytes, e.g. 1 becomes
/// `81 80 80 00`. The first byte is never zero for a non-zero length field
/// once written, which is how a filled patch is told apart from a pending one.
#[inline]
pub fn redundant_varint(value: u32) -> [u8; MESSAGE_LENGTH_FIELD_SIZE] {
    debug_assert!(value <= MAX_MESSAGE_LENGTH);
    let mut out = [0u8; MESSAGE_LENGTH_FIELD_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        let msb = if i < MESSAGE_LENGTH_FIELD_SIZE - 1 { 0x80 } else { 0 };
        *byte = ((value >> (7 * i)) & 0x7f) as u8 | msb;
    }
    out
}

/// Writes a redundant varint at `dst`.
///
/// # Safety
/// `dst` must be valid for 4 bytes of writes.
#[inline]
pub unsafe fn write_redundant_varint(value: u32, dst: *mut u8) {
    let bytes = redundant_varint(value);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, MESSAGE_LENGTH_FIELD_SIZE);
}
