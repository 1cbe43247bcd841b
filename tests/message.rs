// Zero-copy message encoder tests. Output is decoded with prost to check it
// is plain protobuf, whatever the length encoding chosen for nested fields.

use dmxp_trace::Proto::message::{Message, MessageContext};
use dmxp_trace::Proto::message_arena::{MessageArena, MESSAGES_PER_BLOCK};
use dmxp_trace::Proto::scattered_stream_writer::{ContiguousMemoryRange, ScatteredStreamWriter, StreamDelegate};
use prost::Message as _;

#[derive(Clone, PartialEq, prost::Message)]
struct Leaf {
    #[prost(string, optional, tag = "1")]
    text: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct Inner {
    #[prost(uint64, optional, tag = "1")]
    a: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "2")]
    payload: Option<Vec<u8>>,
    #[prost(message, optional, tag = "3")]
    leaf: Option<Leaf>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct Outer {
    #[prost(uint64, optional, tag = "1")]
    id: Option<u64>,
    #[prost(string, optional, tag = "2")]
    name: Option<String>,
    #[prost(message, repeated, tag = "3")]
    inner: Vec<Inner>,
    #[prost(sint64, repeated, packed = "false", tag = "4")]
    deltas: Vec<i64>,
    #[prost(fixed32, optional, tag = "5")]
    crc: Option<u32>,
    #[prost(double, optional, tag = "6")]
    ratio: Option<f64>,
    #[prost(bool, optional, tag = "7")]
    flag: Option<bool>,
    #[prost(int64, optional, tag = "8")]
    signed: Option<i64>,
    #[prost(fixed64, optional, tag = "9")]
    stamp: Option<u64>,
    #[prost(float, optional, tag = "10")]
    scale: Option<f32>,
}

/// Message context over a chain of fixed-size heap ranges.
struct Chain {
    range_size: usize,
    ranges: Vec<Box<[u8]>>,
    used: Vec<usize>,
    arena: MessageArena,
}

impl Chain {
    fn new(range_size: usize) -> Self {
        Self {
            range_size,
            ranges: Vec::new(),
            used: Vec::new(),
            arena: MessageArena::new(),
        }
    }

    fn contents(&self, stream: &ScatteredStreamWriter) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, range) in self.ranges.iter().enumerate() {
            let used = match self.used.get(i) {
                Some(used) => *used,
                None => stream.write_ptr() as usize - range.as_ptr() as usize,
            };
            out.extend_from_slice(&range[..used]);
        }
        out
    }
}

impl StreamDelegate for Chain {
    fn get_new_buffer(&mut self, write_ptr: *mut u8) -> ContiguousMemoryRange {
        if let Some(last) = self.ranges.last() {
            self.used.push(write_ptr as usize - last.as_ptr() as usize);
        }
        self.ranges.push(vec![0u8; self.range_size].into_boxed_slice());
        let range = self.ranges.last_mut().unwrap();
        let begin = range.as_mut_ptr();
        ContiguousMemoryRange {
            begin,
            end: unsafe { begin.add(range.len()) },
        }
    }
}

impl MessageContext for Chain {
    fn arena(&mut self) -> &mut MessageArena {
        &mut self.arena
    }
}

/// Runs `build` against a fresh root message and returns the serialized bytes.
fn encode(range_size: usize, build: impl FnOnce(&mut Message<'_>)) -> Vec<u8> {
    let mut chain = Chain::new(range_size);
    let mut stream = ScatteredStreamWriter::new();
    let root = chain.arena.new_message();
    {
        let mut msg = Message::from_parts(&mut stream, &mut chain, root);
        build(&mut msg);
        msg.finalize();
    }
    chain.contents(&stream)
}

#[test]
fn test_scalar_fields() {
    let bytes = encode(4096, |msg| {
        msg.append_varint(1, 123456789);
        msg.append_string(2, "hello");
        msg.append_signed_varint(4, -5);
        msg.append_signed_varint(4, 7);
        msg.append_fixed32(5, 0xDEADBEEF);
        msg.append_double(6, 0.25);
        msg.append_bool(7, true);
        msg.append_int(8, -1);
        msg.append_fixed64(9, 1 << 40);
        msg.append_float(10, 1.5);
    });

    let decoded = Outer::decode(bytes.as_slice()).unwrap();
    assert_eq!(decoded.id, Some(123456789));
    assert_eq!(decoded.name.as_deref(), Some("hello"));
    assert_eq!(decoded.deltas, vec![-5, 7]);
    assert_eq!(decoded.crc, Some(0xDEADBEEF));
    assert_eq!(decoded.ratio, Some(0.25));
    assert_eq!(decoded.flag, Some(true));
    assert_eq!(decoded.signed, Some(-1));
    assert_eq!(decoded.stamp, Some(1 << 40));
    assert_eq!(decoded.scale, Some(1.5));
}

#[test]
fn test_small_nested_message_is_compacted() {
    let bytes = encode(4096, |msg| {
        let mut inner = msg.begin_nested(3);
        inner.append_varint(1, 5);
    });
    // Tag, one byte length, payload: the 4-byte size field shrank to 1.
    assert_eq!(bytes, vec![0x1A, 0x02, 0x08, 0x05]);
}

#[test]
fn test_large_nested_message_keeps_redundant_length() {
    let payload = vec![0x5Au8; 300];
    let bytes = encode(4096, |msg| {
        let mut inner = msg.begin_nested(3);
        inner.append_bytes(2, &payload);
    });
    // Tag + 4-byte size + (tag + 2-byte length + 300).
    assert_eq!(bytes.len(), 1 + 4 + 3 + 300);
    assert_eq!(&bytes[1..5], &[0xAF, 0x82, 0x80, 0x00]);

    let decoded = Outer::decode(bytes.as_slice()).unwrap();
    assert_eq!(decoded.inner.len(), 1);
    assert_eq!(decoded.inner[0].payload.as_deref(), Some(payload.as_slice()));
}

#[test]
fn test_writing_to_parent_finalizes_child() {
    let bytes = encode(4096, |msg| {
        msg.append_varint(1, 1);
        {
            let mut first = msg.begin_nested(3);
            first.append_varint(1, 10);
            let mut leaf = first.begin_nested(3);
            leaf.append_string(1, "leaf");
        }
        // Still open, closed by the next write to the parent.
        {
            let mut second = msg.begin_nested(3);
            second.append_varint(1, 20);
        }
        msg.append_string(2, "after");
    });

    let decoded = Outer::decode(bytes.as_slice()).unwrap();
    assert_eq!(decoded.id, Some(1));
    assert_eq!(decoded.inner.len(), 2);
    assert_eq!(decoded.inner[0].a, Some(10));
    assert_eq!(
        decoded.inner[0].leaf.as_ref().and_then(|leaf| leaf.text.as_deref()),
        Some("leaf")
    );
    assert_eq!(decoded.inner[1].a, Some(20));
    assert_eq!(decoded.name.as_deref(), Some("after"));
}

#[test]
fn test_nested_messages_across_small_ranges() {
    // 16-byte ranges force every size field and most payloads to straddle ranges.
    let mut expected = Outer::default();
    let bytes = encode(16, |msg| {
        for i in 0..20u64 {
            let text = format!("item-{}", i);
            let mut inner = msg.begin_nested(3);
            inner.append_varint(1, i * 1000);
            inner.append_bytes(2, text.as_bytes());
            let mut leaf = inner.begin_nested(3);
            leaf.append_string(1, &text);
            expected.inner.push(Inner {
                a: Some(i * 1000),
                payload: Some(text.clone().into_bytes()),
                leaf: Some(Leaf { text: Some(text) }),
            });
        }
    });

    let decoded = Outer::decode(bytes.as_slice()).unwrap();
    assert_eq!(decoded, expected);
}

#[test]
fn test_finalize_is_idempotent() {
    let mut chain = Chain::new(4096);
    let mut stream = ScatteredStreamWriter::new();
    let root = chain.arena.new_message();
    let mut msg = Message::from_parts(&mut stream, &mut chain, root);
    msg.append_varint(1, 300);
    assert!(!msg.is_finalized());
    assert_eq!(msg.finalize(), 3);
    assert!(msg.is_finalized());
    assert_eq!(msg.finalize(), 3);
    assert_eq!(msg.size(), 3);
}

#[test]
fn test_deep_nesting_grows_and_shrinks_arena() {
    let mut chain = Chain::new(4096);
    let mut stream = ScatteredStreamWriter::new();
    let root = chain.arena.new_message();
    let depth = 2 * MESSAGES_PER_BLOCK + 3;
    {
        let mut msg = Message::from_parts(&mut stream, &mut chain, root);
        for _ in 0..depth {
            msg = msg.into_nested(3);
        }
        msg.append_varint(1, 1);
    }
    assert_eq!(chain.arena.len(), depth + 1);
    assert_eq!(chain.arena.num_blocks(), 3);

    {
        let mut msg = Message::from_parts(&mut stream, &mut chain, root);
        msg.finalize();
    }
    // Children are released as they are finalized, one block stays.
    assert_eq!(chain.arena.len(), 1);
    assert_eq!(chain.arena.num_blocks(), 1);

    let bytes = chain.contents(&stream);
    let mut cursor = bytes.as_slice();
    for _ in 0..depth {
        // Each level is `tag, length, child` with a compacted length.
        assert_eq!(cursor[0], 0x1A);
        let (len, used) = dmxp_trace::Proto::proto_utils::parse_varint(&cursor[1..]).unwrap();
        assert_eq!(used, 1);
        assert_eq!(1 + used + len as usize, cursor.len());
        cursor = &cursor[1 + used..];
    }
    assert_eq!(cursor, &[0x08, 0x01]);
}

#[test]
fn test_arena_reset_and_delete_order() {
    let mut arena = MessageArena::new();
    assert!(arena.is_empty());
    let ids: Vec<_> = (0..MESSAGES_PER_BLOCK + 1).map(|_| arena.new_message()).collect();
    assert_eq!(arena.num_blocks(), 2);

    arena.delete_last_message(*ids.last().unwrap());
    assert_eq!(arena.num_blocks(), 1);
    assert_eq!(arena.len(), MESSAGES_PER_BLOCK);

    arena.reset();
    assert!(arena.is_empty());
    assert_eq!(arena.num_blocks(), 1);
}

#[test]
#[should_panic(expected = "out of order")]
fn test_arena_rejects_out_of_order_delete() {
    let mut arena = MessageArena::new();
    let first = arena.new_message();
    let _second = arena.new_message();
    arena.delete_last_message(first);
}

#[test]
fn test_raw_proto_bytes_close_open_child() {
    let bytes = encode(4096, |msg| {
        {
            let mut inner = msg.begin_nested(3);
            inner.append_varint(1, 9);
        }
        // Pre-serialized `id = 7`, written after the child is finalized.
        msg.append_raw_proto_bytes(&[0x08, 0x07]);
    });
    assert_eq!(bytes, vec![0x1A, 0x02, 0x08, 0x09, 0x08, 0x07]);

    let decoded = Outer::decode(bytes.as_slice()).unwrap();
    assert_eq!(decoded.id, Some(7));
    assert_eq!(decoded.inner[0].a, Some(9));
}
