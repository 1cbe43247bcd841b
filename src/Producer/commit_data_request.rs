// Commit request sent to the service. Field numbers match the tracing IPC
// protocol, so the encoded bytes can go over the wire as is.

/// Chunks to hand over plus pending patches, batched by the arbiter.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitDataRequest {
    #[prost(message, repeated, tag = "1")]
    pub chunks_to_move: ::prost::alloc::vec::Vec<commit_data_request::ChunksToMove>,
    #[prost(message, repeated, tag = "2")]
    pub chunks_to_patch: ::prost::alloc::vec::Vec<commit_data_request::ChunkToPatch>,
    /// Set when the commit acknowledges a flush request from the service.
    #[prost(uint64, optional, tag = "3")]
    pub flush_request_id: ::core::option::Option<u64>,
}

pub mod commit_data_request {
    /// A completed chunk, identified by its position in the buffer.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChunksToMove {
        #[prost(uint32, optional, tag = "1")]
        pub page: ::core::option::Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub chunk: ::core::option::Option<u32>,
        /// Resolved buffer id, or a reservation placeholder until binding.
        #[prost(uint32, optional, tag = "3")]
        pub target_buffer: ::core::option::Option<u32>,
        /// Chunk copy, only used with shared memory emulation.
        #[prost(bytes = "vec", optional, tag = "4")]
        pub data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    }

    /// Patches for one chunk already handed to the service.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChunkToPatch {
        #[prost(uint32, optional, tag = "1")]
        pub target_buffer: ::core::option::Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub writer_id: ::core::option::Option<u32>,
        #[prost(uint32, optional, tag = "3")]
        pub chunk_id: ::core::option::Option<u32>,
        #[prost(message, repeated, tag = "4")]
        pub patches: ::prost::alloc::vec::Vec<chunk_to_patch::Patch>,
        /// More patches for the same chunk will follow in a later request.
        #[prost(bool, optional, tag = "5")]
        pub has_more_patches: ::core::option::Option<bool>,
    }

    pub mod chunk_to_patch {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Patch {
            /// Offset from the start of the chunk payload.
            #[prost(uint32, optional, tag = "1")]
            pub offset: ::core::option::Option<u32>,
            #[prost(bytes = "vec", optional, tag = "2")]
            pub data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
        }
    }
}
