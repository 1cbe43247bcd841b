use std::io;

/// Errors surfaced while setting up the shared memory buffer. Once an arbiter
/// exists, the write path never fails with an error: it drops, stalls or
/// panics on a broken invariant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("page size {0} must be a multiple of 4096 and at most 65536")]
    InvalidPageSize(usize),

    #[error("buffer size {size} is not a non-zero multiple of the page size {page_size}")]
    InvalidGeometry { size: usize, page_size: usize },

    #[error("buffer of {size} bytes is smaller than one page of {page_size} bytes")]
    BufferTooSmall { size: usize, page_size: usize },

    #[error("shared memory at {0:#x} is not page aligned")]
    Misaligned(usize),

    #[error("{0}")]
    Unsupported(&'static str),
}

pub type Result<A> = std::result::Result<A, Error>;
