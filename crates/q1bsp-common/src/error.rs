// error.rs — load-time error taxonomy

use thiserror::Error;

/// Errors raised while reading a map or one of its sidecar files.
///
/// Structural errors abort the load of that asset. Whether that is fatal is
/// decided by the caller (`crash` flag on the model registry).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{name} not found")]
    NotFound { name: String },

    #[error("read of {len} bytes at offset {offset} is outside the {size}-byte buffer")]
    BadFileRange {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("funny lump size in {model} ({lump}: {len} bytes is not a multiple of {record})")]
    FunnyLumpSize {
        model: String,
        lump: &'static str,
        len: usize,
        record: usize,
    },

    #[error("{model} has unsupported version number ({version:#x} should be 29)")]
    UnsupportedVersion { model: String, version: i32 },

    #[error("{model} is a {format} (unsupported)")]
    UnsupportedFormat { model: String, format: &'static str },

    #[error("{model}: {what} index {index} out of bounds (count {count})")]
    BadIndex {
        model: String,
        what: &'static str,
        index: i64,
        count: usize,
    },

    #[error("{model}: {count} leafs exceeds limit of {limit}")]
    TooManyLeafs {
        model: String,
        count: usize,
        limit: usize,
    },

    #[error("bad animating texture {name}")]
    BadAnimatingTexture { name: String },

    #[error("missing frame {frame} of {name}")]
    MissingAnimationFrame { name: String, frame: usize },
}

pub type LoadResult<T> = Result<T, LoadError>;
