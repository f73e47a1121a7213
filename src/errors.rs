//! Central error types for bitnet-runtime.

use thiserror::Error;

use crate::session::GenerateResult;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BitNetError>;

#[derive(Error, Debug)]
pub enum BitNetError {
    #[error("invalid GGUF magic {found:?}")]
    InvalidMagic { found: [u8; 4] },

    #[error("truncated input while reading {context}")]
    Truncated { context: String },

    #[error("unsupported tensor type {type_code} ({context})")]
    UnsupportedType { type_code: u32, context: String },

    #[error("unsupported metadata value type {0}")]
    UnsupportedValueType(u32),

    #[error("invalid model format: {0}")]
    InvalidFormat(String),

    #[error("tensor {name}: element count overflows")]
    SizeOverflow { name: String },

    #[error("tensor {name}: {count} elements not divisible by block size {block_size}")]
    BadBlockSize {
        name: String,
        count: u64,
        block_size: u64,
    },

    #[error("missing tensor: {0}")]
    MissingTensor(String),

    #[error("shape mismatch for {name}: {detail}")]
    ShapeMismatch { name: String, detail: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("generation cancelled after {} tokens", .partial.token_ids.len())]
    Cancelled { partial: Box<GenerateResult> },

    /// A forward step failed mid-generation; `partial` holds what was emitted before it.
    #[error("generation failed after {} tokens: {source}", .partial.token_ids.len())]
    Interrupted {
        source: Box<BitNetError>,
        partial: Box<GenerateResult>,
    },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BitNetError {
    /// Maps an I/O failure to `Truncated` when it is a short read, `Io` otherwise.
    pub(crate) fn from_read(err: std::io::Error, context: impl Into<String>) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            BitNetError::Truncated {
                context: context.into(),
            }
        } else {
            BitNetError::Io(err)
        }
    }

    pub(crate) fn shape(name: impl Into<String>, detail: impl Into<String>) -> Self {
        BitNetError::ShapeMismatch {
            name: name.into(),
            detail: detail.into(),
        }
    }
}
