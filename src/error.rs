use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `blitzfs` crate.
#[derive(Debug, Error)]
pub enum ImageError {
    /// An I/O error occurred, typically while reading a source file or writing the image.
    /// Includes the path where the error happened (empty when not known).
    #[error("I/O error on path '{}': {source}", path.display())]
    Io { source: std::io::Error, path: PathBuf },

    /// The image is structurally invalid or truncated.
    #[error("corrupt image: {0}")]
    Corrupt(String),

    /// The image uses a feature or version this build cannot handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A required buffer could not be allocated.
    #[error("out of memory while allocating pipeline buffers")]
    OutOfMemory,

    /// The operation was cancelled by an interrupt.
    #[error("interrupted")]
    Interrupted,

    /// The requested build or extract options are inconsistent.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The codec failed to compress or decompress a block.
    #[error("compression error: {0}")]
    Compression(String),

    /// A wrapper for any other error that doesn't fit the specific variants.
    #[error("an unexpected error occurred: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = ImageError> = std::result::Result<T, E>;

impl ImageError {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ImageError::Io { source, path: path.into() }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        ImageError::Corrupt(msg.into())
    }

    /// Process exit code for this error when it reaches the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ImageError::Interrupted => 130,
            _ => 1,
        }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for ImageError {
    fn from(err: std::io::Error) -> Self {
        ImageError::Io { source: err, path: PathBuf::new() }
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        ImageError::Other(Box::new(err))
    }
}
