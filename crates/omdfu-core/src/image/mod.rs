//! Firmware image file codec.
//!
//! A firmware binary is laid out as `[ImageHeader][image data]` with
//! an optional fixed-size image-state section at a known file offset.

pub mod header;
pub mod state;

pub use header::ImageHeader;
pub use state::{FwState, ImageState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageFormatError {
    #[error("Unsupported binary. Expected magic number of 0x{expected:08x}, found 0x{actual:08x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("Can't read a version {0} image header")]
    UnsupportedHeaderVersion(u8),

    #[error("Can't read a version {0} state header")]
    UnsupportedStateVersion(u8),

    #[error("File too small: {actual} bytes, minimum {minimum}")]
    FileTooSmall { actual: usize, minimum: usize },

    #[error("Unexpected id: '{0}'")]
    UnknownIdentifier(String),

    #[error("Unexpected target: '{0}'")]
    UnknownTarget(String),

    #[error("Unexpected state: '{0}'")]
    UnknownState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
