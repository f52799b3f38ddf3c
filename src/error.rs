//! Error taxonomy shared by every subsystem.
//!
//! The marker codec, tier-1/tier-2 coders, rate control and the tile
//! processor all report failures through `CodecError`. Exceptions are never
//! used for control flow (see DESIGN.md); a fallible operation always
//! returns `Result<T, CodecError>` and the tile processor is the boundary
//! where a single tile's error is turned into a log warning so that other
//! tiles can still be attempted.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad marker: {0}")]
    BadMarker(String),

    #[error("bad packet: {0}")]
    BadPacket(String),

    #[error("profile violation: {0}")]
    BadProfile(String),

    #[error("window of interest out of range: {0}")]
    OutOfRange(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = core::result::Result<T, CodecError>;

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e.to_string())
    }
}
