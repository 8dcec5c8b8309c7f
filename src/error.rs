// src/error.rs
use std::io;

use thiserror::Error;

use crate::transport::{SessionState, TagFamily};

pub type Result<T> = std::result::Result<T, Error>;

/// Failure to load the retail key file. Fatal at startup.
#[derive(Debug, Error)]
pub enum KeyLoadError {
    #[error("could not read key file: {0}")]
    Io(#[from] io::Error),
    #[error("key file must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("{key} key declares {len} magic bytes (max 16)")]
    MagicLength { key: &'static str, len: u8 },
    #[error("{key} key type string is not NUL-terminated")]
    TypeString { key: &'static str },
}

/// Failure reported by the radio driver for a single command.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("tag session lost")]
    SessionLost,
    #[error("tag NAK {0:#04x}")]
    Nak(u8),
    #[error("reader status {0:02X} {1:02X}")]
    Status(u8, u8),
    #[error("bad command checksum")]
    Checksum,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error(transparent)]
    Pcsc(#[from] pcsc::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("key error: {0}")]
    KeyLoad(#[from] KeyLoadError),

    /// Strict-mode signal; `unpack` itself reports verification as a flag.
    #[error("amiibo signature mismatch")]
    VerificationMismatch,

    #[error("unsupported tag family: {0:?}")]
    UnsupportedTagFamily(TagFamily),

    /// A page command failed. A write that stops here leaves the tag with a
    /// mix of old and new pages; there is no rollback on this hardware.
    #[error("exchange failed at page {page} (last completed: {last_completed:?}): {source}")]
    Exchange {
        page: u8,
        last_completed: Option<u8>,
        #[source]
        source: ExchangeError,
    },

    #[error("unexpected {len}-byte response at page {page}")]
    UnexpectedResponse { page: u8, len: usize },

    #[error("buffer must be {expected} bytes, got {actual}")]
    MalformedBufferLength { expected: usize, actual: usize },

    #[error("operation not allowed in session state {0:?}")]
    SessionState(SessionState),

    #[error("page {0} is outside user memory")]
    PageOutOfRange(u8),

    #[error("invalid image name: {0:?}")]
    ImageName(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Page index carried by paged transport failures.
    pub fn page(&self) -> Option<u8> {
        match self {
            Error::Exchange { page, .. } | Error::UnexpectedResponse { page, .. } => Some(*page),
            Error::PageOutOfRange(page) => Some(*page),
            _ => None,
        }
    }
}
