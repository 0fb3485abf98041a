//! Crate-wide error type with frozen integer codes.
//!
//! The code list is closed: every failure an embedder can observe maps to
//! exactly one variant, and every variant carries a stable integer value
//! that C-ABI wrappers return unchanged.  New variants may be appended;
//! existing values are NEVER renumbered.
//!
//! Two variants are flow control rather than failure:
//! - [`Error::Empty`] terminates iteration (end of a chunk list, end of
//!   file).  Loops match on it and stop.
//! - [`Error::TooBig`] tells the caller a supplied buffer is too small;
//!   re-allocate and retry.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid caller input; the call had no side effects.
    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),

    #[error("out of memory: {0}")]
    NotEnoughMemory(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested source, signal, or chunk does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A definition with this id already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// End of iteration — a normal loop terminator, not a failure.
    #[error("empty")]
    Empty,

    /// The supplied buffer is too small; the caller should re-allocate.
    #[error("buffer too small: need {need}, have {have}")]
    TooBig { need: usize, have: usize },

    /// A stored CRC32C did not validate.
    #[error("integrity check failed: {0}")]
    MessageIntegrity(String),

    /// The file is not a JLS file or its major version is unsupported.
    #[error("unsupported file: {0}")]
    UnsupportedFile(String),

    /// The file ends mid-chunk.
    #[error("truncated file: {0}")]
    Truncated(String),

    /// The threaded writer's message ring is full (DROP_ON_OVERFLOW set).
    #[error("message ring full")]
    Busy,

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Stable integer code; 0 is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Error::ParameterInvalid(_) => 1,
            Error::NotEnoughMemory(_)  => 2,
            Error::Io(_)               => 3,
            Error::NotFound(_)         => 4,
            Error::AlreadyExists(_)    => 5,
            Error::Empty               => 6,
            Error::TooBig { .. }       => 7,
            Error::MessageIntegrity(_) => 8,
            Error::UnsupportedFile(_)  => 9,
            Error::Truncated(_)        => 10,
            Error::Busy                => 11,
            Error::TimedOut(_)         => 12,
            Error::NotSupported(_)     => 13,
        }
    }

    /// True for the end-of-iteration sentinel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Error::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_frozen() {
        assert_eq!(Error::ParameterInvalid(String::new()).code(), 1);
        assert_eq!(Error::Empty.code(), 6);
        assert_eq!(Error::TooBig { need: 8, have: 0 }.code(), 7);
        assert_eq!(Error::MessageIntegrity(String::new()).code(), 8);
        assert_eq!(Error::Busy.code(), 11);
        assert_eq!(Error::NotSupported(String::new()).code(), 13);
    }

    #[test]
    fn io_errors_convert() {
        let e: Error = io::Error::new(io::ErrorKind::Other, "disk on fire").into();
        assert_eq!(e.code(), 3);
    }
}
