// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Errors that can occur anywhere in the store.
///
/// Mirrors the host surface's error kinds (§7): `NotFound`, `Corruption`,
/// `InvalidArgument`, `IOError`, `NotSupported`. There is no explicit `OK`
/// variant; that role is played by `Result::Ok`.
#[derive(Debug)]
pub enum Error {
    /// I/O error talking to the [`Env`](crate::env::Env).
    Io(std::io::Error),

    /// A key was not present, or was masked by a deletion at the requested version.
    NotFound,

    /// On-disk data failed a structural or checksum check.
    Corruption(String),

    /// An option or call argument was out of range or unrecognized.
    InvalidArgument(String),

    /// The operation is not implemented by this layer.
    ///
    /// `Prev` on the low-level LSM table iterator and `SeekToLast` on the
    /// low-level LSM table iterator surface this; upper layers provide both
    /// by construction (§7).
    NotSupported(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::NotFound => write!(f, "not found"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::NotSupported(what) => write!(f, "not supported: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Io(value.0)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::Io(e) => Self::Io(e),
            DecodeError::InvalidTag(what) => {
                Self::Corruption(format!("invalid tag for {what}"))
            }
            DecodeError::InvalidMagic => Self::Corruption("bad magic number".into()),
            DecodeError::ChecksumMismatch { expected, got } => Self::Corruption(format!(
                "checksum mismatch: expected {expected:#x}, got {got:#x}"
            )),
        }
    }
}

/// Store-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
