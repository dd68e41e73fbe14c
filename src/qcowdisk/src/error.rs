//! Error type shared by all layers of the engine.

use std::io;
use thiserror::Error;

/// Errors returned by image operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The header bytes do not describe a valid image.
    #[error("Malformed image header: {0}")]
    MalformedHeader(String),

    /// The header carries a format version other than 2 or 3.
    #[error("Unsupported qcow2 version {0}")]
    UnsupportedVersion(u32),

    /// The header extension area is truncated or carries undecodable data.
    #[error("Malformed header extension: {0}")]
    MalformedExtension(String),

    /// A metadata table (L1, L2, refcount table) contains an invalid entry.
    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),

    /// The image uses a feature this engine does not implement.
    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// The request itself is invalid (out of bounds, misaligned, bad options).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No free cluster is left below the addressable limit.
    #[error("No space left: all {limit} addressable clusters are in use")]
    NoSpace {
        /// Number of host clusters the image may address.
        limit: u64,
    },

    /// Attempted modification of an image opened read-only.
    #[error("Image is read-only")]
    ReadOnly,

    /// The backend failed.
    #[error("Backend I/O error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk structure contradicts itself (aliasing, refcount mismatch, double free).
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Prepend `context` to the message of message-carrying variants.
    ///
    /// I/O errors and variants without a message are returned as they are.
    pub(crate) fn context<C: std::fmt::Display>(self, context: C) -> Self {
        match self {
            Error::MalformedHeader(msg) => Error::MalformedHeader(format!("{context}: {msg}")),
            Error::MalformedExtension(msg) => {
                Error::MalformedExtension(format!("{context}: {msg}"))
            }
            Error::MalformedMetadata(msg) => Error::MalformedMetadata(format!("{context}: {msg}")),
            Error::Unsupported(msg) => Error::Unsupported(format!("{context}: {msg}")),
            Error::InvalidRequest(msg) => Error::InvalidRequest(format!("{context}: {msg}")),
            Error::ConsistencyViolation(msg) => {
                Error::ConsistencyViolation(format!("{context}: {msg}"))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_prepended_except_for_io() {
        let err = Error::MalformedMetadata(String::from("reserved bits set")).context("L1 table");
        assert_eq!(
            err.to_string(),
            "Malformed metadata: L1 table: reserved bits set"
        );

        let err = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"))
            .context("Reading L2 table");
        match err {
            Error::Io(err) => {
                assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
                assert_eq!(err.to_string(), "short read");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn no_space_mentions_limit() {
        let err = Error::NoSpace { limit: 42 };
        assert!(err.to_string().contains("42"));
    }
}
