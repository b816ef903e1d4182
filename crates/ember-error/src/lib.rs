#![forbid(unsafe_code)]
//! Error types for EmberFS.
//!
//! EmberFS uses a two-layer error model: byte-level format violations are
//! `ParseError` (in `ember-types`, so the parsing layer stays independent
//! of this crate), and everything user-facing is `EmberError`. The store
//! crate converts `ParseError` into `EmberError::Corruption` at the point
//! where the flash location is known, so corruption reports always carry
//! LEB and offset context.
//!
//! Error taxonomy:
//!
//! | Variant | Meaning | Mount-fatal |
//! |---------|---------|-------------|
//! | `Io` | flash I/O failure, propagated unchanged | yes |
//! | `Corruption` | bad header, key order, child counts, duplicate replay sqnum | yes |
//! | `Format` | structurally invalid values before a location is known | yes |
//! | `NotFound` | lookup miss; an outcome, never corruption | no |
//! | `NoSpace` | allocation failure, ordinary error | no |
//! | `SeqnumExhausted` | sequence counter reached the reserved watermark | yes |
//! | `ReadOnly` | mutation attempted on a read-only mount | no |
//!
//! Dangling branches during replay are deliberately NOT an error variant:
//! they are a legitimate tri-state outcome of `try_read_node` consumed by
//! collision resolution.

use thiserror::Error;

/// Unified error type for all EmberFS index-core operations.
#[derive(Debug, Error)]
pub enum EmberError {
    /// Flash or host I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-flash corruption detected at a known location.
    #[error("corrupt node at LEB {leb}:{offset}: {detail}")]
    Corruption {
        leb: u32,
        offset: u32,
        detail: String,
    },

    /// Structurally invalid data before a flash location is known.
    #[error("invalid format: {0}")]
    Format(String),

    /// Key (or entry name) not present in the index.
    #[error("not found")]
    NotFound,

    /// No space left (allocation failure or full journal).
    #[error("no space left on device")]
    NoSpace,

    /// The global sequence counter reached the reserved watermark; the
    /// file system's life has ended.
    #[error("sequence number watermark reached")]
    SeqnumExhausted,

    /// Mutation attempted on a read-only mount.
    #[error("read-only file system")]
    ReadOnly,
}

impl EmberError {
    /// Convert to a POSIX errno for the VFS layer above this core.
    ///
    /// The match is exhaustive; adding a variant without assigning its
    /// errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::SeqnumExhausted => libc::EIO,
            Self::Format(_) => libc::EINVAL,
            Self::NotFound => libc::ENOENT,
            Self::NoSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// True for the outcomes a caller is expected to handle rather than
    /// abort on.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound | Self::NoSpace | Self::ReadOnly)
    }
}

/// Result alias using `EmberError`.
pub type Result<T> = std::result::Result<T, EmberError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(EmberError, libc::c_int)> = vec![
            (EmberError::Io(std::io::Error::other("test")), libc::EIO),
            (
                EmberError::Corruption {
                    leb: 3,
                    offset: 64,
                    detail: "bad CRC".into(),
                },
                libc::EIO,
            ),
            (EmberError::Format("bad geometry".into()), libc::EINVAL),
            (EmberError::NotFound, libc::ENOENT),
            (EmberError::NoSpace, libc::ENOSPC),
            (EmberError::SeqnumExhausted, libc::EIO),
            (EmberError::ReadOnly, libc::EROFS),
        ];
        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(EmberError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn recoverable_split() {
        assert!(EmberError::NotFound.is_recoverable());
        assert!(!EmberError::SeqnumExhausted.is_recoverable());
        assert!(!EmberError::Corruption {
            leb: 0,
            offset: 0,
            detail: String::new()
        }
        .is_recoverable());
    }

    #[test]
    fn display_formatting() {
        let err = EmberError::Corruption {
            leb: 12,
            offset: 4096,
            detail: "bad key order".into(),
        };
        assert_eq!(err.to_string(), "corrupt node at LEB 12:4096: bad key order");
        assert_eq!(EmberError::NotFound.to_string(), "not found");
    }
}
