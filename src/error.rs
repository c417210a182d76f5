// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur while operating a map
#[derive(Debug)]
pub enum Error {
    /// The region's header magic or sanity checks did not pass on open
    CorruptFormat(&'static str),

    /// The region was written by a format version this build cannot read;
    /// carries the raw, offending version number read from the header, for
    /// a caller that wants to report it
    IncompatibleVersion(u32),

    /// An insert would have exceeded `max_bloat_factor` for a segment
    CapacityExhausted,

    /// An entry's stored checksum did not match its recomputed checksum
    ///
    /// Reserved for explicit verification call sites; recovery itself
    /// discards mismatching entries rather than erroring (see
    /// [`crate::recovery`]), and [`crate::query::EntryHandle::check_sum`]
    /// reports a mismatch as a boolean, per §4.6. Never returned on the
    /// read path under normal operation.
    ChecksumMismatch,

    /// The segment is flagged `MAYBE_INCONSISTENT` and the caller did not
    /// open with recovery
    Poisoned,

    /// An illegal re-entrant lock upgrade was attempted
    Deadlock,

    /// Self-describing recovery could not trust the header
    RecoveryFailed,

    /// Underlying mmap, flush, or file-extension operation failed
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CorruptFormat(reason) => write!(f, "corrupt format: {reason}"),
            Self::IncompatibleVersion(v) => write!(f, "incompatible format version: {v}"),
            Self::CapacityExhausted => write!(f, "segment capacity exhausted"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::Poisoned => write!(f, "segment is poisoned, recovery required"),
            Self::Deadlock => write!(f, "illegal re-entrant lock upgrade"),
            Self::RecoveryFailed => write!(f, "self-describing recovery failed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
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

/// Map result
pub type Result<T> = std::result::Result<T, Error>;
