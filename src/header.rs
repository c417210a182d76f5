// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The store's header: the first bytes of the mapped region, holding the
//! self-describing configuration. Written once on `create`, never rewritten
//! during normal operation; only on initial creation, on configuration-
//! preserving recovery, or on bloat-resize.

use crate::coding::{Decode, Encode};
use crate::config::Config;
use crate::format_version::FormatVersion;
use crate::{time, Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Magic bytes identifying a `cmap` region.
pub const MAGIC: [u8; 4] = *b"CMAP";

/// Fixed, 4 KiB-aligned size of the header region. Segment headers begin
/// immediately after this offset regardless of how large the actual config
/// blob is.
pub const HEADER_SIZE: usize = 4096;

/// Byte length of the library version stamp embedded in the header.
pub const LIBRARY_STAMP_SIZE: usize = 16;

fn library_stamp() -> [u8; LIBRARY_STAMP_SIZE] {
    let version = env!("CARGO_PKG_VERSION").as_bytes();
    let mut stamp = [0u8; LIBRARY_STAMP_SIZE];
    let len = version.len().min(LIBRARY_STAMP_SIZE);
    stamp[..len].copy_from_slice(&version[..len]);
    stamp
}

/// The parsed header, as described in the on-disk format table.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    /// Format version this region was created with.
    pub format_version: FormatVersion,

    /// Library version stamp at creation time, used only diagnostically by
    /// recovery.
    pub library_stamp: [u8; LIBRARY_STAMP_SIZE],

    /// Creation time, in milliseconds since the unix epoch.
    pub creation_epoch_ms: u64,

    /// The self-describing configuration this region was created with.
    pub config: Config,
}

impl Header {
    /// Builds a fresh header for a brand-new region.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            format_version: FormatVersion::V1,
            library_stamp: library_stamp(),
            creation_epoch_ms: time::unix_timestamp_millis(),
            config,
        }
    }

    /// Serializes the header into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`] or if the config blob
    /// does not fit within it; callers size the config generously (tens of
    /// bytes) relative to the 4 KiB budget.
    pub fn write_into(&self, buf: &mut [u8]) -> Result<()> {
        assert!(buf.len() >= HEADER_SIZE, "header buffer too small");

        let config_blob = self.config.encode_into_vec();
        assert!(
            36 + config_blob.len() <= HEADER_SIZE,
            "config blob does not fit in header"
        );

        let mut cursor = &mut buf[..HEADER_SIZE];
        cursor.write_all(&MAGIC)?;
        cursor.write_u32::<LittleEndian>(self.format_version.into())?;
        cursor.write_all(&self.library_stamp)?;
        cursor.write_u64::<LittleEndian>(self.creation_epoch_ms)?;
        cursor.write_u32::<LittleEndian>(config_blob.len() as u32)?;
        cursor.write_all(&config_blob)?;

        Ok(())
    }

    /// Parses a header out of the first [`HEADER_SIZE`] bytes of `buf`,
    /// running the sanity checks described in §4.1.
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::CorruptFormat("region shorter than header size"));
        }

        let mut cursor = &buf[..HEADER_SIZE];

        let mut magic = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut magic)?;
        if magic != MAGIC {
            return Err(Error::CorruptFormat("magic mismatch"));
        }

        let raw_version = cursor.read_u32::<LittleEndian>()?;
        let format_version =
            FormatVersion::try_from(raw_version).map_err(|()| Error::IncompatibleVersion(raw_version))?;

        let mut library_stamp = [0u8; LIBRARY_STAMP_SIZE];
        std::io::Read::read_exact(&mut cursor, &mut library_stamp)?;

        let creation_epoch_ms = cursor.read_u64::<LittleEndian>()?;

        let config_len = cursor.read_u32::<LittleEndian>()? as usize;
        if 36 + config_len > HEADER_SIZE {
            return Err(Error::CorruptFormat("config blob length out of range"));
        }

        let config = Config::decode_from(&mut &cursor[..config_len])?;

        if !config.sanity_check() {
            return Err(Error::CorruptFormat("config failed sanity check"));
        }

        Ok(Self {
            format_version,
            library_stamp,
            creation_epoch_ms,
            config,
        })
    }

    /// Rewrites the header in place, used only by same-configuration
    /// recovery when the existing header failed its sanity check.
    pub fn rewrite(region_bytes: &mut [u8], config: Config) -> Result<Self> {
        let header = Self::new(config);
        header.write_into(region_bytes)?;
        Ok(header)
    }
}

use std::io::Write as _;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let config = Config::builder(128).segments(8).finish(true);
        let header = Header::new(config);

        let mut buf = vec![0u8; HEADER_SIZE];
        header.write_into(&mut buf).unwrap();

        let parsed = Header::read_from(&buf).unwrap();
        assert_eq!(parsed.config, config);
        assert_eq!(parsed.format_version, FormatVersion::V1);
    }

    #[test]
    fn stamps_creation_time_at_construction() {
        time::set_unix_timestamp_for_test(Some(1_700_000_000_000));
        let config = Config::builder(16).segments(1).finish(false);
        let header = Header::new(config);
        time::set_unix_timestamp_for_test(None);

        assert_eq!(header.creation_epoch_ms, 1_700_000_000_000);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; HEADER_SIZE];
        assert!(matches!(
            Header::read_from(&buf),
            Err(Error::CorruptFormat(_))
        ));
    }

    #[test]
    fn incompatible_version_carries_the_actual_offending_value() {
        let config = Config::builder(16).segments(1).finish(false);
        let header = Header::new(config);
        let mut buf = vec![0u8; HEADER_SIZE];
        header.write_into(&mut buf).unwrap();

        buf[4..8].copy_from_slice(&255u32.to_le_bytes());

        match Header::read_from(&buf) {
            Err(Error::IncompatibleVersion(v)) => assert_eq!(v, 255),
            other => panic!("expected IncompatibleVersion(255), got {other:?}"),
        }
    }
}
