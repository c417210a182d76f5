// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Maximum sane `max_bloat_factor`; values above this are a contract violation
/// per the header's own documentation, not merely a sloppy default.
pub const MAX_SANE_BLOAT_FACTOR: f32 = 10.0;

/// Self-describing, creation-time configuration of a [`crate::CMap`].
///
/// This is serialized verbatim into the header's configuration blob and is
/// never rewritten afterwards, except by recovery when the caller asserts
/// a replacement configuration (see [`crate::recovery`]).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    /// Number of segments; determines the concurrency ceiling (N segments
    /// allow up to N disjoint writers) and the low bits used for segment
    /// selection. Must be a power of two.
    pub segments: u32,

    /// Primary tier capacity, in entries, of every segment.
    pub entries_per_segment: u32,

    /// Byte hint for average key size, used to size the primary tier when
    /// `constant_key_size` is unset.
    pub average_key_size: u32,

    /// Byte hint for average value size, used to size the primary tier when
    /// `constant_value_size` is unset.
    pub average_value_size: u32,

    /// If set, every key is exactly this many bytes and entries use a
    /// fixed-stride layout for the key portion.
    pub constant_key_size: Option<u32>,

    /// If set, every value is exactly this many bytes; enables the
    /// fixed-size-value fast path for in-place overwrites.
    pub constant_value_size: Option<u32>,

    /// Whether each entry carries a 32-bit checksum over its key and value
    /// bytes. Defaults to `true` for file-backed regions, `false` for
    /// purely in-memory ones (see [`ConfigBuilder::finish`]).
    pub checksum_entries: bool,

    /// Maximum multiple of `entries_per_segment` a segment may reach by
    /// chaining extra tiers.
    pub max_bloat_factor: f32,
}

impl Config {
    /// Starts a new configuration builder.
    #[must_use]
    pub fn builder(entries_per_segment: u32) -> ConfigBuilder {
        ConfigBuilder::new(entries_per_segment)
    }

    /// Returns the byte size of one primary tier, given the configured
    /// (or hinted) key and value sizes.
    #[must_use]
    pub fn tier_capacity_bytes(&self) -> usize {
        let key_size = self.constant_key_size.unwrap_or(self.average_key_size) as usize;
        let value_size = self
            .constant_value_size
            .unwrap_or(self.average_value_size) as usize;

        // Per-entry overhead: size varints (worst-case 5 bytes each) plus an
        // optional 4-byte checksum.
        let overhead = 5 + 5 + if self.checksum_entries { 4 } else { 0 };

        self.entries_per_segment as usize * (key_size + value_size + overhead)
    }

    /// Returns the maximum number of tiers (primary + extra) a segment may
    /// ever hold, rounded up.
    #[must_use]
    pub fn max_tiers_per_segment(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            self.max_bloat_factor.max(1.0).ceil() as u32
        }
    }

    pub(crate) fn sanity_check(&self) -> bool {
        self.segments > 0
            && self.segments.is_power_of_two()
            && self.entries_per_segment > 0
            && self.max_bloat_factor >= 1.0
            && self.max_bloat_factor <= MAX_SANE_BLOAT_FACTOR
    }
}

impl Encode for Config {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(self.segments)?;
        writer.write_u32::<LittleEndian>(self.entries_per_segment)?;
        writer.write_u32::<LittleEndian>(self.average_key_size)?;
        writer.write_u32::<LittleEndian>(self.average_value_size)?;
        writer.write_u32::<LittleEndian>(self.constant_key_size.unwrap_or(0))?;
        writer.write_u32::<LittleEndian>(self.constant_value_size.unwrap_or(0))?;
        writer.write_u8(u8::from(self.checksum_entries))?;
        writer.write_f32::<LittleEndian>(self.max_bloat_factor)?;
        Ok(())
    }
}

impl Decode for Config {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, crate::Error> {
        let segments = reader.read_u32::<LittleEndian>()?;
        let entries_per_segment = reader.read_u32::<LittleEndian>()?;
        let average_key_size = reader.read_u32::<LittleEndian>()?;
        let average_value_size = reader.read_u32::<LittleEndian>()?;
        let constant_key_size = reader.read_u32::<LittleEndian>()?;
        let constant_value_size = reader.read_u32::<LittleEndian>()?;
        let checksum_entries = reader.read_u8()? != 0;
        let max_bloat_factor = reader.read_f32::<LittleEndian>()?;

        Ok(Self {
            segments,
            entries_per_segment,
            average_key_size,
            average_value_size,
            constant_key_size: (constant_key_size > 0).then_some(constant_key_size),
            constant_value_size: (constant_value_size > 0).then_some(constant_value_size),
            checksum_entries,
            max_bloat_factor,
        })
    }
}

/// Builder for [`Config`].
///
/// ```
/// use cmap::Config;
///
/// let config = Config::builder(1_024)
///     .segments(16)
///     .checksum_entries(true)
///     .max_bloat_factor(2.0)
///     .finish(/* file_backed */ true);
/// ```
pub struct ConfigBuilder {
    segments: u32,
    entries_per_segment: u32,
    average_key_size: u32,
    average_value_size: u32,
    constant_key_size: Option<u32>,
    constant_value_size: Option<u32>,
    checksum_entries: Option<bool>,
    max_bloat_factor: f32,
}

impl ConfigBuilder {
    fn new(entries_per_segment: u32) -> Self {
        Self {
            segments: 1,
            entries_per_segment,
            average_key_size: 16,
            average_value_size: 16,
            constant_key_size: None,
            constant_value_size: None,
            checksum_entries: None,
            max_bloat_factor: 1.0,
        }
    }

    /// Sets the number of segments. Must be a power of two.
    #[must_use]
    pub fn segments(mut self, segments: u32) -> Self {
        self.segments = segments;
        self
    }

    /// Sets the average key size hint, in bytes.
    #[must_use]
    pub fn average_key_size(mut self, bytes: u32) -> Self {
        self.average_key_size = bytes;
        self
    }

    /// Sets the average value size hint, in bytes.
    #[must_use]
    pub fn average_value_size(mut self, bytes: u32) -> Self {
        self.average_value_size = bytes;
        self
    }

    /// Fixes every key to exactly `bytes`, enabling the fixed-stride key layout.
    #[must_use]
    pub fn constant_key_size(mut self, bytes: u32) -> Self {
        self.constant_key_size = Some(bytes);
        self
    }

    /// Fixes every value to exactly `bytes`, enabling the in-place overwrite
    /// fast path.
    #[must_use]
    pub fn constant_value_size(mut self, bytes: u32) -> Self {
        self.constant_value_size = Some(bytes);
        self
    }

    /// Explicitly sets whether entries carry a checksum. If left unset,
    /// [`ConfigBuilder::finish`] defaults this to whether the region is
    /// file-backed.
    #[must_use]
    pub fn checksum_entries(mut self, enabled: bool) -> Self {
        self.checksum_entries = Some(enabled);
        self
    }

    /// Sets the maximum multiple of `entries_per_segment` a segment may
    /// grow to via extra tiers.
    #[must_use]
    pub fn max_bloat_factor(mut self, factor: f32) -> Self {
        self.max_bloat_factor = factor;
        self
    }

    /// Finalizes the configuration.
    ///
    /// `file_backed` supplies the default for `checksum_entries` when the
    /// caller did not explicitly request a value.
    #[must_use]
    pub fn finish(self, file_backed: bool) -> Config {
        Config {
            segments: self.segments,
            entries_per_segment: self.entries_per_segment,
            average_key_size: self.average_key_size,
            average_value_size: self.average_value_size,
            constant_key_size: self.constant_key_size,
            constant_value_size: self.constant_value_size,
            checksum_entries: self.checksum_entries.unwrap_or(file_backed),
            max_bloat_factor: self.max_bloat_factor,
        }
    }
}
