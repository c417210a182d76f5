// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The two capability traits the core consumes for key and value bytes,
//! per §9 of the design: a `Writer` emits bytes for a value and reports its
//! size, a `Reader` consumes bytes and builds a value back out of them.
//!
//! This replaces a reflection-heavy serializer hierarchy with two plain
//! traits; the core never inspects `K` or `V` beyond these two methods, so
//! any type a caller can encode to and decode from a flat byte slice works.

/// Emits a value's bytes and reports their length up front, so the core
/// can size an entry span before writing into it.
pub trait Writer {
    /// Exact number of bytes [`Writer::write_bytes`] will write.
    fn write_size(&self) -> usize;

    /// Writes this value's bytes into `buf`, which is exactly
    /// [`Writer::write_size`] bytes long.
    fn write_bytes(&self, buf: &mut [u8]);
}

/// Builds a value back out of its bytes.
pub trait Reader: Sized {
    /// Reconstructs a value from `buf`, the exact bytes [`Writer::write_bytes`]
    /// produced for it.
    fn read_bytes(buf: &[u8]) -> Self;
}

impl Writer for [u8] {
    fn write_size(&self) -> usize {
        self.len()
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }
}

impl Writer for &[u8] {
    fn write_size(&self) -> usize {
        self.len()
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }
}

impl Writer for Vec<u8> {
    fn write_size(&self) -> usize {
        self.len()
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }
}

impl Reader for Vec<u8> {
    fn read_bytes(buf: &[u8]) -> Self {
        buf.to_vec()
    }
}

impl Reader for Box<[u8]> {
    fn read_bytes(buf: &[u8]) -> Self {
        buf.into()
    }
}

impl Writer for Box<[u8]> {
    fn write_size(&self) -> usize {
        self.len()
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }
}

impl Writer for String {
    fn write_size(&self) -> usize {
        self.len()
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self.as_bytes());
    }
}

impl Reader for String {
    fn read_bytes(buf: &[u8]) -> Self {
        String::from_utf8_lossy(buf).into_owned()
    }
}

impl<const N: usize> Writer for [u8; N] {
    fn write_size(&self) -> usize {
        N
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }
}

impl<const N: usize> Reader for [u8; N] {
    fn read_bytes(buf: &[u8]) -> Self {
        let mut out = [0u8; N];
        out.copy_from_slice(buf);
        out
    }
}

macro_rules! impl_int_codec {
    ($t:ty) => {
        impl Writer for $t {
            fn write_size(&self) -> usize {
                std::mem::size_of::<$t>()
            }

            fn write_bytes(&self, buf: &mut [u8]) {
                buf.copy_from_slice(&self.to_le_bytes());
            }
        }

        impl Reader for $t {
            fn read_bytes(buf: &[u8]) -> Self {
                let mut arr = [0u8; std::mem::size_of::<$t>()];
                arr.copy_from_slice(buf);
                <$t>::from_le_bytes(arr)
            }
        }
    };
}

impl_int_codec!(u8);
impl_int_codec!(u16);
impl_int_codec!(u32);
impl_int_codec!(u64);
impl_int_codec!(i8);
impl_int_codec!(i16);
impl_int_codec!(i32);
impl_int_codec!(i64);

/// Writes `value` into a freshly allocated buffer sized to
/// [`Writer::write_size`].
pub(crate) fn encode<W: Writer + ?Sized>(value: &W) -> Vec<u8> {
    let mut buf = vec![0u8; value.write_size()];
    value.write_bytes(&mut buf);
    buf
}
