//! Typed views over decompressed stream bytes. Little-endian hosts get
//! zero-copy casts when alignment allows; everything else falls back to an
//! owned, byte-swapped copy. The wire format itself is little-endian only.

use std::borrow::Cow;
use std::mem;

use thiserror::Error;

#[remain::sorted]
#[derive(Error, Debug)]
pub enum Err {
    #[error("stream {stream}: length {len} is not a multiple of the {elem_size}-byte element size")]
    Misaligned {
        stream: &'static str,
        len: usize,
        elem_size: usize,
    },
}

/// A wire element: plain-old-data with a defined little-endian byte form.
pub(crate) trait Element: bytemuck::Pod {
    fn from_le(chunk: &[u8]) -> Self;
}

impl Element for u8 {
    fn from_le(chunk: &[u8]) -> Self {
        chunk[0]
    }
}

impl Element for i8 {
    fn from_le(chunk: &[u8]) -> Self {
        chunk[0] as i8
    }
}

impl Element for u16 {
    fn from_le(chunk: &[u8]) -> Self {
        u16::from_le_bytes([chunk[0], chunk[1]])
    }
}

impl Element for u32 {
    fn from_le(chunk: &[u8]) -> Self {
        u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
    }
}

impl Element for f32 {
    fn from_le(chunk: &[u8]) -> Self {
        f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
    }
}

/// Reinterprets `bytes` as a slice of `T`, borrowing when possible.
pub(crate) fn typed_view<'a, T: Element>(
    bytes: &'a [u8],
    stream: &'static str,
) -> Result<Cow<'a, [T]>, Err> {
    let elem_size = mem::size_of::<T>();
    if bytes.len() % elem_size != 0 {
        return Err(Err::Misaligned {
            stream,
            len: bytes.len(),
            elem_size,
        });
    }

    #[cfg(target_endian = "little")]
    if let Ok(slice) = bytemuck::try_cast_slice::<u8, T>(bytes) {
        return Ok(Cow::Borrowed(slice));
    }

    Ok(Cow::Owned(
        bytes.chunks_exact(elem_size).map(T::from_le).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_view_reads_little_endian() {
        let bytes = [0x01, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00];
        let view = typed_view::<u32>(&bytes, "test").unwrap();
        assert_eq!(&*view, &[1, 255]);
    }

    #[test]
    fn ragged_length_is_rejected() {
        let bytes = [0u8; 7];
        assert!(typed_view::<u32>(&bytes, "test").is_err());
        assert!(typed_view::<u16>(&bytes, "test").is_err());
        assert!(typed_view::<u8>(&bytes, "test").is_ok());
    }

    #[test]
    fn i8_view_preserves_sign() {
        let bytes = [0x7f, 0x81];
        let view = typed_view::<i8>(&bytes, "test").unwrap();
        assert_eq!(&*view, &[127, -127]);
    }
}
