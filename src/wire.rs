//! Bounds-checked little-endian reads over untrusted buffers.

use crate::error::{CodecError, CodecResult};

/// Returns `buf[offset..offset + len]` or a truncation error. Never panics.
#[inline]
pub fn slice_at<'a>(
    buf: &'a [u8],
    offset: usize,
    len: usize,
    field: &'static str,
) -> CodecResult<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or(CodecError::Truncated {
            field,
            offset,
            need: len,
            len: buf.len(),
        })
}

#[inline]
pub fn array_at<const N: usize>(
    buf: &[u8],
    offset: usize,
    field: &'static str,
) -> CodecResult<[u8; N]> {
    let bytes = slice_at(buf, offset, N, field)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn u16_at(buf: &[u8], offset: usize, field: &'static str) -> CodecResult<u16> {
    array_at::<2>(buf, offset, field).map(u16::from_le_bytes)
}

#[inline]
pub fn u32_at(buf: &[u8], offset: usize, field: &'static str) -> CodecResult<u32> {
    array_at::<4>(buf, offset, field).map(u32::from_le_bytes)
}

#[inline]
pub fn u64_at(buf: &[u8], offset: usize, field: &'static str) -> CodecResult<u64> {
    array_at::<8>(buf, offset, field).map(u64::from_le_bytes)
}

#[inline]
pub fn i64_at(buf: &[u8], offset: usize, field: &'static str) -> CodecResult<i64> {
    array_at::<8>(buf, offset, field).map(i64::from_le_bytes)
}

pub fn expect_magic(buf: &[u8], expected: &[u8; 4]) -> CodecResult<()> {
    let found = array_at::<4>(buf, 0, "magic")?;
    if &found != expected {
        return Err(CodecError::BadMagic {
            expected: *expected,
            found,
        });
    }
    Ok(())
}

/// Converts an on-disk u64 offset into a usize that lies within `buf_len`.
pub fn offset_within(offset: u64, buf_len: usize, what: &'static str) -> CodecResult<usize> {
    match usize::try_from(offset) {
        Ok(off) if off <= buf_len => Ok(off),
        _ => Err(CodecError::OutOfBounds {
            what,
            offset,
            len: 0,
            buf_len,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_little_endian() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(u16_at(&buf, 0, "x").unwrap(), 0x0201);
        assert_eq!(u32_at(&buf, 4, "x").unwrap(), 0x0807_0605);
        assert_eq!(u64_at(&buf, 0, "x").unwrap(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn test_read_past_end_is_error() {
        let buf = [0u8; 6];
        assert!(matches!(
            u64_at(&buf, 0, "base"),
            Err(CodecError::Truncated { field: "base", .. })
        ));
        assert!(u16_at(&buf, usize::MAX, "x").is_err());
    }

    #[test]
    fn test_magic_mismatch() {
        let err = expect_magic(b"ABCDxx", b"GNC2").unwrap_err();
        assert_eq!(
            err,
            CodecError::BadMagic {
                expected: *b"GNC2",
                found: *b"ABCD"
            }
        );
    }
}
