use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Upper bound for a single length-prefixed string inside a frame. The frame itself is bounded
///  separately, this only guards against lengths that do not fit into the remaining buffer.
pub const MAX_STRING_LEN: usize = u32::MAX as usize;

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    assert!(s.len() <= MAX_STRING_LEN, "string too long for a u32 length prefix");
    buf.put_u32_le(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
}

/// Reads a u32 LE length prefix and checks it against the bytes that are actually available
pub fn try_get_len(buf: &mut impl Buf) -> anyhow::Result<usize> {
    let len: usize = buf.try_get_u32_le()?.safe_cast();
    if len > buf.remaining() {
        bail!("length prefix {} exceeds the {} remaining bytes", len, buf.remaining());
    }
    Ok(len)
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = try_get_len(buf)?;
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(String::from_utf8(result)?)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty("", b"\0\0\0\0")]
    #[case::ascii("abc", b"\x03\0\0\0abc")]
    #[case::utf8("ä", b"\x02\0\0\0\xc3\xa4")]
    fn test_put_string(#[case] s: &str, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::complete(b"\x03\0\0\0abc", Some("abc"), b"")]
    #[case::remainder(b"\x01\0\0\0xyz", Some("x"), b"yz")]
    #[case::truncated_len(b"\x01\0", None, b"")]
    #[case::truncated_data(b"\x05\0\0\0abc", None, b"")]
    #[case::invalid_utf8(b"\x01\0\0\0\xff", None, b"")]
    fn test_try_get_string(#[case] mut buf: &[u8], #[case] expected: Option<&str>, #[case] buf_after: &[u8]) {
        match try_get_string(&mut buf) {
            Ok(s) => {
                assert_eq!(Some(s.as_str()), expected);
                assert_eq!(buf, buf_after);
            }
            Err(_) => assert!(expected.is_none()),
        }
    }
}
