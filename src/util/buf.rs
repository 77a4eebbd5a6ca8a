use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        bail!("string length {} exceeds remaining buffer ({} bytes)", len, buf.remaining());
    }

    let raw = buf.copy_to_bytes(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => bail!("invalid boolean value {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("broker-1")]
    #[case::multi_byte("größe")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        put_string(&mut buf, "tail");

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert_eq!(try_get_string(&mut b).unwrap(), "tail");
        assert!(b.is_empty());
    }

    #[test]
    fn test_string_length_beyond_buffer() {
        let mut buf = BytesMut::new();
        buf.put_usize_varint(10);
        buf.put_slice(b"abc");

        let mut b: &[u8] = &buf;
        assert!(try_get_string(&mut b).is_err());
    }

    #[rstest]
    #[case::f(&[0], Some(false))]
    #[case::t(&[1], Some(true))]
    #[case::invalid(&[2], None)]
    #[case::empty(&[], None)]
    fn test_try_get_bool(#[case] raw: &[u8], #[case] expected: Option<bool>) {
        let mut b = raw;
        assert_eq!(try_get_bool(&mut b).ok(), expected);
    }
}
