use bytes::{BufMut as _, Bytes, BytesMut};
use num_bigint_dig::BigUint;

/// Encoder of SSH payloads (low level API).
///
/// Writes the data types from RFC 4251, section 5 into a growable [`BytesMut`].
#[derive(Debug, Clone, Default)]
pub struct PacketEncode {
    buf: BytesMut,
}

impl PacketEncode {
    /// Creates an empty encoder.
    pub fn new() -> PacketEncode {
        PacketEncode { buf: BytesMut::new() }
    }

    /// Encode a `byte`.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Encode a `boolean`.
    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Encode a `uint32`.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Encode a `string` from raw bytes.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.reserve(4 + value.len());
        self.buf.put_u32(encode_len(value.len()));
        self.buf.put_slice(value);
    }

    /// Encode a `string` from UTF-8 text.
    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes())
    }

    /// Encode a `name-list`.
    pub fn put_name_list(&mut self, names: &[&str]) {
        let total_len = names.iter().map(|name| name.len() + 1).sum::<usize>().saturating_sub(1);
        self.buf.reserve(4 + total_len);
        self.buf.put_u32(encode_len(total_len));
        for (i, name) in names.iter().enumerate() {
            if i > 0 { self.buf.put_u8(b',') }
            self.buf.put_slice(name.as_bytes());
        }
    }

    /// Encode a non-negative `mpint` given by its big endian digits.
    ///
    /// Leading zeros are stripped and a zero byte is prepended if the highest bit is set, so that
    /// the number is not interpreted as negative.
    pub fn put_mpint_uint_be(&mut self, digits_be: &[u8]) {
        let first_nonzero = digits_be.iter().position(|&x| x != 0).unwrap_or(digits_be.len());
        let digits = &digits_be[first_nonzero..];
        let sign_pad = matches!(digits.first(), Some(&x) if x & 0x80 != 0);
        self.buf.put_u32(encode_len(digits.len() + usize::from(sign_pad)));
        if sign_pad { self.buf.put_u8(0) }
        self.buf.put_slice(digits);
    }

    /// Encode a `mpint` from a [`BigUint`].
    pub fn put_biguint(&mut self, value: &BigUint) {
        self.put_mpint_uint_be(&value.to_bytes_be())
    }

    /// Append raw bytes.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Unwraps the internal buffer.
    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    /// Unwraps and freezes the internal buffer.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

fn encode_len(len: usize) -> u32 {
    u32::try_from(len).expect("encoded string does not fit into uint32")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(f: impl FnOnce(&mut PacketEncode)) -> Vec<u8> {
        let mut e = PacketEncode::new();
        f(&mut e);
        e.finish().to_vec()
    }

    #[test]
    fn test_put_scalars() {
        assert_eq!(encoded(|e| { e.put_u8(7); e.put_bool(true); e.put_bool(false) }), [7, 1, 0]);
        assert_eq!(encoded(|e| e.put_u32(0x0102_0304)), [1, 2, 3, 4]);
    }

    #[test]
    fn test_put_str() {
        assert_eq!(encoded(|e| e.put_str("")), [0, 0, 0, 0]);
        assert_eq!(encoded(|e| e.put_str("ssh")), [0, 0, 0, 3, b's', b's', b'h']);
    }

    #[test]
    fn test_put_name_list() {
        assert_eq!(encoded(|e| e.put_name_list(&[])), [0, 0, 0, 0]);
        assert_eq!(encoded(|e| e.put_name_list(&["zlib"])), b"\0\0\0\x04zlib");
        assert_eq!(encoded(|e| e.put_name_list(&["zlib", "none"])), b"\0\0\0\x09zlib,none");
    }

    #[test]
    fn test_put_mpint() {
        // examples from RFC 4251, section 5
        assert_eq!(encoded(|e| e.put_mpint_uint_be(&[])), [0, 0, 0, 0]);
        assert_eq!(encoded(|e| e.put_mpint_uint_be(&[0, 0])), [0, 0, 0, 0]);
        assert_eq!(
            encoded(|e| e.put_mpint_uint_be(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7])),
            [0, 0, 0, 8, 0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7],
        );
        assert_eq!(encoded(|e| e.put_mpint_uint_be(&[0x80])), [0, 0, 0, 2, 0x00, 0x80]);
        assert_eq!(encoded(|e| e.put_mpint_uint_be(&[0, 0, 0x7f, 1])), [0, 0, 0, 2, 0x7f, 1]);
        assert_eq!(
            encoded(|e| e.put_biguint(&BigUint::from(0xdead_u32))),
            [0, 0, 0, 3, 0x00, 0xde, 0xad],
        );
    }
}
