use bytes::{Buf as _, Bytes};
use num_bigint_dig::BigUint;
use crate::error::{Error, Result};

/// Decoder of SSH payloads (low level API).
///
/// Reads the data types from RFC 4251, section 5 from a [`Bytes`] buffer. Every getter fails with
/// [`Error::Decode`] if the payload is too short, so a truncated packet from the peer never
/// panics.
#[derive(Debug, Clone)]
pub struct PacketDecode {
    orig_buf: Bytes,
    buf: Bytes,
}

impl PacketDecode {
    /// Wraps the bytes for decoding.
    pub fn new(buf: Bytes) -> PacketDecode {
        PacketDecode { orig_buf: buf.clone(), buf }
    }

    /// Decode a `byte`.
    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Decode a `boolean`.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Decode a `uint32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Decode a `string` as raw bytes.
    pub fn get_bytes(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.get_raw(len)
    }

    /// Decode a `string` that must have exactly `N` bytes.
    pub fn get_byte_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.get_bytes()?;
        <[u8; N]>::try_from(bytes.as_ref()).map_err(|_| Error::Decode("string has unexpected length"))
    }

    /// Decode a `string` as UTF-8 text.
    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Decode("string is not valid utf-8"))
    }

    /// Decode a `name-list`.
    pub fn get_name_list(&mut self) -> Result<Vec<String>> {
        let list = self.get_string()?;
        if list.is_empty() {
            return Ok(Vec::new())
        }
        Ok(list.split(',').map(String::from).collect())
    }

    /// Decode a non-negative `mpint` as [`BigUint`].
    pub fn get_biguint(&mut self) -> Result<BigUint> {
        let bytes = self.get_bytes()?;
        if matches!(bytes.first(), Some(&x) if x & 0x80 != 0) {
            return Err(Error::Decode("mpint is negative"))
        }
        Ok(BigUint::from_bytes_be(&bytes))
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.ensure(len)?;
        self.buf.advance(len);
        Ok(())
    }

    /// Read `len` raw bytes.
    pub fn get_raw(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    fn ensure(&self, len: usize) -> Result<()> {
        if len <= self.buf.remaining() {
            Ok(())
        } else {
            Err(Error::Decode("unexpected end of packet"))
        }
    }

    /// The original bytes given to [`PacketDecode::new()`].
    pub fn as_original_bytes(&self) -> &[u8] {
        &self.orig_buf
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.orig_buf.len() - self.buf.len()
    }

    /// The remaining undecoded bytes.
    pub fn remaining(&self) -> Bytes {
        self.buf.clone()
    }

    /// Number of remaining undecoded bytes.
    pub fn remaining_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(data: &[u8]) -> PacketDecode {
        PacketDecode::new(Bytes::copy_from_slice(data))
    }

    #[test]
    fn test_get_scalars() {
        let mut d = decode(&[1, 0, 0xde, 0xad, 0xbe, 0xef, 0x42]);
        assert!(d.get_bool().unwrap());
        assert_eq!(d.get_u8().unwrap(), 0);
        assert_eq!(d.get_u32().unwrap(), 0xdeadbeef);
        assert_eq!(d.position(), 6);
        assert!(d.get_u32().is_err());
    }

    #[test]
    fn test_truncated_string() {
        assert!(decode(&[0, 0, 1]).get_bytes().is_err());
        assert!(decode(&[0, 0, 0, 5, b'a', b'b']).get_string().is_err());
        assert!(decode(&[0xff, 0xff, 0xff, 0xff]).get_bytes().is_err());
    }

    #[test]
    fn test_get_name_list() {
        assert!(decode(b"\0\0\0\0").get_name_list().unwrap().is_empty());
        assert_eq!(decode(b"\0\0\0\x09zlib,none").get_name_list().unwrap(), ["zlib", "none"]);
        assert_eq!(decode(b"\0\0\0\x05zlib,").get_name_list().unwrap(), ["zlib", ""]);
    }

    #[test]
    fn test_get_biguint() {
        let mut d = decode(&[0, 0, 0, 3, 0x00, 0xde, 0xad, 0, 0, 0, 1, 0x80]);
        assert_eq!(d.get_biguint().unwrap(), BigUint::from(0xdead_u32));
        assert!(d.get_biguint().is_err());
    }

    #[test]
    fn test_get_byte_array() {
        assert_eq!(decode(&[0, 0, 0, 2, 7, 8]).get_byte_array::<2>().unwrap(), [7, 8]);
        assert!(decode(&[0, 0, 0, 2, 7, 8]).get_byte_array::<3>().is_err());
    }
}
