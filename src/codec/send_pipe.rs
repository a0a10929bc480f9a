use bytes::{BufMut as _, BytesMut};
use rand::{RngCore as _, SeedableRng as _};
use rand_chacha::ChaCha8Rng;
use std::borrow::Cow;
use crate::cipher::{self, Encrypt};
use crate::compress::{CompressAlgo, Compress};
use crate::error::{Error, Result};
use crate::key_context::DirectionKeys;
use crate::mac::{self, Mac};
use crate::util::CryptoRngCore;
use super::recv_pipe::MAX_PACKET_LEN;

/// Outbound half of the codec: frames, compresses, authenticates and encrypts packets into a
/// buffer of bytes waiting to be written to the socket.
pub(crate) struct SendPipe {
    buf: BytesMut,
    encrypt: Box<dyn Encrypt + Send>,
    mac: Box<dyn Mac + Send>,
    block_len: usize,
    tag_len: usize,
    compress: Option<Box<dyn Compress + Send>>,
    delayed_compress: Option<&'static CompressAlgo>,
    authenticated: bool,
    packet_seq: u32,
    bytes_since_keys: u64,
    padding_rng: ChaCha8Rng,
}

impl SendPipe {
    pub fn new(rng: &mut dyn CryptoRngCore) -> Result<SendPipe> {
        let padding_rng = ChaCha8Rng::from_rng(rng.as_rngcore())
            .map_err(|_| Error::Random("could not initialize padding rng"))?;
        Ok(SendPipe {
            buf: BytesMut::new(),
            encrypt: (cipher::NONE.make_encrypt)(&[], &[])?,
            mac: (mac::NONE.make_mac)(&[])?,
            block_len: cipher::NONE.block_len,
            tag_len: 0,
            compress: None,
            delayed_compress: None,
            authenticated: false,
            packet_seq: 0,
            bytes_since_keys: 0,
            padding_rng,
        })
    }

    pub fn feed_ident(&mut self, ident: &[u8]) {
        self.buf.reserve(ident.len() + 2);
        self.buf.put_slice(ident);
        self.buf.put_slice(b"\r\n");
    }

    /// Encodes a packet with the given payload and returns its sequence number.
    pub fn feed_packet(&mut self, payload: &[u8]) -> Result<u32> {
        // RFC 4253, section 6
        let payload = match self.compress.as_mut() {
            Some(compress) => Cow::Owned(compress.compress(payload)?),
            None => Cow::Borrowed(payload),
        };

        let padding_len = calculate_padding_len(payload.len(), self.block_len);
        let packet_len = 1 + payload.len() + padding_len;
        // the peer drops the connection on packets that we would not accept ourselves
        if packet_len > MAX_PACKET_LEN {
            return Err(Error::Protocol("packet to send is too long"))
        }
        let wire_len = 4 + packet_len + self.tag_len;

        let start = self.buf.len();
        self.buf.reserve(wire_len);
        self.buf.put_u32(packet_len as u32);
        self.buf.put_u8(padding_len as u8);
        self.buf.put_slice(&payload);

        let mut padding = [0; 255];
        self.padding_rng.fill_bytes(&mut padding[..padding_len]);
        self.buf.put_slice(&padding[..padding_len]);
        self.buf.put_bytes(0, self.tag_len);

        // the tag is computed over the plaintext, then the packet (without the tag) is encrypted
        let packet_seq = self.packet_seq;
        let (packet, tag) = self.buf[start..].split_at_mut(4 + packet_len);
        self.mac.sign(packet_seq, packet, tag);
        self.encrypt.encrypt(packet);

        self.packet_seq = self.packet_seq.wrapping_add(1);
        self.bytes_since_keys += wire_len as u64;
        Ok(packet_seq)
    }

    /// Switches to new keys; all packets fed after this call use them.
    pub fn set_keys(&mut self, keys: DirectionKeys) -> Result<()> {
        let state = keys.into_encrypt()?;
        self.encrypt = state.cipher;
        self.block_len = state.block_len;
        self.mac = state.mac;
        self.tag_len = state.tag_len;
        self.compress = None;
        self.delayed_compress = None;
        if state.compress.delayed && !self.authenticated {
            self.delayed_compress = Some(state.compress);
        } else {
            self.compress = state.compress.make_compress.map(|make| make());
        }
        self.bytes_since_keys = 0;
        Ok(())
    }

    /// Starts compression that was waiting for the user to authenticate.
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
        if let Some(algo) = self.delayed_compress.take() {
            log::debug!("starting delayed compression {:?} for sending", algo.name);
            self.compress = algo.make_compress.map(|make| make());
        }
    }

    pub fn bytes_since_keys(&self) -> u64 {
        self.bytes_since_keys
    }

    pub fn peek_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn consume_bytes(&mut self, len: usize) {
        let _ = self.buf.split_to(len);
    }

    #[cfg(test)]
    pub fn packet_seq_for_test(&mut self, packet_seq: u32) {
        self.packet_seq = packet_seq;
    }
}

fn calculate_padding_len(payload_len: usize, block_len: usize) -> usize {
    // the length, padding length, payload and padding must be a multiple of the block size or
    // 8, whichever is larger, with at least 4 bytes of padding
    let block_len = block_len.max(8);
    let min_len = 4 + 1 + payload_len + 4;
    let padded_len = (min_len + block_len - 1) / block_len * block_len;
    padded_len - 5 - payload_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_padding_len() {
        assert_eq!(calculate_padding_len(0, 8), 11);
        assert_eq!(calculate_padding_len(3, 8), 8);
        assert_eq!(calculate_padding_len(7, 8), 4);
        assert_eq!(calculate_padding_len(8, 8), 11);
        assert_eq!(calculate_padding_len(0, 16), 11);
        assert_eq!(calculate_padding_len(7, 16), 4);
        assert_eq!(calculate_padding_len(8, 16), 19);
        for payload_len in 0..100 {
            let padding_len = calculate_padding_len(payload_len, 16);
            assert!(padding_len >= 4);
            assert_eq!((5 + payload_len + padding_len) % 16, 0);
        }
    }

    #[test]
    fn test_feed_plaintext_packet() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut pipe = SendPipe::new(&mut rng).unwrap();
        pipe.feed_ident(b"SSH-2.0-test");
        assert_eq!(pipe.feed_packet(b"foo").unwrap(), 0);
        assert_eq!(pipe.feed_packet(b"bar").unwrap(), 1);

        let bytes = pipe.peek_bytes().to_vec();
        assert_eq!(&bytes[..14], b"SSH-2.0-test\r\n");
        assert_eq!(&bytes[14..22], b"\x00\x00\x00\x0c\x08foo");
        assert_eq!(bytes.len(), 14 + 2 * 16);
        assert_eq!(pipe.bytes_since_keys(), 32);

        pipe.consume_bytes(14);
        assert_eq!(pipe.peek_bytes().len(), 32);
        pipe.consume_bytes(32);
        assert!(pipe.is_empty());
    }

    #[test]
    fn test_feed_packet_too_long() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut pipe = SendPipe::new(&mut rng).unwrap();
        assert!(pipe.feed_packet(&vec![0; 34000]).is_ok());
        let len_before = pipe.peek_bytes().len();
        assert!(matches!(pipe.feed_packet(&vec![0; 40000]), Err(Error::Protocol(_))));
        assert_eq!(pipe.peek_bytes().len(), len_before);
    }
}
