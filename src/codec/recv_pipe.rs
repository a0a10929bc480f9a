use bytes::{Bytes, BytesMut};
use crate::cipher::{self, Decrypt};
use crate::compress::{CompressAlgo, Decompress};
use crate::error::{Error, Result};
use crate::key_context::DirectionKeys;
use crate::mac::{self, Mac, MacVerified};

/// Largest packet (without the MAC) that we accept from the peer, as recommended by RFC 4253,
/// section 6.1.
pub(crate) const MAX_PACKET_LEN: usize = 35000;
/// Largest payload that we accept after decompression.
pub(crate) const MAX_DECOMPRESSED_LEN: usize = 64 * 1024;
/// Smallest packet (without the MAC), which is one 16-byte block.
const MIN_PACKET_LEN: usize = 12;
/// Longest identification line, including the line terminator (RFC 4253, section 4.2).
const MAX_LINE_LEN: usize = 255;

/// Inbound half of the codec: splits the bytes from the socket into identification lines and
/// then into packets, which are decrypted, verified and decompressed.
pub(crate) struct RecvPipe {
    buf: BytesMut,
    state: State,
    decrypt: Box<dyn Decrypt + Send>,
    mac: Box<dyn Mac + Send>,
    block_len: usize,
    tag_len: usize,
    decompress: Option<Box<dyn Decompress + Send>>,
    delayed_compress: Option<&'static CompressAlgo>,
    authenticated: bool,
    packet_seq: u32,
    bytes_since_keys: u64,
    ident_lines: usize,
    max_ident_lines: usize,
}

#[derive(Debug, Copy, Clone)]
enum State {
    Ready,
    ScanningLine { pos: usize },
    DecryptedLen { packet_len: usize },
}

#[derive(Debug)]
pub(crate) struct RecvPacket {
    pub payload: Bytes,
    pub packet_seq: u32,
}

impl RecvPipe {
    pub fn new(max_ident_lines: usize) -> Result<RecvPipe> {
        Ok(RecvPipe {
            buf: BytesMut::new(),
            state: State::Ready,
            decrypt: (cipher::NONE.make_decrypt)(&[], &[])?,
            mac: (mac::NONE.make_mac)(&[])?,
            block_len: cipher::NONE.block_len,
            tag_len: 0,
            decompress: None,
            delayed_compress: None,
            authenticated: false,
            packet_seq: 0,
            bytes_since_keys: 0,
            ident_lines: 0,
            max_ident_lines,
        })
    }

    pub fn feed_buf(&mut self) -> &mut BytesMut {
        self.buf.reserve(4096);
        &mut self.buf
    }

    /// Consumes lines until the identification line of the peer (RFC 4253, section 4.2).
    ///
    /// Returns the identification without the line terminator.
    pub fn consume_ident(&mut self) -> Result<Option<Bytes>> {
        loop {
            let line = match self.consume_line()? {
                Some(line) => line,
                None => return Ok(None),
            };

            if line.starts_with(b"SSH-2.0-") || line.starts_with(b"SSH-1.99-") {
                return Ok(Some(line))
            } else if line.starts_with(b"SSH-") {
                log::debug!("received identification with unsupported version: {:?}", line);
                return Err(Error::ProtocolVersion)
            }

            self.ident_lines += 1;
            log::trace!("skipped line before identification: {:?}", line);
            if self.ident_lines > self.max_ident_lines {
                return Err(Error::Protocol("too many lines before identification"))
            }
        }
    }

    fn consume_line(&mut self) -> Result<Option<Bytes>> {
        let start = match self.state {
            State::Ready => 0,
            State::ScanningLine { pos } => pos,
            State::DecryptedLen { .. } =>
                panic!("called consume_ident() while a packet is being decoded"),
        };

        let newline = self.buf[start..].iter().position(|&b| b == b'\n').map(|i| start + i);
        let Some(newline) = newline else {
            if self.buf.len() > MAX_LINE_LEN {
                return Err(Error::Protocol("received line is too long"))
            }
            self.state = State::ScanningLine { pos: self.buf.len() };
            return Ok(None)
        };

        if newline + 1 > MAX_LINE_LEN {
            return Err(Error::Protocol("received line is too long"))
        }

        self.state = State::Ready;
        let mut line = self.buf.split_to(newline + 1).freeze();
        line.truncate(newline);
        if line.ends_with(b"\r") {
            line.truncate(newline - 1);
        }
        Ok(Some(line))
    }

    pub fn consume_packet(&mut self) -> Result<Option<RecvPacket>> {
        let packet_len = match self.state {
            State::Ready => {
                // RFC 4253, section 6: the length must be checked before we wait for the rest of
                // the packet, so that a bogus length cannot make us buffer unbounded data
                if self.buf.len() < self.block_len {
                    return Ok(None)
                }
                self.decrypt.decrypt(&mut self.buf[..self.block_len]);
                let packet_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                let packet_len = packet_len as usize;

                if packet_len > MAX_PACKET_LEN {
                    return Err(Error::Protocol("invalid packet length (too long)"))
                } else if packet_len < MIN_PACKET_LEN {
                    return Err(Error::Protocol("invalid packet length (too short)"))
                } else if (4 + packet_len) % self.block_len != 0 {
                    return Err(Error::Protocol("invalid packet length (not aligned to cipher block)"))
                }

                log::trace!("decrypted packet length {}", packet_len);
                self.state = State::DecryptedLen { packet_len };
                packet_len
            },
            State::DecryptedLen { packet_len } => packet_len,
            State::ScanningLine { .. } =>
                panic!("called consume_packet() while an identification line is being scanned"),
        };

        let wire_len = 4 + packet_len + self.tag_len;
        if self.buf.len() < wire_len {
            self.buf.reserve(wire_len - self.buf.len());
            return Ok(None)
        }

        let mut packet = self.buf.split_to(wire_len);
        let _: MacVerified = {
            let (plaintext, tag) = packet.split_at_mut(4 + packet_len);
            self.decrypt.decrypt(&mut plaintext[self.block_len..]);
            self.mac.verify(self.packet_seq, plaintext, tag)?
        };

        let padding_len = packet[4] as usize;
        if padding_len < 4 || packet_len < 1 + padding_len {
            return Err(Error::Protocol("invalid padding length"))
        }

        let payload_len = packet_len - 1 - padding_len;
        let payload = packet.freeze().slice(5..5 + payload_len);
        let payload = match self.decompress.as_mut() {
            Some(decompress) => Bytes::from(decompress.decompress(&payload)?),
            None => payload,
        };

        let packet_seq = self.packet_seq;
        self.packet_seq = self.packet_seq.wrapping_add(1);
        self.bytes_since_keys += wire_len as u64;
        self.state = State::Ready;
        Ok(Some(RecvPacket { payload, packet_seq }))
    }

    /// Switches to new keys; must be called between packets.
    pub fn set_keys(&mut self, keys: DirectionKeys) -> Result<()> {
        debug_assert!(matches!(self.state, State::Ready));
        let state = keys.into_decrypt()?;
        self.decrypt = state.cipher;
        self.block_len = state.block_len;
        self.mac = state.mac;
        self.tag_len = state.tag_len;
        self.decompress = None;
        self.delayed_compress = None;
        if state.compress.delayed && !self.authenticated {
            self.delayed_compress = Some(state.compress);
        } else {
            self.decompress = state.compress.make_decompress.map(|make| make(MAX_DECOMPRESSED_LEN));
        }
        self.bytes_since_keys = 0;
        Ok(())
    }

    /// Starts decompression that was waiting for the user to authenticate.
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
        if let Some(algo) = self.delayed_compress.take() {
            log::debug!("starting delayed compression {:?} for receiving", algo.name);
            self.decompress = algo.make_decompress.map(|make| make(MAX_DECOMPRESSED_LEN));
        }
    }

    pub fn bytes_since_keys(&self) -> u64 {
        self.bytes_since_keys
    }
}
