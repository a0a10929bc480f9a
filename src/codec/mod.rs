//! Binary packet protocol (RFC 4253, section 6) in both directions.
use bytes::Bytes;
use crate::error::Result;
use crate::util::CryptoRngCore;
pub use self::packet_encode::PacketEncode;
pub use self::packet_decode::PacketDecode;
pub(crate) use self::recv_pipe::{RecvPipe, RecvPacket};
pub(crate) use self::send_pipe::SendPipe;

mod packet_encode;
mod packet_decode;
mod recv_pipe;
mod send_pipe;

/// Framing, encryption and compression of both directions of the transport.
pub(crate) struct Codec {
    pub recv_pipe: RecvPipe,
    pub send_pipe: SendPipe,
}

impl Codec {
    /// Creates the codec with our identification line already queued for sending.
    pub fn new(our_ident: &Bytes, max_ident_lines: usize, rng: &mut dyn CryptoRngCore) -> Result<Codec> {
        let mut send_pipe = SendPipe::new(rng)?;
        send_pipe.feed_ident(our_ident);
        let recv_pipe = RecvPipe::new(max_ident_lines)?;
        Ok(Codec { recv_pipe, send_pipe })
    }

    /// Bytes sent and received since the last key exchange.
    pub fn bytes_since_keys(&self) -> u64 {
        self.send_pipe.bytes_since_keys() + self.recv_pipe.bytes_since_keys()
    }

    /// Starts delayed compression ("zlib@openssh.com") in both directions.
    pub fn set_authenticated(&mut self) {
        self.send_pipe.set_authenticated();
        self.recv_pipe.set_authenticated();
    }
}
