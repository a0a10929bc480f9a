use rand::{CryptoRng, RngCore};
use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream that carries the SSH transport.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Random number generator suitable for generating keys.
///
/// Implemented for every [`CryptoRng`] + [`RngCore`], so that we can pass it around as a trait
/// object.
pub trait CryptoRngCore: CryptoRng + RngCore {
    fn as_rngcore(&mut self) -> &mut dyn RngCore;
}

impl<T: CryptoRng + RngCore> CryptoRngCore for T {
    fn as_rngcore(&mut self) -> &mut dyn RngCore {
        self
    }
}
