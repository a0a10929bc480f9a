//! Message authentication algorithms.
//!
//! MACs provide **integrity** of the packets: every packet carries a tag computed over its
//! sequence number and its plaintext, so a modified or replayed packet is detected and the
//! connection is torn down.
//!
//! # Supported algorithms
//!
//! - "hmac-sha2-256" ([`HMAC_SHA2_256`])
//! - "hmac-sha2-512" ([`HMAC_SHA2_512`])
//! - "hmac-sha1" ([`HMAC_SHA1`])
//! - "none" ([`NONE`])
use derivative::Derivative;
use crate::Result;
pub use self::hmac::{HMAC_SHA2_256, HMAC_SHA2_512, HMAC_SHA1};
pub use self::none::NONE;

mod hmac;
mod none;

/// Algorithm for authenticating packets.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MacAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    pub(crate) tag_len: usize,
    pub(crate) key_len: usize,
    #[derivative(Debug = "ignore")]
    pub(crate) make_mac: fn(key: &[u8]) -> Result<Box<dyn Mac + Send>>,
}

pub(crate) trait Mac {
    fn sign(&mut self, packet_seq: u32, plaintext: &[u8], tag: &mut [u8]);
    fn verify(&mut self, packet_seq: u32, plaintext: &[u8], tag: &[u8]) -> Result<MacVerified>;
}

/// Proof that the tag of a packet was checked.
#[derive(Debug)]
pub(crate) struct MacVerified(());

impl MacVerified {
    pub fn assertion() -> Self {
        Self(())
    }
}
