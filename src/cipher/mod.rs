//! Encryption and decryption algorithms.
//!
//! Ciphers provide **confidentiality** of the packets exchanged over the transport. Each
//! direction of the connection negotiates its own cipher and uses its own key and IV.
//!
//! # Supported algorithms
//!
//! - "aes128-ctr" ([`AES128_CTR`])
//! - "aes192-ctr" ([`AES192_CTR`])
//! - "aes256-ctr" ([`AES256_CTR`])
//! - "aes128-cbc" ([`AES128_CBC`])
//! - "aes256-cbc" ([`AES256_CBC`])
//! - "none" ([`NONE`])
use derivative::Derivative;
use crate::Result;
pub use self::block::{AES128_CBC, AES256_CBC};
pub use self::none::NONE;
pub use self::stream::{AES128_CTR, AES192_CTR, AES256_CTR};

mod block;
mod none;
mod stream;

/// Algorithm for encrypting and decrypting packets.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CipherAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    pub(crate) block_len: usize,
    pub(crate) key_len: usize,
    pub(crate) iv_len: usize,
    #[derivative(Debug = "ignore")]
    pub(crate) make_encrypt: fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn Encrypt + Send>>,
    #[derivative(Debug = "ignore")]
    pub(crate) make_decrypt: fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn Decrypt + Send>>,
}

/// Encrypts whole packets in place; `data` is always aligned to the block length.
pub(crate) trait Encrypt {
    fn encrypt(&mut self, data: &mut [u8]);
}

/// Decrypts packets in place, possibly in several calls per packet.
pub(crate) trait Decrypt {
    fn decrypt(&mut self, data: &mut [u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_roundtrip(algo: &CipherAlgo) {
        let key = (0..algo.key_len as u8).collect::<Vec<_>>();
        let iv = (100..100 + algo.iv_len as u8).collect::<Vec<_>>();
        let plaintext = (0..algo.block_len * 5).map(|x| (x * 7) as u8).collect::<Vec<_>>();

        let mut encrypt = (algo.make_encrypt)(&key, &iv).unwrap();
        let mut data = plaintext.clone();
        encrypt.encrypt(&mut data[..algo.block_len * 2]);
        encrypt.encrypt(&mut data[algo.block_len * 2..]);
        if algo.key_len > 0 {
            assert_ne!(data, plaintext, "{}", algo.name);
        }

        // decryption may be split at any block boundary, as the receiver first decrypts only
        // the block with the packet length
        let mut decrypt = (algo.make_decrypt)(&key, &iv).unwrap();
        decrypt.decrypt(&mut data[..algo.block_len]);
        decrypt.decrypt(&mut data[algo.block_len..]);
        assert_eq!(data, plaintext, "{}", algo.name);
    }

    #[test]
    fn test_roundtrip() {
        for algo in [&AES128_CTR, &AES192_CTR, &AES256_CTR, &AES128_CBC, &AES256_CBC, &NONE] {
            check_roundtrip(algo);
        }
    }

    #[test]
    fn test_aes128_ctr_vector() {
        // NIST SP 800-38A, F.5.1
        let key = hex_literal::hex!("2b7e151628aed2a6abf7158809cf4f3c");
        let iv = hex_literal::hex!("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
        let mut data = hex_literal::hex!("6bc1bee22e409f96e93d7e117393172a");
        let mut encrypt = (AES128_CTR.make_encrypt)(&key, &iv).unwrap();
        encrypt.encrypt(&mut data);
        assert_eq!(data, hex_literal::hex!("874d6191b620e3261bef6864990db6ce"));
    }

    #[test]
    fn test_wrong_key_len() {
        assert!((AES128_CTR.make_encrypt)(&[0; 15], &[0; 16]).is_err());
        assert!((AES256_CBC.make_decrypt)(&[0; 32], &[0; 8]).is_err());
    }
}
