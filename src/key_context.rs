//! Negotiated algorithms and derived keys for both directions of the transport.
use derivative::Derivative;
use zeroize::Zeroizing;
use crate::cipher::{CipherAlgo, Decrypt, Encrypt};
use crate::codec::PacketEncode;
use crate::compress::CompressAlgo;
use crate::conn::Role;
use crate::error::Result;
use crate::kex::KexAlgo;
use crate::mac::{Mac, MacAlgo};
use crate::pubkey::PubkeyAlgo;

/// Algorithms chosen by the key exchange.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AlgoSet {
    pub kex: &'static KexAlgo,
    pub host_key: &'static PubkeyAlgo,
    pub cipher_cts: &'static CipherAlgo,
    pub cipher_stc: &'static CipherAlgo,
    pub mac_cts: &'static MacAlgo,
    pub mac_stc: &'static MacAlgo,
    pub compress_cts: &'static CompressAlgo,
    pub compress_stc: &'static CompressAlgo,
}

/// Algorithms and keys of one direction.
///
/// Key material is wiped when the value is dropped, which happens as soon as the keys are
/// installed into the codec or superseded.
#[derive(Derivative, PartialEq, Eq)]
#[derivative(Debug)]
pub(crate) struct DirectionKeys {
    pub cipher: &'static str,
    pub mac: &'static str,
    pub compress: &'static str,
    #[derivative(Debug = "ignore")]
    cipher_key: Zeroizing<Vec<u8>>,
    #[derivative(Debug = "ignore")]
    cipher_iv: Zeroizing<Vec<u8>>,
    #[derivative(Debug = "ignore")]
    mac_key: Zeroizing<Vec<u8>>,
    #[derivative(Debug = "ignore")]
    algos: DirectionAlgos,
}

#[derive(Clone, Copy)]
struct DirectionAlgos {
    cipher: &'static CipherAlgo,
    mac: &'static MacAlgo,
    compress: &'static CompressAlgo,
}

impl PartialEq for DirectionAlgos {
    fn eq(&self, other: &Self) -> bool {
        self.cipher.name == other.cipher.name && self.mac.name == other.mac.name &&
            self.compress.name == other.compress.name
    }
}

impl Eq for DirectionAlgos {}

/// Keys derived by one key exchange, not yet in force.
///
/// Each half is taken out when its direction cuts over: `send` when we send `SSH_MSG_NEWKEYS`,
/// `recv` when we receive it.
#[derive(Debug)]
pub(crate) struct KeyContext {
    pub send: Option<DirectionKeys>,
    pub recv: Option<DirectionKeys>,
}

/// Inputs of key derivation from RFC 4253, section 7.2.
pub(crate) struct DeriveInput<'a> {
    pub shared_secret_be: &'a [u8],
    pub exchange_hash: &'a [u8],
    pub session_id: &'a [u8],
    pub compute_hash: &'a dyn Fn(&[u8]) -> Vec<u8>,
}

pub(crate) fn derive_key_context(role: Role, algos: &AlgoSet, input: &DeriveInput) -> KeyContext {
    let cts = derive_direction(input, b'A', b'C', b'E', DirectionAlgos {
        cipher: algos.cipher_cts, mac: algos.mac_cts, compress: algos.compress_cts,
    });
    let stc = derive_direction(input, b'B', b'D', b'F', DirectionAlgos {
        cipher: algos.cipher_stc, mac: algos.mac_stc, compress: algos.compress_stc,
    });
    let (send, recv) = match role {
        Role::Client => (cts, stc),
        Role::Server => (stc, cts),
    };
    KeyContext { send: Some(send), recv: Some(recv) }
}

fn derive_direction(
    input: &DeriveInput,
    iv_letter: u8,
    key_letter: u8,
    mac_letter: u8,
    algos: DirectionAlgos,
) -> DirectionKeys {
    DirectionKeys {
        cipher: algos.cipher.name,
        mac: algos.mac.name,
        compress: algos.compress.name,
        cipher_key: derive_key(input, key_letter, algos.cipher.key_len),
        cipher_iv: derive_key(input, iv_letter, algos.cipher.iv_len),
        mac_key: derive_key(input, mac_letter, algos.mac.key_len),
        algos,
    }
}

fn derive_key(input: &DeriveInput, letter: u8, key_len: usize) -> Zeroizing<Vec<u8>> {
    // K1 = HASH(K || H || letter || session_id), Kn = HASH(K || H || K1 || ... || Kn-1)
    let mut prefix = PacketEncode::new();
    prefix.put_mpint_uint_be(input.shared_secret_be);
    prefix.put_raw(input.exchange_hash);
    let prefix = Zeroizing::new(prefix.into_bytes().to_vec());

    let mut first = Zeroizing::new(prefix.to_vec());
    first.push(letter);
    first.extend_from_slice(input.session_id);
    let mut key = Zeroizing::new((input.compute_hash)(&first));

    while key.len() < key_len {
        let mut next = Zeroizing::new(prefix.to_vec());
        next.extend_from_slice(&key);
        let digest = Zeroizing::new((input.compute_hash)(&next));
        key.extend_from_slice(&digest);
    }
    key.truncate(key_len);
    key
}

/// Instances of the algorithms of one direction, keyed and ready to use.
pub(crate) struct DirectionState<C> {
    pub cipher: C,
    pub block_len: usize,
    pub mac: Box<dyn Mac + Send>,
    pub tag_len: usize,
    pub compress: &'static CompressAlgo,
}

impl DirectionKeys {
    pub fn into_encrypt(self) -> Result<DirectionState<Box<dyn Encrypt + Send>>> {
        Ok(DirectionState {
            cipher: (self.algos.cipher.make_encrypt)(&self.cipher_key, &self.cipher_iv)?,
            block_len: self.algos.cipher.block_len,
            mac: (self.algos.mac.make_mac)(&self.mac_key)?,
            tag_len: self.algos.mac.tag_len,
            compress: self.algos.compress,
        })
    }

    pub fn into_decrypt(self) -> Result<DirectionState<Box<dyn Decrypt + Send>>> {
        Ok(DirectionState {
            cipher: (self.algos.cipher.make_decrypt)(&self.cipher_key, &self.cipher_iv)?,
            block_len: self.algos.cipher.block_len,
            mac: (self.algos.mac.make_mac)(&self.mac_key)?,
            tag_len: self.algos.mac.tag_len,
            compress: self.algos.compress,
        })
    }
}

#[cfg(test)]
impl DirectionKeys {
    /// Keys filled with a fixed pattern, for testing the codec.
    pub fn with_fixed_keys(
        cipher: &'static CipherAlgo,
        mac: &'static MacAlgo,
        compress: &'static CompressAlgo,
    ) -> DirectionKeys {
        DirectionKeys {
            cipher: cipher.name,
            mac: mac.name,
            compress: compress.name,
            cipher_key: Zeroizing::new(vec![0x42; cipher.key_len]),
            cipher_iv: Zeroizing::new(vec![0x17; cipher.iv_len]),
            mac_key: Zeroizing::new(vec![0x99; mac.key_len]),
            algos: DirectionAlgos { cipher, mac, compress },
        }
    }
}

#[cfg(test)]
mod tests {
    use sha1::Digest as _;
    use super::*;
    use crate::{cipher, compress, kex, mac, pubkey};

    fn algos() -> AlgoSet {
        AlgoSet {
            kex: &kex::DIFFIE_HELLMAN_GROUP14_SHA1,
            host_key: &pubkey::SSH_RSA_SHA1,
            cipher_cts: &cipher::AES128_CTR,
            cipher_stc: &cipher::AES256_CTR,
            mac_cts: &mac::HMAC_SHA1,
            mac_stc: &mac::HMAC_SHA2_512,
            compress_cts: &compress::NONE,
            compress_stc: &compress::ZLIB,
        }
    }

    fn sha1(data: &[u8]) -> Vec<u8> {
        sha1::Sha1::digest(data).to_vec()
    }

    #[test]
    fn test_roles_are_mirrored() {
        let input = DeriveInput {
            shared_secret_be: &[0x80, 1, 2, 3],
            exchange_hash: &[9; 20],
            session_id: &[7; 20],
            compute_hash: &sha1,
        };
        let client = derive_key_context(Role::Client, &algos(), &input);
        let server = derive_key_context(Role::Server, &algos(), &input);
        assert_eq!(client.send, server.recv);
        assert_eq!(client.recv, server.send);
        assert_ne!(client.send, client.recv);

        let send = client.send.unwrap();
        assert_eq!(send.cipher, "aes128-ctr");
        assert_eq!(send.cipher_key.len(), 16);
        assert_eq!(send.mac_key.len(), 20);
    }

    #[test]
    fn test_derive_key_extends() {
        let input = DeriveInput {
            shared_secret_be: &[1],
            exchange_hash: &[2; 20],
            session_id: &[3; 20],
            compute_hash: &sha1,
        };
        // a 64 byte key needs four rounds of sha1
        let key = derive_key(&input, b'F', 64);
        assert_eq!(key.len(), 64);

        let mut first = vec![0, 0, 0, 1, 1];
        first.extend_from_slice(&[2; 20]);
        first.push(b'F');
        first.extend_from_slice(&[3; 20]);
        assert_eq!(&key[..20], sha1(&first).as_slice());

        let mut second = vec![0, 0, 0, 1, 1];
        second.extend_from_slice(&[2; 20]);
        second.extend_from_slice(&key[..20]);
        assert_eq!(&key[20..40], sha1(&second).as_slice());
    }
}
