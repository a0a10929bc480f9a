//! Public key algorithms.
//!
//! The SSH protocol uses public key algorithms to authenticate the server during key exchange
//! (the "host key") and to authenticate users with the "publickey" method.
//!
//! # Supported algorithms
//!
//! - "ssh-ed25519" ([`SSH_ED25519`], uses [`Ed25519Pubkey`] and [`Ed25519Privkey`])
//! - "rsa-sha2-256" ([`RSA_SHA2_256`], uses [`RsaPubkey`] and [`RsaPrivkey`])
//! - "rsa-sha2-512" ([`RSA_SHA2_512`], uses [`RsaPubkey`] and [`RsaPrivkey`])
//! - "ssh-rsa" ([`SSH_RSA_SHA1`], uses [`RsaPubkey`] and [`RsaPrivkey`])
use base64::Engine as _;
use bytes::Bytes;
use derivative::Derivative;
use std::fmt;
use crate::codec::{PacketDecode, PacketEncode};
use crate::error::{Result, Error};
pub use self::ed25519::{SSH_ED25519, Ed25519Pubkey, Ed25519Privkey};
pub use self::rsa::{SSH_RSA_SHA1, RSA_SHA2_256, RSA_SHA2_512, RsaPubkey, RsaPrivkey};

mod ed25519;
mod rsa;

/// Algorithm for public key cryptography.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PubkeyAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    #[derivative(Debug = "ignore")]
    pub(crate) verify: fn(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified>,
    #[derivative(Debug = "ignore")]
    pub(crate) sign: fn(privkey: &Privkey, message: &[u8]) -> Result<Bytes>,
}



/// Public key in one of supported formats.
///
/// This enum is marked as `#[non_exhaustive]`, so we might add new variants without breaking
/// backwards compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Pubkey {
    /// Ed25519 public key.
    Ed25519(Ed25519Pubkey),
    /// RSA public key.
    Rsa(RsaPubkey),
}

impl Pubkey {
    /// Get best public key algorithms that work with this key.
    ///
    /// With RSA keys there are multiple algorithms that differ in the hash function; this method
    /// returns only those that do not use SHA-1.
    pub fn algos_secure(&self) -> &'static [&'static PubkeyAlgo] {
        static ED25519: &[&PubkeyAlgo] = &[&SSH_ED25519];
        static RSA: &[&PubkeyAlgo] = &[&RSA_SHA2_256, &RSA_SHA2_512];
        match self {
            Pubkey::Ed25519(_) => ED25519,
            Pubkey::Rsa(_) => RSA,
        }
    }

    /// Get all public key algorithms that work with this key.
    pub fn algos_compatible_less_secure(&self) -> &'static [&'static PubkeyAlgo] {
        static RSA: &[&PubkeyAlgo] = &[&RSA_SHA2_256, &RSA_SHA2_512, &SSH_RSA_SHA1];
        match self {
            Pubkey::Rsa(_) => RSA,
            _ => self.algos_secure(),
        }
    }

    /// Decode a public key from SSH wire encoding (RFC 4253, section 6.6).
    pub fn decode(blob: Bytes) -> Result<Self> {
        let mut blob = PacketDecode::new(blob);
        let format = blob.get_string()?;
        match format.as_str() {
            "ssh-ed25519" => ed25519::decode_pubkey(&mut blob).map(Pubkey::Ed25519),
            "ssh-rsa" => rsa::decode_pubkey(&mut blob).map(Pubkey::Rsa),
            _ => {
                log::debug!("unknown pubkey format {:?}", format);
                Err(Error::Decode("unknown public key format"))
            },
        }
    }

    /// Encode a public key into SSH wire encoding.
    pub fn encode(&self) -> Bytes {
        let mut blob = PacketEncode::new();
        match self {
            Pubkey::Ed25519(pubkey) => ed25519::encode_pubkey(&mut blob, pubkey),
            Pubkey::Rsa(pubkey) => rsa::encode_pubkey(&mut blob, pubkey),
        }
        blob.finish()
    }

    /// Compute a fingerprint of the public key.
    ///
    /// The fingerprint is the SHA-256 digest of the encoded key in unpadded base64, prefixed with
    /// `SHA256:`, the same format that OpenSSH prints.
    pub fn fingerprint(&self) -> String {
        use sha2::Digest as _;
        let digest = sha2::Sha256::digest(self.encode());
        format!("SHA256:{}", base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest))
    }

    /// Verifies `signature` of `message` using the given algorithm.
    pub(crate) fn verify(
        &self,
        algo: &PubkeyAlgo,
        message: &[u8],
        signature: Bytes,
    ) -> Result<SignatureVerified> {
        (algo.verify)(self, message, signature)
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pubkey::Ed25519(pubkey) => fmt::Display::fmt(pubkey, f),
            Pubkey::Rsa(pubkey) => fmt::Display::fmt(pubkey, f),
        }
    }
}

/// Proof that a signature was verified.
#[derive(Debug)]
pub(crate) struct SignatureVerified(());

impl SignatureVerified {
    fn assertion() -> Self { Self(()) }
}



/// Private key (keypair) in one of supported formats.
///
/// Servers use private keys as host keys (see [`ServerHooks`][crate::ServerHooks]) and clients
/// use them for "publickey" authentication.
///
/// This enum is marked as `#[non_exhaustive]`, so we might add new variants without breaking
/// backwards compatibility.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
#[cfg_attr(feature = "debug_less_secure", derive(Debug))]
pub enum Privkey {
    /// Ed25519 private key.
    Ed25519(Ed25519Privkey),
    /// RSA private key.
    Rsa(RsaPrivkey),
}

impl Privkey {
    /// Return the public key associated with this private key.
    pub fn pubkey(&self) -> Pubkey {
        match self {
            Privkey::Ed25519(privkey) => Pubkey::Ed25519(privkey.pubkey()),
            Privkey::Rsa(privkey) => Pubkey::Rsa(privkey.pubkey()),
        }
    }

    /// Signs `message` with the given algorithm, returning the encoded signature.
    pub(crate) fn sign(&self, algo: &PubkeyAlgo, message: &[u8]) -> Result<Bytes> {
        (algo.sign)(self, message)
    }
}

impl From<Ed25519Privkey> for Privkey {
    fn from(privkey: Ed25519Privkey) -> Self { Privkey::Ed25519(privkey) }
}

impl From<RsaPrivkey> for Privkey {
    fn from(privkey: RsaPrivkey) -> Self { Privkey::Rsa(privkey) }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use rand_chacha::ChaCha8Rng;
    use super::*;

    fn ed25519_privkey() -> Privkey {
        Privkey::Ed25519(ed25519_dalek::SigningKey::from_bytes(&[42; 32]).into())
    }

    fn rsa_privkey() -> Privkey {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let privkey = ::rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        Privkey::Rsa(privkey.into())
    }

    fn check_sign_verify(privkey: &Privkey, algo: &PubkeyAlgo) {
        let pubkey = privkey.pubkey();
        let signature = privkey.sign(algo, b"exchange hash").unwrap();
        assert!(pubkey.verify(algo, b"exchange hash", signature.clone()).is_ok());
        assert!(matches!(pubkey.verify(algo, b"other message", signature.clone()), Err(Error::Signature)));

        let mut tampered = signature.to_vec();
        *tampered.last_mut().unwrap() ^= 1;
        assert!(pubkey.verify(algo, b"exchange hash", tampered.into()).is_err());
    }

    #[test]
    fn test_ed25519() {
        check_sign_verify(&ed25519_privkey(), &SSH_ED25519);
    }

    #[test]
    fn test_rsa() {
        let privkey = rsa_privkey();
        for algo in privkey.pubkey().algos_compatible_less_secure() {
            check_sign_verify(&privkey, algo);
        }
    }

    #[test]
    fn test_wrong_algo_for_key() {
        let privkey = ed25519_privkey();
        assert!(matches!(privkey.sign(&RSA_SHA2_256, b"x"), Err(Error::PrivkeyFormat)));
        let signature = privkey.sign(&SSH_ED25519, b"x").unwrap();
        assert!(matches!(privkey.pubkey().verify(&RSA_SHA2_256, b"x", signature), Err(Error::PubkeyFormat)));
    }

    #[test]
    fn test_rsa_signature_names_differ() {
        let privkey = rsa_privkey();
        let signature = privkey.sign(&RSA_SHA2_512, b"x").unwrap();
        // a signature made with "rsa-sha2-512" must not pass as "rsa-sha2-256"
        assert!(privkey.pubkey().verify(&RSA_SHA2_256, b"x", signature).is_err());
    }

    #[test]
    fn test_encode_decode_pubkey() {
        for privkey in [ed25519_privkey(), rsa_privkey()] {
            let pubkey = privkey.pubkey();
            let blob = pubkey.encode();
            assert_eq!(Pubkey::decode(blob).unwrap(), pubkey);
        }
        assert!(Pubkey::decode(Bytes::from_static(b"\0\0\0\x07ssh-dss")).is_err());
    }

    #[test]
    fn test_fingerprint() {
        let fingerprint = ed25519_privkey().pubkey().fingerprint();
        assert!(fingerprint.starts_with("SHA256:"));
        assert_eq!(fingerprint.len(), "SHA256:".len() + 43);
    }
}
