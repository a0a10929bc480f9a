use bytes::Bytes;
use std::fmt;
use crate::codec::{PacketDecode, PacketEncode};
use crate::error::{Result, Error};
use super::{PubkeyAlgo, Pubkey, Privkey, SignatureVerified};

const SIGNATURE_FORMAT: &str = "ssh-ed25519";

/// "ssh-ed25519" algorithm (RFC 8709).
///
/// Works with [`Ed25519Pubkey`] and [`Ed25519Privkey`]. This is the preferred host key algorithm.
pub static SSH_ED25519: PubkeyAlgo = PubkeyAlgo {
    name: "ssh-ed25519",
    verify: verify_ed25519,
    sign: sign_ed25519,
};

/// Ed25519 public key (RFC 8032).
///
/// Converts to and from [`ed25519_dalek::VerifyingKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519Pubkey {
    pub(crate) verifying: ed25519_dalek::VerifyingKey,
}

/// Ed25519 private key (RFC 8032).
///
/// Converts to and from [`ed25519_dalek::SigningKey`]. A server can use it as a host key, a
/// client for "publickey" authentication.
#[derive(Clone)]
#[cfg_attr(feature = "debug_less_secure", derive(Debug))]
pub struct Ed25519Privkey {
    pub(crate) signing: ed25519_dalek::SigningKey,
}

impl Ed25519Privkey {
    /// Creates the key from its 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { signing: ed25519_dalek::SigningKey::from_bytes(seed) }
    }

    /// Public half of the key.
    pub fn pubkey(&self) -> Ed25519Pubkey {
        Ed25519Pubkey { verifying: self.signing.verifying_key() }
    }
}

fn verify_ed25519(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    let Pubkey::Ed25519(pubkey) = pubkey else { return Err(Error::PubkeyFormat) };

    let mut blob = PacketDecode::new(signature);
    if blob.get_string()? != SIGNATURE_FORMAT {
        return Err(Error::Decode("signature is not in format 'ssh-ed25519'"))
    }
    let signature = ed25519_dalek::Signature::from_bytes(&blob.get_byte_array::<64>()?);

    pubkey.verifying.verify_strict(message, &signature)
        .map(|_| SignatureVerified::assertion())
        .map_err(|_| Error::Signature)
}

fn sign_ed25519(privkey: &Privkey, message: &[u8]) -> Result<Bytes> {
    use ed25519_dalek::Signer as _;
    let Privkey::Ed25519(privkey) = privkey else { return Err(Error::PrivkeyFormat) };

    let signature = privkey.signing.try_sign(message)
        .map_err(|_| Error::Crypto("ed25519 signing failed"))?;

    let mut blob = PacketEncode::new();
    blob.put_str(SIGNATURE_FORMAT);
    blob.put_bytes(&signature.to_bytes());
    Ok(blob.finish())
}

pub(super) fn encode_pubkey(blob: &mut PacketEncode, pubkey: &Ed25519Pubkey) {
    blob.put_str("ssh-ed25519");
    blob.put_bytes(pubkey.verifying.as_bytes());
}

pub(super) fn decode_pubkey(blob: &mut PacketDecode) -> Result<Ed25519Pubkey> {
    let point = blob.get_byte_array::<32>()?;
    ed25519_dalek::VerifyingKey::from_bytes(&point)
        .map(|verifying| Ed25519Pubkey { verifying })
        .map_err(|_| Error::Crypto("invalid ed25519 public key"))
}

impl From<ed25519_dalek::VerifyingKey> for Ed25519Pubkey {
    fn from(verifying: ed25519_dalek::VerifyingKey) -> Self { Self { verifying } }
}

impl From<Ed25519Pubkey> for ed25519_dalek::VerifyingKey {
    fn from(pubkey: Ed25519Pubkey) -> Self { pubkey.verifying }
}

impl From<ed25519_dalek::SigningKey> for Ed25519Privkey {
    fn from(signing: ed25519_dalek::SigningKey) -> Self { Self { signing } }
}

impl From<Ed25519Privkey> for ed25519_dalek::SigningKey {
    fn from(privkey: Ed25519Privkey) -> Self { privkey.signing }
}

impl fmt::Display for Ed25519Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ed25519 {:x}", Bytes::copy_from_slice(self.verifying.as_bytes()))
    }
}

impl PartialEq for Ed25519Privkey {
    fn eq(&self, other: &Self) -> bool {
        self.signing.to_bytes() == other.signing.to_bytes()
    }
}
impl Eq for Ed25519Privkey {}

#[cfg(test)]
mod tests {
    use super::*;

    fn privkey(seed: u8) -> Privkey {
        Ed25519Privkey::from_seed(&[seed; 32]).into()
    }

    #[test]
    fn test_sign_and_verify() {
        let privkey = privkey(1);
        let signature = sign_ed25519(&privkey, b"exchange hash").unwrap();
        assert!(verify_ed25519(&privkey.pubkey(), b"exchange hash", signature).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_message_and_key() {
        let privkey = privkey(1);
        let signature = sign_ed25519(&privkey, b"exchange hash").unwrap();
        assert!(matches!(
            verify_ed25519(&privkey.pubkey(), b"another hash", signature.clone()),
            Err(Error::Signature),
        ));
        assert!(matches!(
            verify_ed25519(&self::privkey(2).pubkey(), b"exchange hash", signature),
            Err(Error::Signature),
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_format() {
        let privkey = privkey(1);
        let mut blob = PacketEncode::new();
        blob.put_str("ssh-rsa");
        blob.put_bytes(&[0; 64]);
        assert!(matches!(
            verify_ed25519(&privkey.pubkey(), b"exchange hash", blob.finish()),
            Err(Error::Decode(_)),
        ));
    }

    #[test]
    fn test_pubkey_blob() {
        let pubkey = Ed25519Privkey::from_seed(&[3; 32]).pubkey();
        let mut blob = PacketEncode::new();
        encode_pubkey(&mut blob, &pubkey);
        let mut blob = PacketDecode::new(blob.finish());
        assert_eq!(blob.get_string().unwrap(), "ssh-ed25519");
        assert_eq!(decode_pubkey(&mut blob).unwrap(), pubkey);
    }
}
