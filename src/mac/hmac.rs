use hmac::{Hmac, Mac as _};
use crate::error::{Error, Result};
use super::{Mac, MacAlgo, MacVerified};

/// "hmac-sha2-256" MAC from RFC 6668.
pub static HMAC_SHA2_256: MacAlgo = MacAlgo {
    name: "hmac-sha2-256",
    tag_len: 32,
    key_len: 32,
    make_mac: |key| Ok(Box::new(HmacMac::Sha256(new_hmac(key)?))),
};

/// "hmac-sha2-512" MAC from RFC 6668.
pub static HMAC_SHA2_512: MacAlgo = MacAlgo {
    name: "hmac-sha2-512",
    tag_len: 64,
    key_len: 64,
    make_mac: |key| Ok(Box::new(HmacMac::Sha512(new_hmac(key)?))),
};

/// "hmac-sha1" MAC from RFC 4253.
pub static HMAC_SHA1: MacAlgo = MacAlgo {
    name: "hmac-sha1",
    tag_len: 20,
    key_len: 20,
    make_mac: |key| Ok(Box::new(HmacMac::Sha1(new_hmac(key)?))),
};

// keyed state; every packet is authenticated with a fresh clone of it
enum HmacMac {
    Sha1(Hmac<sha1::Sha1>),
    Sha256(Hmac<sha2::Sha256>),
    Sha512(Hmac<sha2::Sha512>),
}

fn new_hmac<M: hmac::digest::KeyInit>(key: &[u8]) -> Result<M> {
    M::new_from_slice(key).map_err(|_| Error::Crypto("invalid hmac key"))
}

fn update<M: hmac::Mac>(mut mac: M, packet_seq: u32, plaintext: &[u8]) -> M {
    mac.update(&packet_seq.to_be_bytes());
    mac.update(plaintext);
    mac
}

impl Mac for HmacMac {
    fn sign(&mut self, packet_seq: u32, plaintext: &[u8], tag: &mut [u8]) {
        match self {
            HmacMac::Sha1(mac) =>
                tag.copy_from_slice(&update(mac.clone(), packet_seq, plaintext).finalize().into_bytes()),
            HmacMac::Sha256(mac) =>
                tag.copy_from_slice(&update(mac.clone(), packet_seq, plaintext).finalize().into_bytes()),
            HmacMac::Sha512(mac) =>
                tag.copy_from_slice(&update(mac.clone(), packet_seq, plaintext).finalize().into_bytes()),
        }
    }

    fn verify(&mut self, packet_seq: u32, plaintext: &[u8], tag: &[u8]) -> Result<MacVerified> {
        // `verify_slice` compares in constant time
        let res = match self {
            HmacMac::Sha1(mac) => update(mac.clone(), packet_seq, plaintext).verify_slice(tag),
            HmacMac::Sha256(mac) => update(mac.clone(), packet_seq, plaintext).verify_slice(tag),
            HmacMac::Sha512(mac) => update(mac.clone(), packet_seq, plaintext).verify_slice(tag),
        };
        res.map(|_| MacVerified::assertion()).map_err(|_| Error::Mac)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = [0x0b; 20];
        let mut mac = (HMAC_SHA1.make_mac)(&key).unwrap();
        let mut tag = [0; 20];
        mac.sign(3, b"packet", &mut tag);
        assert!(mac.verify(3, b"packet", &tag).is_ok());
        assert!(matches!(mac.verify(4, b"packet", &tag), Err(Error::Mac)));
        assert!(matches!(mac.verify(3, b"packeT", &tag), Err(Error::Mac)));
    }

    #[test]
    fn test_hmac_sha256_vector() {
        // RFC 4231, test case 2, with the message split into a sequence number and the rest
        let mut mac = (HMAC_SHA2_256.make_mac)(b"Jefe").unwrap();
        let mut tag = [0; 32];
        mac.sign(u32::from_be_bytes(*b"what"), b" do ya want for nothing?", &mut tag);
        assert_eq!(tag, hex!("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"));
    }
}
