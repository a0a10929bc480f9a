//! Key exchange algorithms.
//!
//! The SSH protocol supports several key exchange (kex) algorithms, which are used to establish
//! the one-time keys used for message [encryption][crate::cipher] and
//! [authentication][crate::mac].
//!
//! The client and the server exchange lists of supported algorithms, and the first algorithm on
//! the client's list that is also supported by the server is used for the connection.
//!
//! # Supported algorithms
//!
//! - "curve25519-sha256" / "curve25519-sha256@libssh.com" ([`CURVE25519_SHA256`] /
//! [`CURVE25519_SHA256_LIBSSH`])
//! - "diffie-hellman-group14-sha256" ([`DIFFIE_HELLMAN_GROUP14_SHA256`])
//! - "diffie-hellman-group16-sha512" ([`DIFFIE_HELLMAN_GROUP16_SHA512`])
//! - "diffie-hellman-group14-sha1" ([`DIFFIE_HELLMAN_GROUP14_SHA1`])
//! - "diffie-hellman-group1-sha1" ([`DIFFIE_HELLMAN_GROUP1_SHA1`])
use bytes::Bytes;
use derivative::Derivative;
use std::task::Poll;
use crate::Result;
use crate::codec::PacketDecode;
use crate::conn::Role;
use crate::error::Error;
use crate::pubkey::{Privkey, PubkeyAlgo};
use crate::util::CryptoRngCore;
pub use self::curve25519::{CURVE25519_SHA256, CURVE25519_SHA256_LIBSSH};
pub use self::dh::{
    DIFFIE_HELLMAN_GROUP14_SHA256, DIFFIE_HELLMAN_GROUP16_SHA512,
    DIFFIE_HELLMAN_GROUP14_SHA1, DIFFIE_HELLMAN_GROUP1_SHA1,
};

mod curve25519;
mod dh;

/// Algorithm for key exchange.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct KexAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    #[derivative(Debug = "ignore")]
    pub(crate) make_kex: fn(rng: &mut dyn CryptoRngCore, role: Role) -> Result<Box<dyn Kex + Send>>,
}

pub(crate) struct KexInput<'a> {
    pub client_ident: &'a [u8],
    pub server_ident: &'a [u8],
    pub client_kex_init: &'a [u8],
    pub server_kex_init: &'a [u8],
    /// Our host key and the negotiated algorithm to sign with (server only).
    pub host_key: Option<(&'a Privkey, &'static PubkeyAlgo)>,
}

pub(crate) struct KexOutput {
    pub shared_secret_be: Vec<u8>,
    pub exchange_hash: Vec<u8>,
    pub server_pubkey: Bytes,
    pub server_exchange_hash_sign: Bytes,
    /// Reply that the server must send to the client.
    pub reply: Option<Bytes>,
}

/// One run of a key exchange method, in either role.
///
/// The client sends its public value from [`send_packet()`][Kex::send_packet()] and completes in
/// [`poll()`][Kex::poll()] once the reply is received. The server completes in `poll()` once the
/// public value of the client is received and returns the reply in [`KexOutput::reply`].
pub(crate) trait Kex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()>;
    fn send_packet(&mut self) -> Result<Option<Bytes>>;
    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>>;
    fn compute_hash(&self, data: &[u8]) -> Vec<u8>;
}

/// Encodes our host key and signs the exchange hash, which is computed by `hash_with_pubkey`
/// from the encoded host key.
fn sign_exchange_hash(
    host_key: Option<(&Privkey, &'static PubkeyAlgo)>,
    hash_with_pubkey: impl FnOnce(&[u8]) -> Vec<u8>,
) -> Result<(Bytes, Vec<u8>, Bytes)> {
    let (privkey, algo) = host_key.ok_or(Error::HostKeyMissing("any"))?;
    let server_pubkey = privkey.pubkey().encode();
    let exchange_hash = hash_with_pubkey(&server_pubkey);
    let signature = privkey.sign(algo, &exchange_hash)?;
    log::debug!("signed exchange hash with host key algorithm {:?}", algo.name);
    Ok((server_pubkey, exchange_hash, signature))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use rand_chacha::ChaCha8Rng;
    use crate::codec::PacketDecode;
    use crate::pubkey::{self, Privkey, Pubkey};
    use super::*;

    fn host_key() -> Privkey {
        Privkey::Ed25519(ed25519_dalek::SigningKey::from_bytes(&[7; 32]).into())
    }

    fn deliver(from: &mut dyn Kex, to: &mut dyn Kex) {
        let packet = from.send_packet().unwrap().expect("kex should send a packet");
        let mut payload = PacketDecode::new(packet);
        let msg_id = payload.get_u8().unwrap();
        to.recv_packet(msg_id, &mut payload).unwrap();
    }

    fn input<'a>(host_key: Option<(&'a Privkey, &'static PubkeyAlgo)>) -> KexInput<'a> {
        KexInput {
            client_ident: b"SSH-2.0-client",
            server_ident: b"SSH-2.0-server",
            client_kex_init: b"client kexinit",
            server_kex_init: b"server kexinit",
            host_key,
        }
    }

    fn check_exchange(algo: &KexAlgo) {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let host_key = host_key();
        let mut client = (algo.make_kex)(&mut rng, Role::Client).unwrap();
        let mut server = (algo.make_kex)(&mut rng, Role::Server).unwrap();

        assert!(client.poll(input(None)).is_pending());
        assert!(server.send_packet().unwrap().is_none());
        deliver(&mut *client, &mut *server);
        assert!(client.send_packet().unwrap().is_none());

        let server_output = match server.poll(input(Some((&host_key, &pubkey::SSH_ED25519)))) {
            Poll::Ready(res) => res.unwrap(),
            Poll::Pending => panic!("server kex should be ready"),
        };

        let reply = server_output.reply.clone().expect("server should reply");
        let mut payload = PacketDecode::new(reply);
        let msg_id = payload.get_u8().unwrap();
        client.recv_packet(msg_id, &mut payload).unwrap();

        let client_output = match client.poll(input(None)) {
            Poll::Ready(res) => res.unwrap(),
            Poll::Pending => panic!("client kex should be ready"),
        };

        assert!(client_output.reply.is_none());
        assert_eq!(client_output.shared_secret_be, server_output.shared_secret_be);
        assert_eq!(client_output.exchange_hash, server_output.exchange_hash);
        assert_eq!(client_output.server_pubkey, host_key.pubkey().encode());

        let pubkey = Pubkey::decode(client_output.server_pubkey.clone()).unwrap();
        pubkey.verify(&pubkey::SSH_ED25519, &client_output.exchange_hash,
            client_output.server_exchange_hash_sign.clone()).unwrap();
    }

    #[test]
    fn test_curve25519() {
        check_exchange(&CURVE25519_SHA256);
        check_exchange(&CURVE25519_SHA256_LIBSSH);
    }

    #[test]
    fn test_diffie_hellman() {
        check_exchange(&DIFFIE_HELLMAN_GROUP14_SHA256);
        check_exchange(&DIFFIE_HELLMAN_GROUP14_SHA1);
        check_exchange(&DIFFIE_HELLMAN_GROUP1_SHA1);
    }

    #[test]
    fn test_diffie_hellman_group16() {
        check_exchange(&DIFFIE_HELLMAN_GROUP16_SHA512);
    }

    #[test]
    fn test_server_without_host_key() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut client = (CURVE25519_SHA256.make_kex)(&mut rng, Role::Client).unwrap();
        let mut server = (CURVE25519_SHA256.make_kex)(&mut rng, Role::Server).unwrap();
        deliver(&mut *client, &mut *server);
        assert!(matches!(server.poll(input(None)), Poll::Ready(Err(Error::HostKeyMissing(_)))));
    }

    #[test]
    fn test_duplicate_init_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut server = (DIFFIE_HELLMAN_GROUP14_SHA256.make_kex)(&mut rng, Role::Server).unwrap();
        for (i, expect_ok) in [(0, true), (1, false)] {
            let mut client = (DIFFIE_HELLMAN_GROUP14_SHA256.make_kex)(&mut rng, Role::Client).unwrap();
            let packet = client.send_packet().unwrap().unwrap();
            let mut payload = PacketDecode::new(packet);
            let msg_id = payload.get_u8().unwrap();
            assert_eq!(server.recv_packet(msg_id, &mut payload).is_ok(), expect_ok, "{}", i);
        }
    }

    #[test]
    fn test_wrong_role_packet() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut client = (CURVE25519_SHA256.make_kex)(&mut rng, Role::Client).unwrap();
        let mut other = (CURVE25519_SHA256.make_kex)(&mut rng, Role::Client).unwrap();
        // a client never accepts SSH_MSG_KEX_ECDH_INIT
        let packet = other.send_packet().unwrap().unwrap();
        let mut payload = PacketDecode::new(packet);
        let msg_id = payload.get_u8().unwrap();
        assert!(client.recv_packet(msg_id, &mut payload).is_err());
    }
}
