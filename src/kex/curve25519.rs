use bytes::Bytes;
use std::task::Poll;
use zeroize::Zeroizing;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::conn::Role;
use crate::error::{Error, Result};
use crate::util::CryptoRngCore;
use super::{KexAlgo, KexInput, KexOutput, Kex, sign_exchange_hash};

/// "curve25519-sha256" key exchange from RFC 8731.
pub static CURVE25519_SHA256: KexAlgo = KexAlgo {
    name: "curve25519-sha256",
    make_kex: |rng, role| Ok(Box::new(init_kex(rng, role))),
};

/// "curve25519-sha256@libssh.com" key exchange, the pre-standard name of [`CURVE25519_SHA256`].
pub static CURVE25519_SHA256_LIBSSH: KexAlgo = KexAlgo {
    name: "curve25519-sha256@libssh.com",
    make_kex: |rng, role| Ok(Box::new(init_kex(rng, role))),
};

struct Curve25519Kex {
    role: Role,
    our_eph_privkey: Option<x25519_dalek::StaticSecret>,
    our_eph_pubkey: x25519_dalek::PublicKey,
    ecdh_init_done: bool,
    ecdh_init: Option<[u8; 32]>,
    ecdh_reply: Option<EcdhReply>,
}

struct EcdhReply {
    server_pubkey: Bytes,
    server_eph_pubkey: [u8; 32],
    server_exchange_hash_sign: Bytes,
}

impl Kex for Curve25519Kex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()> {
        match (self.role, msg_id) {
            (Role::Client, msg::KEX_ECDH_REPLY) => recv_ecdh_reply(self, payload),
            (Role::Server, msg::KEX_ECDH_INIT) => recv_ecdh_init(self, payload),
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn send_packet(&mut self) -> Result<Option<Bytes>> {
        if self.role == Role::Client && !self.ecdh_init_done {
            let payload = send_ecdh_init(self);
            self.ecdh_init_done = true;
            return Ok(Some(payload))
        }
        Ok(None)
    }

    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>> {
        if self.our_eph_privkey.is_none() {
            return Poll::Pending
        }
        if let Some(ecdh_reply) = self.ecdh_reply.take() {
            return Poll::Ready(client_exchange(self, ecdh_reply, input))
        }
        if let Some(client_eph_pubkey) = self.ecdh_init.take() {
            return Poll::Ready(server_exchange(self, client_eph_pubkey, input))
        }
        Poll::Pending
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        compute_hash(data)
    }
}

fn init_kex(rng: &mut dyn CryptoRngCore, role: Role) -> Curve25519Kex {
    let mut secret = Zeroizing::new([0u8; 32]);
    rng.fill_bytes(&mut *secret);
    let our_eph_privkey = x25519_dalek::StaticSecret::from(*secret);
    let our_eph_pubkey = x25519_dalek::PublicKey::from(&our_eph_privkey);
    log::debug!("initialized curve25519 kex as {:?}", role);
    Curve25519Kex {
        role,
        our_eph_privkey: Some(our_eph_privkey),
        our_eph_pubkey,
        ecdh_init_done: false,
        ecdh_init: None,
        ecdh_reply: None,
    }
}

fn send_ecdh_init(kex: &mut Curve25519Kex) -> Bytes {
    // RFC 5656, section 4
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::KEX_ECDH_INIT);
    payload.put_bytes(kex.our_eph_pubkey.as_bytes());
    log::debug!("sending SSH_MSG_KEX_ECDH_INIT");
    payload.finish()
}

fn recv_ecdh_init(kex: &mut Curve25519Kex, payload: &mut PacketDecode) -> Result<()> {
    if kex.ecdh_init_done {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEX_ECDH_INIT"))
    }

    // RFC 8731, section 3
    let client_eph_pubkey = payload.get_byte_array::<32>()?;
    kex.ecdh_init_done = true;
    kex.ecdh_init = Some(client_eph_pubkey);
    log::debug!("received SSH_MSG_KEX_ECDH_INIT");
    Ok(())
}

fn recv_ecdh_reply(kex: &mut Curve25519Kex, payload: &mut PacketDecode) -> Result<()> {
    if kex.ecdh_reply.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEX_ECDH_REPLY"))
    }

    // RFC 5656, section 4 and RFC 8731, section 3.1
    let server_pubkey = payload.get_bytes()?;
    let server_eph_pubkey = payload.get_byte_array::<32>()?;
    let server_exchange_hash_sign = payload.get_bytes()?;

    kex.ecdh_reply = Some(EcdhReply { server_pubkey, server_eph_pubkey, server_exchange_hash_sign });
    log::debug!("received SSH_MSG_KEX_ECDH_REPLY");
    Ok(())
}

fn agree(kex: &mut Curve25519Kex, their_eph_pubkey: [u8; 32]) -> Result<Zeroizing<Vec<u8>>> {
    let our_eph_privkey = kex.our_eph_privkey.take()
        .ok_or(Error::Crypto("curve25519 private key was already used"))?;
    let shared_secret = our_eph_privkey.diffie_hellman(&x25519_dalek::PublicKey::from(their_eph_pubkey));

    // RFC 8731, section 3: reject the all-zero shared secret
    if !shared_secret.was_contributory() {
        return Err(Error::Crypto("peer sent low-order curve25519 public key"))
    }
    Ok(Zeroizing::new(shared_secret.as_bytes().to_vec()))
}

fn client_exchange(kex: &mut Curve25519Kex, ecdh_reply: EcdhReply, input: KexInput) -> Result<KexOutput> {
    let EcdhReply { server_pubkey, server_eph_pubkey, server_exchange_hash_sign } = ecdh_reply;
    let shared_secret_be = agree(kex, server_eph_pubkey)?;
    let exchange_hash = exchange_hash(&input, &server_pubkey,
        kex.our_eph_pubkey.as_bytes(), &server_eph_pubkey, &shared_secret_be);

    Ok(KexOutput {
        shared_secret_be: shared_secret_be.to_vec(),
        exchange_hash, server_pubkey, server_exchange_hash_sign,
        reply: None,
    })
}

fn server_exchange(kex: &mut Curve25519Kex, client_eph_pubkey: [u8; 32], input: KexInput) -> Result<KexOutput> {
    let shared_secret_be = agree(kex, client_eph_pubkey)?;
    let our_eph_pubkey = *kex.our_eph_pubkey.as_bytes();
    let (server_pubkey, exchange_hash, server_exchange_hash_sign) = sign_exchange_hash(
        input.host_key,
        |server_pubkey| exchange_hash(&input, server_pubkey,
            &client_eph_pubkey, &our_eph_pubkey, &shared_secret_be),
    )?;

    // RFC 5656, section 4
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::KEX_ECDH_REPLY);
    payload.put_bytes(&server_pubkey);
    payload.put_bytes(&our_eph_pubkey);
    payload.put_bytes(&server_exchange_hash_sign);
    log::debug!("sending SSH_MSG_KEX_ECDH_REPLY");

    Ok(KexOutput {
        shared_secret_be: shared_secret_be.to_vec(),
        exchange_hash, server_pubkey, server_exchange_hash_sign,
        reply: Some(payload.finish()),
    })
}

fn exchange_hash(
    input: &KexInput,
    server_pubkey: &[u8],
    client_eph_pubkey: &[u8],
    server_eph_pubkey: &[u8],
    shared_secret_be: &[u8],
) -> Vec<u8> {
    let mut exchange_data = PacketEncode::new();
    exchange_data.put_bytes(input.client_ident);
    exchange_data.put_bytes(input.server_ident);
    exchange_data.put_bytes(input.client_kex_init);
    exchange_data.put_bytes(input.server_kex_init);
    exchange_data.put_bytes(server_pubkey);
    exchange_data.put_bytes(client_eph_pubkey);
    exchange_data.put_bytes(server_eph_pubkey);
    exchange_data.put_mpint_uint_be(shared_secret_be);
    compute_hash(&exchange_data.finish())
}

fn compute_hash(data: &[u8]) -> Vec<u8> {
    use sha2::digest::Digest as _;
    sha2::Sha256::digest(data).to_vec()
}
