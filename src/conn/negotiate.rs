use bytes::Bytes;
use rand::RngCore as _;
use std::future::Future as _;
use std::pin::Pin;
use std::task::Context;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use crate::cipher::CipherAlgo;
use crate::codec::{PacketEncode, PacketDecode};
use crate::codes::msg;
use crate::compress::CompressAlgo;
use crate::error::{Error, Result, AlgoNegotiateError};
use crate::kex::{Kex, KexAlgo, KexInput};
use crate::key_context::{self, AlgoSet, DeriveInput, KeyContext};
use crate::mac::MacAlgo;
use crate::pubkey::{Pubkey, PubkeyAlgo, SignatureVerified};
use super::Role;
use super::conn_state::{self, ConnState};
use super::event::{ConnEvent, AcceptPubkeySender, PubkeyAccepted, PubkeyDecision};
use super::pump::Pump;
use super::recv::ResultRecvState;

#[derive(Default)]
pub(super) struct NegotiateState {
    state: State,
    exchange: Exchange,
    rekey_timer: Option<Pin<Box<Sleep>>>,
    next_requested: bool,
    next_done_txs: Vec<oneshot::Sender<Result<()>>>,
}

/// State of a single key exchange, reset when the exchange completes.
#[derive(Default)]
struct Exchange {
    our_kex_init: Option<OurKexInit>,
    their_kex_init: Option<TheirKexInit>,
    algos: Option<AlgoSet>,
    kex: Option<Box<dyn Kex + Send>>,
    keys: Option<KeyContext>,
    signature_verified: Option<SignatureVerified>,
    pubkey_event: Option<ConnEvent>,
    pubkey_decision: Option<PubkeyDecision>,
    pubkey_accepted: Option<PubkeyAccepted>,
    new_keys_sent: bool,
    new_keys_recvd: bool,
    ignore_next: bool,
    done_txs: Vec<oneshot::Sender<Result<()>>>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    KexInit,
    Kex,
    AcceptPubkey,
    NewKeys,
}

struct OurKexInit {
    payload: Bytes,
    kex_algos: Vec<&'static KexAlgo>,
    host_key_algos: Vec<&'static PubkeyAlgo>,
    cipher_algos: Vec<&'static CipherAlgo>,
    mac_algos: Vec<&'static MacAlgo>,
    compress_algos: Vec<&'static CompressAlgo>,
}

#[derive(Debug)]
struct TheirKexInit {
    payload: Bytes,
    kex_algos: Vec<String>,
    host_key_algos: Vec<String>,
    cipher_algos_cts: Vec<String>,
    cipher_algos_stc: Vec<String>,
    mac_algos_cts: Vec<String>,
    mac_algos_stc: Vec<String>,
    compress_algos_cts: Vec<String>,
    compress_algos_stc: Vec<String>,
    first_kex_packet_follows: bool,
}

pub(super) fn init_negotiate() -> NegotiateState {
    NegotiateState { state: State::KexInit, .. NegotiateState::default() }
}

pub(super) fn pump_negotiate(st: &mut ConnState, cx: &mut Context) -> Result<Pump> {
    match st.negotiate_st.state {
        State::Idle => {
            if should_rekey(st, cx) {
                log::debug!("starting key re-exchange");
                let done_txs = std::mem::take(&mut st.negotiate_st.next_done_txs);
                st.negotiate_st.next_requested = false;
                st.negotiate_st.exchange.done_txs = done_txs;
                st.negotiate_st.state = State::KexInit;
                return Ok(Pump::Progress)
            }
        },
        State::KexInit => {
            if st.negotiate_st.exchange.our_kex_init.is_none() {
                st.negotiate_st.exchange.our_kex_init = Some(send_kex_init(st)?);
                return Ok(Pump::Progress)
            }

            if st.negotiate_st.exchange.their_kex_init.is_some() {
                let algos = negotiate_algos(st)?;
                let kex = (algos.kex.make_kex)(&mut *st.rng, st.role)?;
                check_kex_guess(st, &algos);
                st.negotiate_st.exchange.algos = Some(algos);
                st.negotiate_st.exchange.kex = Some(kex);
                st.negotiate_st.state = State::Kex;
                return Ok(Pump::Progress)
            }
        },
        State::Kex => return pump_kex(st),
        State::AcceptPubkey => {
            let exchange = &mut st.negotiate_st.exchange;
            if exchange.pubkey_event.is_some() {
                let reserve_res = pump_ready!(st.event_tx.poll_reserve(cx));
                if let Some(pubkey_event) = exchange.pubkey_event.take() {
                    if reserve_res.is_ok() {
                        let _ = st.event_tx.send_item(pubkey_event);
                    }
                }
            }

            let Some(decision) = exchange.pubkey_decision.as_mut() else {
                return Err(Error::Protocol("server public key is not pending"))
            };
            let accepted = pump_ready!(decision.poll_decision(cx))?;
            log::debug!("server pubkey was accepted");
            exchange.pubkey_accepted = Some(accepted);
            st.negotiate_st.state = State::NewKeys;
            return Ok(Pump::Progress)
        },
        State::NewKeys => {
            let exchange = &st.negotiate_st.exchange;
            debug_assert!(st.role == Role::Server || exchange.signature_verified.is_some());
            debug_assert!(st.role == Role::Server || exchange.pubkey_accepted.is_some());

            if !exchange.new_keys_sent {
                send_new_keys(st)?;
                return Ok(Pump::Progress)
            }

            if exchange.new_keys_recvd {
                finish_kex(st);
                return Ok(Pump::Progress)
            }
        },
    }
    Ok(Pump::Pending)
}

fn pump_kex(st: &mut ConnState) -> Result<Pump> {
    let Some(mut kex) = st.negotiate_st.exchange.kex.take() else {
        return Err(Error::Protocol("key exchange is not initialized"))
    };
    let res = poll_kex(st, &mut *kex);
    st.negotiate_st.exchange.kex = Some(kex);
    res
}

fn poll_kex(st: &mut ConnState, kex: &mut (dyn Kex + Send)) -> Result<Pump> {
    if let Some(payload) = kex.send_packet()? {
        st.codec.send_pipe.feed_packet(&payload)?;
        return Ok(Pump::Progress)
    }

    let (Some(algos), Some(our), Some(their)) = (
        st.negotiate_st.exchange.algos,
        st.negotiate_st.exchange.our_kex_init.as_ref(),
        st.negotiate_st.exchange.their_kex_init.as_ref(),
    ) else {
        return Err(Error::Protocol("key exchange started before negotiation"))
    };

    let (client_kex_init, server_kex_init) = match st.role {
        Role::Client => (&our.payload, &their.payload),
        Role::Server => (&their.payload, &our.payload),
    };
    let host_key = match st.role {
        Role::Client => None,
        Role::Server => {
            let hooks = st.hooks.as_ref().ok_or(Error::HostKeyMissing(algos.host_key.name))?;
            let privkey = hooks.host_key_for(algos.host_key)
                .ok_or(Error::HostKeyMissing(algos.host_key.name))?;
            Some((privkey, algos.host_key))
        },
    };
    let kex_input = KexInput {
        client_ident: st.client_ident(),
        server_ident: st.server_ident(),
        client_kex_init,
        server_kex_init,
        host_key,
    };
    let kex_output = pump_ready!(kex.poll(kex_input))?;
    log::debug!("finished kex {:?}", algos.kex.name);

    if st.session_id.is_none() {
        st.session_id = Some(kex_output.exchange_hash.clone());
    }

    let keys = {
        let session_id = st.session_id.as_deref().unwrap_or_default();
        let compute_hash = |data: &[u8]| kex.compute_hash(data);
        key_context::derive_key_context(st.role, &algos, &DeriveInput {
            shared_secret_be: &kex_output.shared_secret_be,
            exchange_hash: &kex_output.exchange_hash,
            session_id,
            compute_hash: &compute_hash,
        })
    };
    st.negotiate_st.exchange.keys = Some(keys);

    match st.role {
        Role::Client => {
            let pubkey = Pubkey::decode(kex_output.server_pubkey.clone())?;
            log::debug!("server pubkey {}", pubkey);
            let signature_verified = pubkey.verify(
                algos.host_key, &kex_output.exchange_hash, kex_output.server_exchange_hash_sign.clone())?;

            let (accept_tx, decision) = AcceptPubkeySender::new();
            let exchange = &mut st.negotiate_st.exchange;
            exchange.signature_verified = Some(signature_verified);
            exchange.pubkey_event = Some(ConnEvent::ServerPubkey(pubkey, accept_tx));
            exchange.pubkey_decision = Some(decision);
            st.negotiate_st.state = State::AcceptPubkey;
        },
        Role::Server => {
            if let Some(reply) = kex_output.reply.as_ref() {
                st.codec.send_pipe.feed_packet(reply)?;
            }
            st.negotiate_st.state = State::NewKeys;
        },
    }
    Ok(Pump::Progress)
}

fn should_rekey(st: &mut ConnState, cx: &mut Context) -> bool {
    if st.session_id.is_none() {
        return false
    }
    if st.negotiate_st.next_requested {
        return true
    }

    let bytes = st.codec.bytes_since_keys();
    if bytes >= st.config.rekey_after_bytes() {
        log::debug!("transferred {} bytes since the last key exchange", bytes);
        return true
    }

    if let Some(timer) = st.negotiate_st.rekey_timer.as_mut() {
        if timer.as_mut().poll(cx).is_ready() {
            log::debug!("rekey timer elapsed");
            return true
        }
    }
    false
}

fn finish_kex(st: &mut ConnState) {
    let exchange = std::mem::take(&mut st.negotiate_st.exchange);
    for done_tx in exchange.done_txs {
        let _ = done_tx.send(Ok(()));
    }

    st.negotiate_st.state = State::Idle;
    st.negotiate_st.rekey_timer = Some(Box::pin(tokio::time::sleep(st.config.rekey_after_duration)));
    log::debug!("key exchange completed");
}

/// Requests a key exchange, `done_tx` is notified when it completes.
///
/// If an exchange is in progress, a new one is started after the current one completes.
pub(super) fn start_kex(st: &mut ConnState, done_tx: Option<oneshot::Sender<Result<()>>>) {
    st.negotiate_st.next_requested = true;
    if let Some(done_tx) = done_tx {
        st.negotiate_st.next_done_txs.push(done_tx);
    }
    conn_state::wakeup_conn(st);
}

pub(super) fn recv_negotiate_packet(
    st: &mut ConnState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    match msg_id {
        msg::KEXINIT => recv_kex_init(st, payload),
        msg::NEWKEYS => recv_new_keys(st, payload),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

pub(super) fn recv_kex_packet(
    st: &mut ConnState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    if let Some(kex) = st.negotiate_st.exchange.kex.as_mut() {
        kex.recv_packet(msg_id, payload)?;
        Ok(None)
    } else {
        Err(Error::Protocol("received unexpected kex message"))
    }
}

fn send_kex_init(st: &mut ConnState) -> Result<OurKexInit> {
    let config = st.config.clone();
    let host_key_algos = match st.role {
        Role::Client => config.host_key_algos.clone(),
        Role::Server => {
            let hooks = st.hooks.as_ref();
            config.host_key_algos.iter()
                .filter(|algo| hooks.and_then(|hooks| hooks.host_key_for(algo)).is_some())
                .copied().collect()
        },
    };

    let mut cookie = [0; 16];
    st.rng.try_fill_bytes(&mut cookie)
        .map_err(|_| Error::Random("could not generate random cookie"))?;

    fn get_algo_names<A: NamedAlgo>(algos: &[&A]) -> Vec<&'static str> {
        algos.iter().map(|algo| algo.name()).collect()
    }

    // RFC 4253, section 7.1
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::KEXINIT);
    payload.put_raw(&cookie);
    payload.put_name_list(&get_algo_names(&config.kex_algos));
    payload.put_name_list(&get_algo_names(&host_key_algos));
    payload.put_name_list(&get_algo_names(&config.cipher_algos));
    payload.put_name_list(&get_algo_names(&config.cipher_algos));
    payload.put_name_list(&get_algo_names(&config.mac_algos));
    payload.put_name_list(&get_algo_names(&config.mac_algos));
    payload.put_name_list(&get_algo_names(&config.compress_algos));
    payload.put_name_list(&get_algo_names(&config.compress_algos));
    payload.put_name_list(&[]);
    payload.put_name_list(&[]);
    payload.put_bool(false);
    payload.put_u32(0);
    let payload = payload.finish();
    st.codec.send_pipe.feed_packet(&payload)?;
    log::debug!("sending SSH_MSG_KEXINIT");

    Ok(OurKexInit {
        payload,
        kex_algos: config.kex_algos.clone(),
        host_key_algos,
        cipher_algos: config.cipher_algos.clone(),
        mac_algos: config.mac_algos.clone(),
        compress_algos: config.compress_algos.clone(),
    })
}

fn recv_kex_init(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    // RFC 4253, section 7.1
    payload.skip(16)?; // cookie
    let kex_init = TheirKexInit {
        kex_algos: payload.get_name_list()?,
        host_key_algos: payload.get_name_list()?,
        cipher_algos_cts: payload.get_name_list()?,
        cipher_algos_stc: payload.get_name_list()?,
        mac_algos_cts: payload.get_name_list()?,
        mac_algos_stc: payload.get_name_list()?,
        compress_algos_cts: payload.get_name_list()?,
        compress_algos_stc: payload.get_name_list()?,
        first_kex_packet_follows: {
            payload.get_name_list()?; // languages_client_to_server
            payload.get_name_list()?; // languages_server_to_client
            payload.get_bool()?
        },
        payload: Bytes::copy_from_slice(payload.as_original_bytes()),
    };
    payload.get_u32()?; // reserved
    log::debug!("received SSH_MSG_KEXINIT: {:?}", kex_init);

    let negotiate_st = &mut st.negotiate_st;
    match negotiate_st.state {
        State::Idle | State::KexInit if negotiate_st.exchange.their_kex_init.is_none() => {
            if negotiate_st.state == State::Idle {
                negotiate_st.exchange.done_txs = std::mem::take(&mut negotiate_st.next_done_txs);
                negotiate_st.next_requested = false;
            }
            negotiate_st.exchange.their_kex_init = Some(kex_init);
            negotiate_st.state = State::KexInit;
            Ok(None)
        },
        _ => Err(Error::Protocol("received SSH_MSG_KEXINIT during negotiation")),
    }
}

/// Evaluates the guess of a peer that sent `first_kex_packet_follows` (RFC 4253, section 7).
fn check_kex_guess(st: &mut ConnState, algos: &AlgoSet) {
    let Some(their) = st.negotiate_st.exchange.their_kex_init.as_ref() else { return };
    if !their.first_kex_packet_follows {
        return
    }

    let guess_ok = their.kex_algos.first().map(String::as_str) == Some(algos.kex.name) &&
        their.host_key_algos.first().map(String::as_str) == Some(algos.host_key.name);
    log::debug!("peer guessed kex {}", if guess_ok { "correctly" } else { "wrong" });
    st.negotiate_st.exchange.ignore_next = !guess_ok;
}

/// Returns true if the packet should be dropped because it follows a wrong kex guess.
pub(super) fn ignore_next_packet(st: &mut ConnState, msg_id: u8) -> bool {
    let exchange = &mut st.negotiate_st.exchange;
    if exchange.ignore_next && (30..=49).contains(&msg_id) {
        exchange.ignore_next = false;
        return true
    }
    false
}

/// Returns true between the peer's `SSH_MSG_KEXINIT` and `SSH_MSG_NEWKEYS`.
pub(super) fn their_kex_in_progress(st: &ConnState) -> bool {
    let exchange = &st.negotiate_st.exchange;
    exchange.their_kex_init.is_some() && !exchange.new_keys_recvd
}

fn negotiate_algos(st: &ConnState) -> Result<AlgoSet> {
    let (Some(our), Some(their)) = (
        st.negotiate_st.exchange.our_kex_init.as_ref(),
        st.negotiate_st.exchange.their_kex_init.as_ref(),
    ) else {
        return Err(Error::Protocol("cannot negotiate algorithms without both SSH_MSG_KEXINIT"))
    };
    let role = st.role;

    Ok(AlgoSet {
        kex: negotiate_algo(role, &our.kex_algos, &their.kex_algos, "key exchange")?,
        host_key: negotiate_algo(role, &our.host_key_algos, &their.host_key_algos, "host key")?,
        cipher_cts: negotiate_algo(
            role, &our.cipher_algos, &their.cipher_algos_cts, "cipher client-to-server")?,
        cipher_stc: negotiate_algo(
            role, &our.cipher_algos, &their.cipher_algos_stc, "cipher server-to-client")?,
        mac_cts: negotiate_algo(role, &our.mac_algos, &their.mac_algos_cts, "mac client-to-server")?,
        mac_stc: negotiate_algo(role, &our.mac_algos, &their.mac_algos_stc, "mac server-to-client")?,
        compress_cts: negotiate_algo(
            role, &our.compress_algos, &their.compress_algos_cts, "compression client-to-server")?,
        compress_stc: negotiate_algo(
            role, &our.compress_algos, &their.compress_algos_stc, "compression server-to-client")?,
    })
}

/// Selects the algorithm, the client's order of preference decides (RFC 4253, section 7.1).
fn negotiate_algo<A: NamedAlgo>(
    role: Role,
    our_algos: &[&'static A],
    their_algos: &[String],
    name: &'static str,
) -> Result<&'static A> {
    let our_names = our_algos.iter().map(|algo| algo.name()).collect::<Vec<_>>();
    let their_names = their_algos.iter().map(String::as_str).collect::<Vec<_>>();
    let (client_names, server_names) = match role {
        Role::Client => (&our_names, &their_names),
        Role::Server => (&their_names, &our_names),
    };

    let picked = pick_algo_name(client_names, server_names)
        .and_then(|picked| our_algos.iter().find(|algo| algo.name() == picked));
    match picked {
        Some(algo) => {
            log::debug!("negotiated algo {:?} for {}", algo.name(), name);
            Ok(algo)
        },
        None => Err(Error::AlgoNegotiate(AlgoNegotiateError {
            algo_name: name.into(),
            client_algos: client_names.iter().map(|&n| n.into()).collect(),
            server_algos: server_names.iter().map(|&n| n.into()).collect(),
        })),
    }
}

fn pick_algo_name<'a>(client_names: &[&'a str], server_names: &[&str]) -> Option<&'a str> {
    client_names.iter().copied().find(|client_name| server_names.contains(client_name))
}

trait NamedAlgo { fn name(&self) -> &'static str; }
impl NamedAlgo for KexAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for CipherAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for MacAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for PubkeyAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for CompressAlgo { fn name(&self) -> &'static str { self.name } }

fn recv_new_keys(st: &mut ConnState, _payload: &mut PacketDecode) -> ResultRecvState {
    let exchange = &mut st.negotiate_st.exchange;
    if exchange.their_kex_init.is_none() || exchange.new_keys_recvd {
        return Err(Error::Protocol("received unexpected SSH_MSG_NEWKEYS"))
    }
    let keys = exchange.keys.as_mut().and_then(|keys| keys.recv.take())
        .ok_or(Error::Protocol("received SSH_MSG_NEWKEYS before key exchange completed"))?;

    st.codec.recv_pipe.set_keys(keys)?;
    exchange.new_keys_recvd = true;
    log::debug!("received SSH_MSG_NEWKEYS and applied new keys");
    Ok(None)
}

fn send_new_keys(st: &mut ConnState) -> Result<()> {
    let exchange = &mut st.negotiate_st.exchange;
    let keys = exchange.keys.as_mut().and_then(|keys| keys.send.take())
        .ok_or(Error::Protocol("keys were not derived"))?;

    let mut payload = PacketEncode::new();
    payload.put_u8(msg::NEWKEYS);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    st.codec.send_pipe.set_keys(keys)?;
    exchange.new_keys_sent = true;
    log::debug!("sending SSH_MSG_NEWKEYS and applied new keys");
    Ok(())
}

/// Returns true when no key exchange is in progress and other messages may be sent.
pub(super) fn is_ready(st: &ConnState) -> bool {
    st.negotiate_st.state == State::Idle
}
