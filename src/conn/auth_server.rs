use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future as _;
use std::pin::Pin;
use std::task::Context;
use tokio::time::Sleep;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Result, Error};
use crate::pubkey::{Pubkey, PubkeyAlgo};
use super::auth_method::pubkey_signed_data;
use super::conn_state::ConnState;
use super::event::ConnEvent;
use super::negotiate;
use super::pump::Pump;
use super::recv::{self, ResultRecvState};

/// Decides whether a client may log in.
///
/// The server calls [`authenticate()`][Self::authenticate()] for every authentication request
/// of the client. The protocol details (such as the verification of public key signatures) are
/// handled by the connection, the authenticator only makes the decision.
pub trait Authenticator: Send + Sync {
    /// Methods that we list in `SSH_MSG_USERAUTH_FAILURE`.
    fn methods(&self) -> Vec<String> {
        vec!["publickey".into(), "password".into()]
    }

    /// Returns true if the request should be accepted.
    fn authenticate(&self, request: &AuthRequest) -> bool;
}

/// Authentication request of a client, passed to [`Authenticator::authenticate()`].
#[derive(Debug)]
pub struct AuthRequest<'a> {
    /// Name of the user that wants to log in.
    pub username: &'a str,
    /// Method and credentials of the request.
    pub method: AuthRequestMethod<'a>,
}

/// Method and credentials of an [`AuthRequest`].
///
/// This enum is `#[non_exhaustive]`, because we may support more methods in the future.
#[derive(Debug)]
#[non_exhaustive]
pub enum AuthRequestMethod<'a> {
    /// The "none" method.
    None,
    /// The "password" method with the given password.
    Password(&'a str),
    /// The "publickey" method.
    ///
    /// If `verified` is false, the client only asks whether the key would be acceptable; if we
    /// accept it, the client will follow up with a signed request. If `verified` is true, the
    /// client has proven that it owns the private key.
    Pubkey {
        /// Public key of the client.
        pubkey: &'a Pubkey,
        /// Algorithm that the client uses with the key.
        algo: &'static PubkeyAlgo,
        /// True if we have verified the signature.
        verified: bool,
    },
}

#[derive(Default)]
pub(super) struct ServerAuthState {
    service_accepted: bool,
    username: Option<String>,
    failed_tries: u32,
    banner_sent: bool,
    deadline: Option<Pin<Box<Sleep>>>,
    replies: VecDeque<Reply>,
}

#[derive(Debug)]
enum Reply {
    ServiceAccept,
    Banner(String),
    Success,
    Failure,
    PkOk { algo_name: &'static str, pubkey_blob: Bytes },
}

impl ServerAuthState {
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
}

pub(super) fn init_auth_server() -> ServerAuthState {
    ServerAuthState::default()
}

pub(super) fn pump_auth_server(st: &mut ConnState, cx: &mut Context) -> Result<Pump> {
    if st.auth_server_st.username.is_none() {
        let auth_timeout = st.config.auth_timeout;
        let deadline = st.auth_server_st.deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(auth_timeout)));
        if deadline.as_mut().poll(cx).is_ready() {
            log::debug!("authentication timed out after {:?}", auth_timeout);
            return Err(Error::AuthTimeout)
        }
    } else {
        st.auth_server_st.deadline = None;
    }

    if !negotiate::is_ready(st) {
        return Ok(Pump::Pending)
    }
    let Some(reply) = st.auth_server_st.replies.pop_front() else { return Ok(Pump::Pending) };
    send_reply(st, reply)?;
    Ok(Pump::Progress)
}

fn send_reply(st: &mut ConnState, reply: Reply) -> Result<()> {
    let is_success = matches!(reply, Reply::Success);
    let mut payload = PacketEncode::new();
    match reply {
        Reply::ServiceAccept => {
            payload.put_u8(msg::SERVICE_ACCEPT);
            payload.put_str("ssh-userauth");
            log::debug!("sending SSH_MSG_SERVICE_ACCEPT for 'ssh-userauth'");
        },
        Reply::Banner(message) => {
            // RFC 4252, section 5.4
            payload.put_u8(msg::USERAUTH_BANNER);
            payload.put_str(&message);
            payload.put_str("");
            log::debug!("sending SSH_MSG_USERAUTH_BANNER");
        },
        Reply::Success => {
            payload.put_u8(msg::USERAUTH_SUCCESS);
            log::debug!("sending SSH_MSG_USERAUTH_SUCCESS");
        },
        Reply::Failure => {
            let methods = auth_methods(st);
            let methods = methods.iter().map(String::as_str).collect::<Vec<_>>();
            payload.put_u8(msg::USERAUTH_FAILURE);
            payload.put_name_list(&methods);
            payload.put_bool(false);
            log::debug!("sending SSH_MSG_USERAUTH_FAILURE");
        },
        Reply::PkOk { algo_name, pubkey_blob } => {
            // RFC 4252, section 7
            payload.put_u8(msg::USERAUTH_PK_OK);
            payload.put_str(algo_name);
            payload.put_bytes(&pubkey_blob);
            log::debug!("sending SSH_MSG_USERAUTH_PK_OK");
        },
    }
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    if is_success {
        st.codec.send_pipe.set_authenticated();
    }
    Ok(())
}

fn auth_methods(st: &ConnState) -> Vec<String> {
    match st.hooks.as_ref() {
        Some(hooks) => hooks.authenticator.methods(),
        None => Vec::new(),
    }
}

pub(super) fn recv_service_request(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let service_name = payload.get_string()?;
    log::debug!("received SSH_MSG_SERVICE_REQUEST for {:?}", service_name);

    if service_name != "ssh-userauth" || st.auth_server_st.service_accepted {
        return Err(Error::ServiceNotAvailable(service_name))
    }
    st.auth_server_st.service_accepted = true;
    st.auth_server_st.replies.push_back(Reply::ServiceAccept);
    Ok(None)
}

pub(super) fn recv_auth_packet(
    st: &mut ConnState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    match msg_id {
        msg::USERAUTH_REQUEST => recv_auth_request(st, payload),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

/// Outcome of a single authentication request.
enum Verdict {
    Accept,
    Reject { counted: bool },
    PkOk { algo_name: &'static str, pubkey_blob: Bytes },
}

fn recv_auth_request(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    if !st.auth_server_st.service_accepted {
        return Err(Error::Protocol("received SSH_MSG_USERAUTH_REQUEST before service request"))
    }

    // RFC 4252, section 5
    let username = payload.get_string()?;
    let service_name = payload.get_string()?;
    let method_name = payload.get_string()?;
    log::debug!("received SSH_MSG_USERAUTH_REQUEST for {:?} with method {:?}", username, method_name);

    if st.auth_server_st.username.is_some() {
        log::debug!("ignoring SSH_MSG_USERAUTH_REQUEST after successful authentication");
        return Ok(None)
    }
    if service_name != "ssh-connection" {
        return Err(Error::ServiceNotAvailable(service_name))
    }

    let verdict = match method_name.as_str() {
        "none" => {
            let accepted = authenticate(st, &username, AuthRequestMethod::None);
            if accepted { Verdict::Accept } else { Verdict::Reject { counted: false } }
        },
        "password" => recv_password_request(st, &username, payload)?,
        "publickey" => recv_pubkey_request(st, &username, payload)?,
        _ => Verdict::Reject { counted: false },
    };

    if !st.auth_server_st.banner_sent {
        st.auth_server_st.banner_sent = true;
        if let Some(banner) = st.hooks.as_ref().and_then(|hooks| hooks.banner.clone()) {
            st.auth_server_st.replies.push_back(Reply::Banner(banner));
        }
    }

    match verdict {
        Verdict::Accept => {
            log::debug!("user {:?} authenticated with method {:?}", username, method_name);
            st.auth_server_st.replies.push_back(Reply::Success);
            st.auth_server_st.username = Some(username.clone());
            // the client compresses everything it sends after it sees USERAUTH_SUCCESS
            st.codec.recv_pipe.set_authenticated();
            recv::send_event(ConnEvent::Authenticated(username))
        },
        Verdict::PkOk { algo_name, pubkey_blob } => {
            st.auth_server_st.replies.push_back(Reply::PkOk { algo_name, pubkey_blob });
            Ok(None)
        },
        Verdict::Reject { counted } => {
            if counted {
                st.auth_server_st.failed_tries += 1;
                if st.auth_server_st.failed_tries > st.config.max_auth_tries {
                    log::debug!("too many failed authentication attempts for {:?}", username);
                    return Err(Error::AuthTriesExceeded)
                }
            }
            st.auth_server_st.replies.push_back(Reply::Failure);
            Ok(None)
        },
    }
}

fn recv_password_request(
    st: &mut ConnState,
    username: &str,
    payload: &mut PacketDecode,
) -> Result<Verdict> {
    // RFC 4252, section 8
    let change = payload.get_bool()?;
    let password = payload.get_string()?;
    if change {
        log::debug!("password change is not supported");
        return Ok(Verdict::Reject { counted: true })
    }

    let accepted = authenticate(st, username, AuthRequestMethod::Password(&password));
    Ok(if accepted { Verdict::Accept } else { Verdict::Reject { counted: true } })
}

fn recv_pubkey_request(
    st: &mut ConnState,
    username: &str,
    payload: &mut PacketDecode,
) -> Result<Verdict> {
    // RFC 4252, section 7
    let has_signature = payload.get_bool()?;
    let algo_name = payload.get_string()?;
    let pubkey_blob = payload.get_bytes()?;
    let signature = if has_signature { Some(payload.get_bytes()?) } else { None };
    let counted = has_signature;

    let pubkey = match Pubkey::decode(pubkey_blob.clone()) {
        Ok(pubkey) => pubkey,
        Err(err) => {
            log::debug!("could not decode client public key: {}", err);
            return Ok(Verdict::Reject { counted })
        },
    };
    let Some(algo) = pubkey.algos_compatible_less_secure().iter()
        .find(|algo| algo.name == algo_name).copied() else
    {
        log::debug!("public key algorithm {:?} does not match the key", algo_name);
        return Ok(Verdict::Reject { counted })
    };

    let Some(signature) = signature else {
        let method = AuthRequestMethod::Pubkey { pubkey: &pubkey, algo, verified: false };
        if authenticate(st, username, method) {
            return Ok(Verdict::PkOk { algo_name: algo.name, pubkey_blob })
        }
        return Ok(Verdict::Reject { counted })
    };

    let session_id = st.session_id.as_deref().unwrap_or_default();
    let signed = pubkey_signed_data(session_id, username, algo.name, &pubkey_blob);
    if let Err(err) = pubkey.verify(algo, &signed, signature) {
        log::debug!("client signature is invalid: {}", err);
        return Ok(Verdict::Reject { counted })
    }

    let method = AuthRequestMethod::Pubkey { pubkey: &pubkey, algo, verified: true };
    Ok(if authenticate(st, username, method) { Verdict::Accept } else { Verdict::Reject { counted } })
}

fn authenticate(st: &ConnState, username: &str, method: AuthRequestMethod) -> bool {
    match st.hooks.as_ref() {
        Some(hooks) => hooks.authenticator.authenticate(&AuthRequest { username, method }),
        None => false,
    }
}
