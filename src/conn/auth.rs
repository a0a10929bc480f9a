use std::task::Context;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Result, Error};
use super::{Role, negotiate};
use super::auth_method::AuthMethod;
use super::conn_state::{self, ConnState};
use super::event::{ConnEvent, AuthBanner};
use super::pump::Pump;
use super::recv::{self, ResultRecvState};

/// Result of an authentication attempt of the client.
#[derive(Debug, Clone)]
#[must_use]
pub enum AuthResult {
    /// The authentication was successful.
    Success,

    /// The server asks the user to change the expired password ("password" method only).
    PasswordExpired {
        /// Prompt that should be displayed to the user.
        prompt: String,
    },

    /// The authentication was rejected.
    Failure(AuthFailure),
}

impl AuthResult {
    /// Returns `Ok` if this is a success, `Err` otherwise.
    pub fn success_or_error(&self) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            _ => Err(Error::AuthFailed),
        }
    }
}

/// Message sent by the server when authentication attempt fails.
///
/// This corresponds to `SSH_MSG_USERAUTH_FAILURE` (RFC 4252, section 5.1). Note that this may
/// actually represent a [partial success][Self::partial_success].
#[derive(Debug, Clone)]
pub struct AuthFailure {
    /// Authentication methods that may productively continue the authentication.
    ///
    /// Note that the server must not list the `"none"` method here, even if it is supported.
    pub methods_can_continue: Vec<String>,

    /// True if the authentication request was successful, but the authentication should continue.
    pub partial_success: bool,
}

#[derive(Default)]
pub(super) struct AuthState {
    service_requested: bool,
    service_accepted: bool,
    method: Option<Box<dyn AuthMethod + Send>>,
    success: bool,
}

pub(super) fn init_auth() -> AuthState {
    AuthState::default()
}

pub(super) fn start_method(st: &mut ConnState, method: Box<dyn AuthMethod + Send>) -> Result<()> {
    if st.role != Role::Client {
        return Err(Error::Protocol("only clients can authenticate"))
    }
    if st.auth_st.method.is_none() {
        st.auth_st.method = Some(method);
        conn_state::wakeup_conn(st);
        Ok(())
    } else {
        Err(Error::AuthPending)
    }
}

pub(super) fn pump_auth(st: &mut ConnState, _cx: &mut Context) -> Result<Pump> {
    if !st.auth_st.service_requested && st.session_id.is_some() && negotiate::is_ready(st) {
        send_service_request(st)?;
        st.auth_st.service_requested = true;
        return Ok(Pump::Progress)
    }

    if !st.auth_st.service_accepted {
        return Ok(Pump::Pending)
    }
    let ready = negotiate::is_ready(st);
    let Some(method) = st.auth_st.method.as_mut() else { return Ok(Pump::Pending) };

    if st.auth_st.success {
        method.recv_success()?;
    }

    if ready {
        let session_id = st.session_id.as_deref().unwrap_or_default();
        if let Some(payload) = method.send_packet(session_id)? {
            st.codec.send_pipe.feed_packet(&payload)?;
            return Ok(Pump::Progress)
        }
    }

    pump_ready!(method.poll())?;
    st.auth_st.method = None;
    Ok(Pump::Progress)
}

fn send_service_request(st: &mut ConnState) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::SERVICE_REQUEST);
    payload.put_str("ssh-userauth");
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_SERVICE_REQUEST for 'ssh-userauth'");
    Ok(())
}

pub(super) fn recv_service_accept(st: &mut ConnState) -> ResultRecvState {
    if !st.auth_st.service_requested {
        return Err(Error::Protocol("received unexpected SSH_MSG_SERVICE_ACCEPT"))
    }
    log::debug!("received SSH_MSG_SERVICE_ACCEPT for 'ssh-userauth'");
    st.auth_st.service_accepted = true;
    Ok(None)
}

pub(super) fn recv_auth_packet(
    st: &mut ConnState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    match msg_id {
        msg::USERAUTH_FAILURE => recv_auth_failure(st, payload),
        msg::USERAUTH_SUCCESS => recv_auth_success(st, payload),
        msg::USERAUTH_BANNER => recv_auth_banner(st, payload),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

pub(super) fn recv_auth_method_packet(
    st: &mut ConnState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    if let Some(method) = st.auth_st.method.as_mut() {
        method.recv_packet(msg_id, payload)?;
        Ok(None)
    } else {
        Err(Error::PacketNotImplemented(msg_id))
    }
}

fn recv_auth_failure(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let failure = AuthFailure {
        methods_can_continue: payload.get_name_list()?,
        partial_success: payload.get_bool()?,
    };
    log::debug!("received SSH_MSG_USERAUTH_FAILURE: {:?}", failure);

    if let Some(method) = st.auth_st.method.as_mut() {
        method.recv_failure(failure)?;
        Ok(None)
    } else {
        Err(Error::Protocol("received unexpected SSH_MSG_USERAUTH_FAILURE"))
    }
}

fn recv_auth_success(st: &mut ConnState, _payload: &mut PacketDecode) -> ResultRecvState {
    if st.auth_st.success || st.auth_st.method.is_none() {
        return Err(Error::Protocol("received unexpected SSH_MSG_USERAUTH_SUCCESS"))
    }
    st.auth_st.success = true;
    st.codec.set_authenticated();
    log::debug!("received SSH_MSG_USERAUTH_SUCCESS");
    Ok(None)
}

fn recv_auth_banner(_st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let banner = AuthBanner {
        message: payload.get_string()?,
        message_lang: payload.get_string()?,
    };
    log::debug!("received SSH_MSG_USERAUTH_BANNER");
    recv::send_event(ConnEvent::AuthBanner(banner))
}

pub(super) fn is_authenticated(st: &ConnState) -> bool {
    match st.role {
        Role::Client => st.auth_st.success,
        Role::Server => st.auth_server_st.username().is_some(),
    }
}
