use bytes::Bytes;
use std::collections::VecDeque;
use std::task::Context;
use tokio::sync::oneshot;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Result, Error};
use super::{Role, auth, listener, negotiate};
use super::conn_state::{self, ConnState};
use super::pump::Pump;
use super::recv::ResultRecvState;

pub(super) struct GlobalState {
    /// Replies to the requests of the peer, in the order of the requests.
    replies: VecDeque<GlobalReply>,
    /// Our requests that have not been sent yet.
    requests: VecDeque<GlobalReq>,
    /// Our requests that wait for a reply.
    pending: VecDeque<PendingReply>,
    /// Remote forwardings that the peer accepted (client only).
    remote_forwards: Vec<RemoteForward>,
}

#[derive(Debug)]
enum GlobalReply {
    Success(Option<u32>),
    Failure,
}

struct GlobalReq {
    request_type: &'static str,
    payload: Bytes,
    pending: PendingReply,
}

enum PendingReply {
    Forward {
        forward: RemoteForward,
        result_tx: oneshot::Sender<Result<u32>>,
    },
    Cancel {
        bind_host: String,
        bind_port: u32,
        result_tx: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug, Clone)]
struct RemoteForward {
    bind_host: String,
    bind_port: u32,
    bound_port: u32,
    connect_host: String,
    connect_port: u32,
}

impl RemoteForward {
    fn matches(&self, host: &str, port: u32) -> bool {
        self.bind_host == host && (self.bind_port == port || self.bound_port == port)
    }
}

pub(super) fn init_global() -> GlobalState {
    GlobalState {
        replies: VecDeque::new(),
        requests: VecDeque::new(),
        pending: VecDeque::new(),
        remote_forwards: Vec::new(),
    }
}

pub(super) fn pump_global(st: &mut ConnState, _cx: &mut Context) -> Result<Pump> {
    if !negotiate::is_ready(st) {
        return Ok(Pump::Pending)
    }

    let mut progress = Pump::Pending;
    while let Some(reply) = st.global_st.replies.pop_front() {
        send_global_reply(st, &reply)?;
        progress = Pump::Progress;
    }

    if auth::is_authenticated(st) {
        while let Some(req) = st.global_st.requests.pop_front() {
            send_global_request(st, &req)?;
            st.global_st.pending.push_back(req.pending);
            progress = Pump::Progress;
        }
    }
    Ok(progress)
}

/// Asks the server to listen on `bind_host:bind_port` and forward the connections to
/// `connect_host:connect_port`.
pub(super) fn forward_remote(
    st: &mut ConnState,
    bind_host: String,
    bind_port: u32,
    connect_host: String,
    connect_port: u32,
    result_tx: oneshot::Sender<Result<u32>>,
) {
    // RFC 4254, section 7.1
    let mut payload = PacketEncode::new();
    payload.put_str(&bind_host);
    payload.put_u32(bind_port);
    let forward = RemoteForward { bind_host, bind_port, bound_port: bind_port, connect_host, connect_port };
    st.global_st.requests.push_back(GlobalReq {
        request_type: "tcpip-forward",
        payload: payload.finish(),
        pending: PendingReply::Forward { forward, result_tx },
    });
    conn_state::wakeup_conn(st);
}

pub(super) fn cancel_forward_remote(
    st: &mut ConnState,
    bind_host: String,
    bind_port: u32,
    result_tx: oneshot::Sender<Result<()>>,
) {
    let mut payload = PacketEncode::new();
    payload.put_str(&bind_host);
    payload.put_u32(bind_port);
    st.global_st.requests.push_back(GlobalReq {
        request_type: "cancel-tcpip-forward",
        payload: payload.finish(),
        pending: PendingReply::Cancel { bind_host, bind_port, result_tx },
    });
    conn_state::wakeup_conn(st);
}

/// Finds the local target of a "forwarded-tcpip" channel opened by the server.
pub(super) fn find_remote_forward(st: &ConnState, host: &str, port: u32) -> Option<(String, u32)> {
    st.global_st.remote_forwards.iter()
        .find(|forward| forward.matches(host, port))
        .map(|forward| (forward.connect_host.clone(), forward.connect_port))
}

pub(super) fn recv_global_packet(st: &mut ConnState, msg_id: u8, payload: &mut PacketDecode) -> ResultRecvState {
    match msg_id {
        msg::GLOBAL_REQUEST => recv_global_request(st, payload),
        msg::REQUEST_SUCCESS => recv_request_success(st, payload),
        msg::REQUEST_FAILURE => recv_request_failure(st),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

fn recv_global_request(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    // RFC 4254, section 4
    let request_type = payload.get_string()?;
    let want_reply = payload.get_bool()?;
    log::debug!("received SSH_MSG_GLOBAL_REQUEST {:?}", request_type);

    let reply = match (st.role, request_type.as_str()) {
        (Role::Server, "tcpip-forward") => recv_tcpip_forward(st, payload)?,
        (Role::Server, "cancel-tcpip-forward") => recv_cancel_tcpip_forward(st, payload)?,
        _ => GlobalReply::Failure,
    };

    if want_reply {
        st.global_st.replies.push_back(reply);
    }
    Ok(None)
}

fn recv_tcpip_forward(st: &mut ConnState, payload: &mut PacketDecode) -> Result<GlobalReply> {
    let bind_host = payload.get_string()?;
    let bind_port = payload.get_u32()?;

    if !st.config.allow_remote_forwarding {
        log::debug!("rejecting tcpip-forward, remote forwarding is disabled");
        return Ok(GlobalReply::Failure)
    }
    if bind_port > u16::MAX as u32 {
        log::debug!("rejecting tcpip-forward of invalid port {}", bind_port);
        return Ok(GlobalReply::Failure)
    }
    if bind_port != 0 && bind_port < 1024 && !st.config.allow_privileged_ports {
        log::debug!("rejecting tcpip-forward of privileged port {}", bind_port);
        return Ok(GlobalReply::Failure)
    }

    match listener::add_remote_forward(st, bind_host, bind_port) {
        Ok(bound_port) => {
            log::debug!("forwarding remote port {}", bound_port);
            Ok(GlobalReply::Success((bind_port == 0).then_some(bound_port)))
        },
        Err(err) => {
            log::debug!("could not forward remote port {}: {}", bind_port, err);
            Ok(GlobalReply::Failure)
        },
    }
}

fn recv_cancel_tcpip_forward(st: &mut ConnState, payload: &mut PacketDecode) -> Result<GlobalReply> {
    let bind_host = payload.get_string()?;
    let bind_port = payload.get_u32()?;
    if listener::remove_remote_forward(st, &bind_host, bind_port) {
        Ok(GlobalReply::Success(None))
    } else {
        log::debug!("no remote forwarding for {:?} port {} to cancel", bind_host, bind_port);
        Ok(GlobalReply::Failure)
    }
}

fn recv_request_success(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let Some(pending) = st.global_st.pending.pop_front() else {
        return Err(Error::Protocol("received SSH_MSG_REQUEST_SUCCESS, but no reply was expected"))
    };
    log::debug!("received SSH_MSG_REQUEST_SUCCESS");

    match pending {
        PendingReply::Forward { mut forward, result_tx } => {
            // RFC 4254, section 7.1: the bound port is returned only if we asked for port 0
            if forward.bind_port == 0 {
                forward.bound_port = payload.get_u32()?;
            }
            let bound_port = forward.bound_port;
            st.global_st.remote_forwards.push(forward);
            let _ = result_tx.send(Ok(bound_port));
        },
        PendingReply::Cancel { bind_host, bind_port, result_tx } => {
            st.global_st.remote_forwards.retain(|forward| !forward.matches(&bind_host, bind_port));
            let _ = result_tx.send(Ok(()));
        },
    }
    Ok(None)
}

fn recv_request_failure(st: &mut ConnState) -> ResultRecvState {
    let Some(pending) = st.global_st.pending.pop_front() else {
        return Err(Error::Protocol("received SSH_MSG_REQUEST_FAILURE, but no reply was expected"))
    };
    log::debug!("received SSH_MSG_REQUEST_FAILURE");

    match pending {
        PendingReply::Forward { result_tx, .. } => { let _ = result_tx.send(Err(Error::GlobalReq)); },
        PendingReply::Cancel { result_tx, .. } => { let _ = result_tx.send(Err(Error::GlobalReq)); },
    }
    Ok(None)
}

fn send_global_request(st: &mut ConnState, req: &GlobalReq) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::GLOBAL_REQUEST);
    payload.put_str(req.request_type);
    payload.put_bool(true);
    payload.put_raw(&req.payload);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_GLOBAL_REQUEST {:?}", req.request_type);
    Ok(())
}

fn send_global_reply(st: &mut ConnState, reply: &GlobalReply) -> Result<()> {
    let mut payload = PacketEncode::new();
    match reply {
        GlobalReply::Success(bound_port) => {
            payload.put_u8(msg::REQUEST_SUCCESS);
            if let Some(bound_port) = bound_port {
                payload.put_u32(*bound_port);
            }
        },
        GlobalReply::Failure => payload.put_u8(msg::REQUEST_FAILURE),
    }
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending {:?} for SSH_MSG_GLOBAL_REQUEST", reply);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_forward_matches_requested_or_bound_port() {
        let forward = RemoteForward {
            bind_host: "localhost".into(),
            bind_port: 0,
            bound_port: 40123,
            connect_host: "127.0.0.1".into(),
            connect_port: 8080,
        };
        assert!(forward.matches("localhost", 40123));
        assert!(forward.matches("localhost", 0));
        assert!(!forward.matches("localhost", 8080));
        assert!(!forward.matches("0.0.0.0", 40123));
    }
}
