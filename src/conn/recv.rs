use futures_core::ready;
use std::task::{Context, Poll};
use crate::codec::{PacketDecode, PacketEncode, RecvPacket};
use crate::codes::msg;
use crate::error::{Error, Result, DisconnectError};
use super::{Role, auth, auth_server, channels, global, negotiate};
use super::conn_state::ConnState;
use super::event::{ConnEvent, DebugMsg};
use super::pump::Pump;

/// Continuation of a received packet that could not be handled at once.
pub(super) trait RecvState {
    fn poll(&mut self, st: &mut ConnState, cx: &mut Context) -> Poll<Result<()>>;
}

pub(super) type ResultRecvState = Result<Option<Box<dyn RecvState + Send>>>;

pub(super) fn pump_recv(st: &mut ConnState, cx: &mut Context) -> Result<Pump> {
    match st.recv_st.take() {
        Some(mut recv_st) => match recv_st.poll(st, cx) {
            Poll::Ready(Ok(())) => Ok(Pump::Progress),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => {
                st.recv_st = Some(recv_st);
                Ok(Pump::Pending)
            },
        },
        None => Ok(Pump::Pending),
    }
}

pub(super) fn recv_packet(st: &mut ConnState, packet: RecvPacket) -> ResultRecvState {
    let mut payload = PacketDecode::new(packet.payload.clone());
    match recv_packet_dispatch(st, &mut payload) {
        Ok(recv_state) => Ok(recv_state),
        Err(Error::PacketNotImplemented(msg_id)) => not_implemented(st, msg_id, &packet),
        Err(err) => Err(err),
    }
}

fn recv_packet_dispatch(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let msg_id = payload.get_u8()?;
    log::trace!("received packet {}", msg_id);

    if negotiate::ignore_next_packet(st, msg_id) {
        log::debug!("ignoring packet {} after wrong kex guess", msg_id);
        return Ok(None)
    }

    // RFC 4253, section 7.1: only transport messages may follow the peer's SSH_MSG_KEXINIT
    let is_transport = matches!(msg_id, 1..=4 | 20..=49);
    if !is_transport && negotiate::their_kex_in_progress(st) {
        log::debug!("received packet {} during key exchange", msg_id);
        return Err(Error::Protocol("received non-transport message during key exchange"))
    }

    match (msg_id, st.role) {
        (msg::DISCONNECT, _) => recv_disconnect(st, payload),
        (msg::DEBUG, _) => recv_debug(st, payload),
        (msg::UNIMPLEMENTED, _) => recv_unimplemented(st, payload),
        (msg::IGNORE, _) => Ok(None),
        (msg::SERVICE_REQUEST, Role::Server) => auth_server::recv_service_request(st, payload),
        (msg::SERVICE_ACCEPT, Role::Client) => recv_service_accept(st, payload),
        (20..=29, _) => negotiate::recv_negotiate_packet(st, msg_id, payload),
        (30..=49, _) => negotiate::recv_kex_packet(st, msg_id, payload),
        (50..=79, Role::Server) => auth_server::recv_auth_packet(st, msg_id, payload),
        (50..=59, Role::Client) => auth::recv_auth_packet(st, msg_id, payload),
        (60..=79, Role::Client) => auth::recv_auth_method_packet(st, msg_id, payload),
        (80..=127, _) => {
            if !auth::is_authenticated(st) {
                return Err(Error::Protocol("received connection message before authentication"))
            }
            match msg_id {
                80..=89 => global::recv_global_packet(st, msg_id, payload),
                _ => channels::recv_channel_packet(st, msg_id, payload),
            }
        },
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

fn recv_disconnect(_: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let disconnect = DisconnectError {
        reason_code: payload.get_u32()?,
        description: payload.get_string()?,
        description_lang: payload.get_string()?,
    };
    log::debug!("received SSH_MSG_DISCONNECT: {:?}", disconnect);
    Err(Error::PeerDisconnected(disconnect))
}

fn recv_debug(_st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let debug_msg = DebugMsg {
        always_display: payload.get_bool()?,
        message: payload.get_string()?,
        message_lang: payload.get_string()?,
    };
    log::debug!("received SSH_MSG_DEBUG: {:?}", debug_msg.message);
    send_event(ConnEvent::DebugMsg(debug_msg))
}

fn recv_unimplemented(_st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let packet_seq = payload.get_u32()?;
    log::debug!("received SSH_MSG_UNIMPLEMENTED for packet seq {}", packet_seq);
    Ok(None)
}

fn recv_service_accept(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    let service_name = payload.get_string()?;

    if service_name.as_str() == "ssh-userauth" {
        auth::recv_service_accept(st)
    } else {
        log::debug!("received SSH_MSG_SERVICE_ACCEPT for unknown service {:?}", service_name);
        Ok(None)
    }
}

/// Delivers a [`ConnEvent`] to the application, suspending the receipt of further packets until
/// the event is accepted.
pub(super) fn send_event(event: ConnEvent) -> ResultRecvState {
    struct SendEventState {
        event: Option<ConnEvent>,
    }

    impl RecvState for SendEventState {
        fn poll(&mut self, st: &mut ConnState, cx: &mut Context) -> Poll<Result<()>> {
            let reserve_res = ready!(st.event_tx.poll_reserve(cx));
            if let Some(event) = self.event.take() {
                if reserve_res.is_ok() {
                    let _ = st.event_tx.send_item(event);
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    Ok(Some(Box::new(SendEventState { event: Some(event) })))
}

fn not_implemented(st: &mut ConnState, msg_id: u8, packet: &RecvPacket) -> ResultRecvState {
    log::debug!("received unimplemented packet {}, seq {}", msg_id, packet.packet_seq);
    let mut reply = PacketEncode::new();
    reply.put_u8(msg::UNIMPLEMENTED);
    reply.put_u32(packet.packet_seq);
    st.codec.send_pipe.feed_packet(&reply.finish())?;
    Ok(None)
}
