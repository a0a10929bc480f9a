use futures_core::ready;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use crate::codec::{PacketDecode, PacketEncode, SendPipe};
use crate::codes::{msg, open};
use crate::error::{ChannelOpenError, DisconnectError, Error, Result};
use super::{Role, auth, global, negotiate, server_session};
use super::channel_state::{self, ChannelInit, ChannelState, LocalIo};
use super::config::ConnConfig;
use super::conn_state::{self, ConnState};
use super::kind::ChannelKind;
use super::pump::Pump;
use super::recv::{RecvState, ResultRecvState};
use super::server_session::ServerSession;
use super::session::{ExitSignal, SessionEvent};
use super::slot_map::{SlotId, SlotMap};

pub(super) type ChannelId = SlotId;
type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<LocalIo>> + Send>>;

pub(super) struct ChannelsState {
    table: SlotMap<ChannelEntry>,
    open_failures: VecDeque<(u32, ChannelOpenError)>,
    /// Channels opened by the peer that we accepted but have not yet confirmed.
    confirms: VecDeque<ChannelId>,
    max_channels: usize,
    recv_window_max: usize,
    recv_len_max: usize,
    ever_opened: bool,
}

enum ChannelEntry {
    /// Opened by us, waiting for the confirmation.
    Opening(Opening),
    /// Opened by the peer, waiting until we connect the local end.
    Accepting(Accepting),
    Ready(Box<ChannelState>),
}

struct Opening {
    kind: ChannelKind,
    io: Option<LocalIo>,
    event_tx: Option<mpsc::Sender<SessionEvent>>,
    opened_tx: Option<oneshot::Sender<Result<()>>>,
    open_sent: bool,
}

struct Accepting {
    kind: ChannelKind,
    their_id: u32,
    send_window: usize,
    send_len_max: usize,
    connect: ConnectFuture,
}

/// Channel that we want to open.
pub(super) struct OpenChannel {
    pub kind: ChannelKind,
    pub io: LocalIo,
    pub event_tx: Option<mpsc::Sender<SessionEvent>>,
    pub opened_tx: Option<oneshot::Sender<Result<()>>>,
}

pub(super) fn init_channels(config: &ConnConfig) -> ChannelsState {
    ChannelsState {
        table: SlotMap::new(),
        open_failures: VecDeque::new(),
        confirms: VecDeque::new(),
        max_channels: config.max_channels,
        recv_window_max: config.channel_window_max(),
        recv_len_max: config.channel_packet_len_max(),
        ever_opened: false,
    }
}

pub(super) fn open_channel(st: &mut ConnState, open: OpenChannel) -> Result<ChannelId> {
    if st.channels_st.table.len() >= st.channels_st.max_channels {
        log::debug!("cannot open channel {:?}, the channel table is full", open.kind.type_name());
        let error = ChannelOpenError::new(open::RESOURCE_SHORTAGE, "too many channels");
        return Err(Error::ChannelOpen(error))
    }

    let id = st.channels_st.table.insert(ChannelEntry::Opening(Opening {
        kind: open.kind,
        io: Some(open.io),
        event_tx: open.event_tx,
        opened_tx: open.opened_tx,
        open_sent: false,
    }));
    st.channels_st.ever_opened = true;
    conn_state::wakeup_conn(st);
    Ok(id)
}

pub(super) fn pump_channels(st: &mut ConnState, cx: &mut Context) -> Result<Pump> {
    // channels wait for the authentication and pause during key exchange
    let ready = negotiate::is_ready(st) && auth::is_authenticated(st);
    let mut progress = Pump::Pending;

    while ready {
        let Some((their_id, error)) = st.channels_st.open_failures.pop_front() else { break };
        send_channel_open_failure(&mut st.codec.send_pipe, their_id, &error)?;
        progress = Pump::Progress;
    }

    while ready {
        let Some(id) = st.channels_st.confirms.pop_front() else { break };
        let (recv_window_max, recv_len_max) = (st.channels_st.recv_window_max, st.channels_st.recv_len_max);
        if let Some(ChannelEntry::Ready(channel_st)) = st.channels_st.table.get(id) {
            send_channel_open_confirmation(&mut st.codec.send_pipe, channel_st, recv_window_max, recv_len_max)?;
            progress = Pump::Progress;
        }
    }

    for id in st.channels_st.table.ids() {
        progress |= pump_entry(st, id, ready, cx)?;
    }
    Ok(progress)
}

fn pump_entry(st: &mut ConnState, id: ChannelId, ready: bool, cx: &mut Context) -> Result<Pump> {
    let recv_window_max = st.channels_st.recv_window_max;
    let recv_len_max = st.channels_st.recv_len_max;
    let Some(entry) = st.channels_st.table.get_mut(id) else { return Ok(Pump::Pending) };

    match entry {
        ChannelEntry::Opening(opening) => {
            if opening.open_sent || !ready {
                return Ok(Pump::Pending)
            }
            send_channel_open(&mut st.codec.send_pipe, id, &opening.kind, recv_window_max, recv_len_max)?;
            opening.open_sent = true;
            Ok(Pump::Progress)
        },
        ChannelEntry::Accepting(accepting) => {
            let io = match accepting.connect.as_mut().poll(cx) {
                Poll::Ready(Ok(io)) => io,
                Poll::Ready(Err(err)) => {
                    log::debug!("could not connect {:?} channel: {}", accepting.kind.type_name(), err);
                    let error = ChannelOpenError::new(open::CONNECT_FAILED, &err.to_string());
                    st.channels_st.open_failures.push_back((accepting.their_id, error));
                    st.channels_st.table.remove(id);
                    return Ok(Pump::Progress)
                },
                Poll::Pending => return Ok(Pump::Pending),
            };

            let channel_st = channel_state::init_channel(ChannelInit {
                our_id: id.index(),
                their_id: accepting.their_id,
                kind: accepting.kind.clone(),
                io: Some(io),
                send_window: accepting.send_window,
                send_len_max: accepting.send_len_max,
                recv_window_max,
                recv_len_max,
                event_tx: None,
            });
            *entry = ChannelEntry::Ready(Box::new(channel_st));
            st.channels_st.confirms.push_back(id);
            Ok(Pump::Progress)
        },
        ChannelEntry::Ready(channel_st) => {
            let mut progress = Pump::Pending;
            if channel_st.session.is_some() {
                progress |= server_session::pump_session(channel_st, cx);
            }
            while channel_state::pump_channel(channel_st, &mut st.codec.send_pipe, ready, cx)?.is_progress() {
                progress = Pump::Progress;
            }

            if channel_state::is_finished(channel_st) {
                if let Some(ChannelEntry::Ready(channel_st)) = st.channels_st.table.remove(id) {
                    finish_channel(st, channel_st);
                }
                return Ok(Pump::Progress)
            }
            Ok(progress)
        },
    }
}

fn finish_channel(st: &mut ConnState, mut channel_st: Box<ChannelState>) {
    log::debug!("channel {} ({:?}) is closed", channel_st.our_id, channel_st.kind.type_name());
    if let Some(session) = channel_st.session.take() {
        server_session::finish_session(st, session);
    }
    drop(channel_st);
    after_remove(st);
}

fn after_remove(st: &mut ConnState) {
    if st.channels_st.table.is_empty() && st.channels_st.ever_opened && st.config.close_on_last_channel {
        log::debug!("last channel was closed, disconnecting");
        let _ = conn_state::disconnect(st, DisconnectError::by_app());
    }
}

/// Tears down all channels when the connection ends.
pub(super) fn drop_all_channels(st: &mut ConnState) {
    for entry in st.channels_st.table.drain() {
        if let ChannelEntry::Opening(opening) = entry {
            if let Some(opened_tx) = opening.opened_tx {
                let _ = opened_tx.send(Err(Error::ChannelClosed));
            }
        }
    }
}

/// Returns the channel if it is open.
pub(super) fn ready_channel(st: &mut ConnState, id: ChannelId) -> Result<&mut ChannelState> {
    match st.channels_st.table.get_mut(id) {
        Some(ChannelEntry::Ready(channel_st)) => Ok(channel_st),
        _ => Err(Error::ChannelClosed),
    }
}

pub(super) fn recv_channel_packet(st: &mut ConnState, msg_id: u8, payload: &mut PacketDecode) -> ResultRecvState {
    if msg_id == msg::CHANNEL_OPEN {
        return recv_channel_open(st, payload)
    }

    // RFC 4254, section 5
    let our_id = payload.get_u32()?;
    let Some(id) = st.channels_st.table.id_by_index(our_id) else {
        log::debug!("received packet {} for unknown channel {}", msg_id, our_id);
        return Err(Error::Protocol("received packet for unknown channel"))
    };

    match msg_id {
        msg::CHANNEL_OPEN_CONFIRMATION => return recv_channel_open_confirmation(st, id, payload),
        msg::CHANNEL_OPEN_FAILURE => return recv_channel_open_failure(st, id, payload),
        msg::CHANNEL_REQUEST => return recv_channel_request(st, id, payload),
        _ => {},
    }

    let Some(ChannelEntry::Ready(channel_st)) = st.channels_st.table.get_mut(id) else {
        return Err(Error::Protocol("received packet for channel that is not open"))
    };
    match msg_id {
        msg::CHANNEL_WINDOW_ADJUST =>
            channel_state::recv_channel_window_adjust(channel_st, payload.get_u32()?),
        msg::CHANNEL_DATA =>
            channel_state::recv_channel_data(channel_st, payload.get_bytes()?)?,
        msg::CHANNEL_EXTENDED_DATA => {
            let code = payload.get_u32()?;
            channel_state::recv_channel_extended_data(channel_st, code, payload.get_bytes()?)?
        },
        msg::CHANNEL_EOF => channel_state::recv_channel_eof(channel_st),
        msg::CHANNEL_CLOSE => channel_state::recv_channel_close(channel_st)?,
        msg::CHANNEL_SUCCESS => channel_state::recv_channel_reply(channel_st, true)?,
        msg::CHANNEL_FAILURE => channel_state::recv_channel_reply(channel_st, false)?,
        _ => return Err(Error::PacketNotImplemented(msg_id)),
    }
    Ok(None)
}

fn send_channel_open(
    out: &mut SendPipe,
    id: ChannelId,
    kind: &ChannelKind,
    recv_window_max: usize,
    recv_len_max: usize,
) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_OPEN);
    payload.put_str(kind.type_name());
    payload.put_u32(id.index());
    payload.put_u32(recv_window_max as u32);
    payload.put_u32(recv_len_max as u32);
    kind.encode_open(&mut payload);
    out.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_OPEN {:?} for our channel {}", kind.type_name(), id.index());
    Ok(())
}

fn recv_channel_open_confirmation(st: &mut ConnState, id: ChannelId, payload: &mut PacketDecode) -> ResultRecvState {
    let their_id = payload.get_u32()?;
    let send_window = payload.get_u32()? as usize;
    let send_len_max = payload.get_u32()? as usize;
    let recv_window_max = st.channels_st.recv_window_max;
    let recv_len_max = st.channels_st.recv_len_max;

    let Some(entry) = st.channels_st.table.get_mut(id) else {
        return Err(Error::Protocol("received packet for unknown channel"))
    };
    let ChannelEntry::Opening(opening) = entry else {
        return Err(Error::Protocol("received SSH_MSG_CHANNEL_OPEN_CONFIRMATION for open channel"))
    };
    if !opening.open_sent {
        return Err(Error::Protocol("received SSH_MSG_CHANNEL_OPEN_CONFIRMATION before we opened"))
    }
    log::debug!("received SSH_MSG_CHANNEL_OPEN_CONFIRMATION for our channel {}, their channel {}",
        id.index(), their_id);

    let channel_st = channel_state::init_channel(ChannelInit {
        our_id: id.index(),
        their_id,
        kind: opening.kind.clone(),
        io: opening.io.take(),
        send_window,
        send_len_max,
        recv_window_max,
        recv_len_max,
        event_tx: opening.event_tx.take(),
    });
    let opened_tx = opening.opened_tx.take();
    *entry = ChannelEntry::Ready(Box::new(channel_st));

    if let Some(opened_tx) = opened_tx {
        let _ = opened_tx.send(Ok(()));
    }
    Ok(None)
}

fn recv_channel_open_failure(st: &mut ConnState, id: ChannelId, payload: &mut PacketDecode) -> ResultRecvState {
    let error = ChannelOpenError {
        reason_code: payload.get_u32()?,
        description: payload.get_string()?,
        description_lang: payload.get_string()?,
    };

    if !matches!(st.channels_st.table.get(id), Some(ChannelEntry::Opening(opening)) if opening.open_sent) {
        return Err(Error::Protocol("received unexpected SSH_MSG_CHANNEL_OPEN_FAILURE"))
    }
    log::debug!("received SSH_MSG_CHANNEL_OPEN_FAILURE for our channel {}: {}", id.index(), error);

    if let Some(ChannelEntry::Opening(opening)) = st.channels_st.table.remove(id) {
        if let Some(opened_tx) = opening.opened_tx {
            let _ = opened_tx.send(Err(Error::ChannelOpen(error)));
        }
    }
    after_remove(st);
    Ok(None)
}

enum OpenDecision {
    Accept { session: Option<Box<ServerSession>> },
    Connect(ConnectFuture),
}

fn recv_channel_open(st: &mut ConnState, payload: &mut PacketDecode) -> ResultRecvState {
    // RFC 4254, section 5.1
    let type_name = payload.get_string()?;
    let their_id = payload.get_u32()?;
    let send_window = payload.get_u32()? as usize;
    let send_len_max = payload.get_u32()? as usize;
    log::debug!("received SSH_MSG_CHANNEL_OPEN {:?} for their channel {}", type_name, their_id);

    let decision = match ChannelKind::decode_open(&type_name, payload)? {
        _ if st.channels_st.table.len() >= st.channels_st.max_channels =>
            Err(ChannelOpenError::new(open::RESOURCE_SHORTAGE, "too many channels")),
        Some(kind) => decide_open(st, &kind).map(|decision| (kind, decision)),
        None => Err(ChannelOpenError::new(open::UNKNOWN_CHANNEL_TYPE, "unknown channel type")),
    };

    let (kind, decision) = match decision {
        Ok(decision) => decision,
        Err(error) => {
            log::debug!("rejecting channel {:?}: {}", type_name, error);
            st.channels_st.open_failures.push_back((their_id, error));
            return Ok(None)
        },
    };

    let entry = match decision {
        OpenDecision::Accept { session } => {
            let mut channel_st = channel_state::init_channel(ChannelInit {
                our_id: 0,
                their_id,
                kind,
                io: None,
                send_window,
                send_len_max,
                recv_window_max: st.channels_st.recv_window_max,
                recv_len_max: st.channels_st.recv_len_max,
                event_tx: None,
            });
            channel_st.session = session;
            ChannelEntry::Ready(Box::new(channel_st))
        },
        OpenDecision::Connect(connect) =>
            ChannelEntry::Accepting(Accepting { kind, their_id, send_window, send_len_max, connect }),
    };

    let confirm_now = matches!(entry, ChannelEntry::Ready(_));
    let id = st.channels_st.table.insert(entry);
    if let Some(ChannelEntry::Ready(channel_st)) = st.channels_st.table.get_mut(id) {
        channel_st.our_id = id.index();
    }
    if confirm_now {
        st.channels_st.confirms.push_back(id);
    }
    st.channels_st.ever_opened = true;
    Ok(None)
}

fn decide_open(st: &ConnState, kind: &ChannelKind) -> Result<OpenDecision, ChannelOpenError> {
    let prohibited = |description| Err(ChannelOpenError::new(open::ADMINISTRATIVELY_PROHIBITED, description));
    let config = &st.config;
    match (st.role, kind) {
        (Role::Server, ChannelKind::Session) =>
            Ok(OpenDecision::Accept { session: Some(Box::new(ServerSession::new())) }),
        (Role::Server, ChannelKind::DirectTcpip { host, port, .. }) => {
            if !config.allow_local_forwarding {
                return prohibited("local port forwarding is disabled")
            }
            connect_tcp(host.clone(), *port).map(OpenDecision::Connect)
        },
        (Role::Client, ChannelKind::ForwardedTcpip { host, port, .. }) => {
            match global::find_remote_forward(st, host, *port) {
                Some((connect_host, connect_port)) =>
                    connect_tcp(connect_host, connect_port).map(OpenDecision::Connect),
                None => prohibited("no such remote forwarding"),
            }
        },
        (Role::Client, ChannelKind::AuthAgent) => {
            match config.agent_forward_path.clone() {
                Some(path) if config.allow_agent_forwarding => connect_unix(path).map(OpenDecision::Connect),
                _ => prohibited("agent forwarding is disabled"),
            }
        },
        (Role::Client, ChannelKind::X11 { .. }) => {
            match config.x11_forward_addr.clone() {
                Some(addr) if config.allow_x11_forwarding => {
                    let connect = async move {
                        let stream = tokio::net::TcpStream::connect(addr).await?;
                        Ok(LocalIo::from_stream(stream))
                    };
                    Ok(OpenDecision::Connect(Box::pin(connect)))
                },
                _ => prohibited("X11 forwarding is disabled"),
            }
        },
        _ => prohibited("channel type is not accepted"),
    }
}

fn connect_tcp(host: String, port: u32) -> Result<ConnectFuture, ChannelOpenError> {
    let port = u16::try_from(port)
        .map_err(|_| ChannelOpenError::new(open::CONNECT_FAILED, "invalid port"))?;
    Ok(Box::pin(async move {
        let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
        Ok(LocalIo::from_stream(stream))
    }))
}

#[cfg(unix)]
fn connect_unix(path: std::path::PathBuf) -> Result<ConnectFuture, ChannelOpenError> {
    Ok(Box::pin(async move {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(LocalIo::from_stream(stream))
    }))
}

#[cfg(not(unix))]
fn connect_unix(_path: std::path::PathBuf) -> Result<ConnectFuture, ChannelOpenError> {
    Err(ChannelOpenError::new(open::ADMINISTRATIVELY_PROHIBITED, "unix sockets are not supported"))
}

fn send_channel_open_confirmation(
    out: &mut SendPipe,
    channel_st: &ChannelState,
    recv_window_max: usize,
    recv_len_max: usize,
) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_OPEN_CONFIRMATION);
    payload.put_u32(channel_st.their_id);
    payload.put_u32(channel_st.our_id);
    payload.put_u32(recv_window_max as u32);
    payload.put_u32(recv_len_max as u32);
    out.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_OPEN_CONFIRMATION for our channel {}", channel_st.our_id);
    Ok(())
}

fn send_channel_open_failure(out: &mut SendPipe, their_id: u32, error: &ChannelOpenError) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_OPEN_FAILURE);
    payload.put_u32(their_id);
    payload.put_u32(error.reason_code);
    payload.put_str(&error.description);
    payload.put_str(&error.description_lang);
    out.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_OPEN_FAILURE for their channel {}: {}", their_id, error);
    Ok(())
}

fn recv_channel_request(st: &mut ConnState, id: ChannelId, payload: &mut PacketDecode) -> ResultRecvState {
    // RFC 4254, section 5.4
    let request_type = payload.get_string()?;
    let want_reply = payload.get_bool()?;
    log::debug!("received SSH_MSG_CHANNEL_REQUEST {:?} for our channel {}", request_type, id.index());

    let is_session = match st.channels_st.table.get(id) {
        Some(ChannelEntry::Ready(channel_st)) => channel_st.kind == ChannelKind::Session,
        _ => return Err(Error::Protocol("received SSH_MSG_CHANNEL_REQUEST for channel that is not open")),
    };

    let (success, recv_state) = match (st.role, is_session) {
        (Role::Server, true) =>
            (server_session::recv_session_request(st, id, &request_type, payload)?, None),
        (Role::Client, true) => recv_client_session_request(id, &request_type, payload)?,
        _ => (false, None),
    };

    if want_reply {
        if let Some(ChannelEntry::Ready(channel_st)) = st.channels_st.table.get_mut(id) {
            channel_state::queue_reply(channel_st, success);
        }
    }
    Ok(recv_state)
}

fn recv_client_session_request(
    id: ChannelId,
    request_type: &str,
    payload: &mut PacketDecode,
) -> Result<(bool, Option<Box<dyn RecvState + Send>>)> {
    // RFC 4254, section 6.10
    let event = match request_type {
        "exit-status" => SessionEvent::ExitStatus(payload.get_u32()?),
        "exit-signal" => SessionEvent::ExitSignal(ExitSignal::decode(payload)?),
        _ => return Ok((false, None)),
    };
    Ok((true, send_channel_event(id, event)?))
}

fn send_channel_event(id: ChannelId, event: SessionEvent) -> ResultRecvState {
    struct SendEventState {
        id: ChannelId,
        event: Option<SessionEvent>,
    }

    impl RecvState for SendEventState {
        fn poll(&mut self, st: &mut ConnState, cx: &mut Context) -> Poll<Result<()>> {
            let event_tx = match st.channels_st.table.get_mut(self.id) {
                Some(ChannelEntry::Ready(channel_st)) => channel_st.event_tx.as_mut(),
                _ => None,
            };
            let Some(event_tx) = event_tx else {
                return Poll::Ready(Ok(()))
            };

            let reserve_res = ready!(event_tx.poll_reserve(cx));
            if let Some(event) = self.event.take() {
                if reserve_res.is_ok() {
                    let _ = event_tx.send_item(event);
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    Ok(Some(Box::new(SendEventState { id, event: Some(event) })))
}
