use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use crate::codec::{PacketDecode, PacketEncode};
use crate::error::{Result, Error};
use super::channel_state::{self, ChannelReq, ChannelState, LocalIo};
use super::channels::{self, ChannelId};
use super::conn_state::ConnState;
use super::listener::{self, ListenerId};
use super::pump::Pump;
use super::session::{ExitStatus, PtyRequest, WindowChange};
use super::spawner::{SessionCommand, SessionControl, SpawnRequest};

/// Server side of a "session" channel.
#[derive(Default)]
pub(super) struct ServerSession {
    pty: Option<PtyRequest>,
    env: Vec<(String, String)>,
    started: bool,
    exit: Option<Pin<Box<dyn Future<Output = ExitStatus> + Send>>>,
    control: Option<Box<dyn SessionControl>>,
    listeners: Vec<ListenerId>,
    agent_sock: Option<PathBuf>,
    display: Option<String>,
}

impl ServerSession {
    pub fn new() -> ServerSession {
        ServerSession::default()
    }
}

fn session_mut(st: &mut ConnState, id: ChannelId) -> Result<&mut ServerSession> {
    channels::ready_channel(st, id)?.session.as_deref_mut().ok_or(Error::ChannelClosed)
}

/// Handles a request of the client, returns true on success.
pub(super) fn recv_session_request(
    st: &mut ConnState,
    id: ChannelId,
    request_type: &str,
    payload: &mut PacketDecode,
) -> Result<bool> {
    // RFC 4254, section 6
    match request_type {
        "pty-req" => {
            let pty = PtyRequest::decode(payload)?;
            session_mut(st, id)?.pty = Some(pty);
            Ok(true)
        },
        "env" => {
            let name = payload.get_string()?;
            let value = payload.get_string()?;
            session_mut(st, id)?.env.push((name, value));
            Ok(true)
        },
        "shell" => start_process(st, id, SessionCommand::Shell),
        "exec" => start_process(st, id, SessionCommand::Exec(payload.get_bytes()?)),
        "subsystem" => start_process(st, id, SessionCommand::Subsystem(payload.get_string()?)),
        "window-change" => {
            let change = WindowChange::decode(payload)?;
            let Some(control) = session_mut(st, id)?.control.as_mut() else { return Ok(false) };
            control.window_change(&change);
            Ok(true)
        },
        "signal" => {
            let signal_name = payload.get_string()?;
            let Some(control) = session_mut(st, id)?.control.as_mut() else { return Ok(false) };
            control.signal(&signal_name);
            Ok(true)
        },
        "auth-agent-req@openssh.com" => start_agent_forwarding(st, id),
        "x11-req" => start_x11_forwarding(st, id, payload),
        _ => Ok(false),
    }
}

fn start_process(st: &mut ConnState, id: ChannelId, command: SessionCommand) -> Result<bool> {
    let Some(spawner) = st.hooks.as_ref().and_then(|hooks| hooks.spawner.clone()) else {
        log::debug!("cannot start {:?}, no spawner is configured", command);
        return Ok(false)
    };
    let username = st.auth_server_st.username().unwrap_or_default().to_owned();

    let channel_st = channels::ready_channel(st, id)?;
    let our_id = channel_st.our_id;
    let Some(session) = channel_st.session.as_deref_mut() else { return Ok(false) };
    if session.started {
        log::debug!("process of channel {} was already started", our_id);
        return Ok(false)
    }

    let mut env = session.env.clone();
    if let Some(agent_sock) = session.agent_sock.as_ref() {
        env.push(("SSH_AUTH_SOCK".into(), agent_sock.display().to_string()));
    }
    if let Some(display) = session.display.as_ref() {
        env.push(("DISPLAY".into(), display.clone()));
    }

    let request = SpawnRequest { username, command, pty: session.pty.clone(), env };
    log::debug!("spawning {:?} for channel {}", request.command, our_id);
    let process = match spawner.spawn(request) {
        Ok(process) => process,
        Err(err) => {
            log::debug!("could not spawn process for channel {}: {}", our_id, err);
            return Ok(false)
        },
    };

    session.started = true;
    session.exit = Some(process.exit);
    session.control = process.control;

    channel_state::set_io(channel_st, LocalIo {
        reader: Some(process.stdout),
        writer: Some(process.stdin),
        ext_reader: process.stderr,
        ext_writer: None,
    });
    channel_st.close_blocked = true;
    Ok(true)
}

fn start_agent_forwarding(st: &mut ConnState, id: ChannelId) -> Result<bool> {
    if !st.config.allow_agent_forwarding || session_mut(st, id)?.agent_sock.is_some() {
        return Ok(false)
    }

    match listener::add_agent_listener(st) {
        Ok((listener_id, path)) => {
            let session = session_mut(st, id)?;
            session.listeners.push(listener_id);
            session.agent_sock = Some(path);
            Ok(true)
        },
        Err(err) => {
            log::debug!("could not start agent forwarding: {}", err);
            Ok(false)
        },
    }
}

fn start_x11_forwarding(st: &mut ConnState, id: ChannelId, payload: &mut PacketDecode) -> Result<bool> {
    // RFC 4254, section 6.3.1
    let _single_connection = payload.get_bool()?;
    let _auth_protocol = payload.get_string()?;
    let _auth_cookie = payload.get_string()?;
    let screen = payload.get_u32()?;

    if !st.config.allow_x11_forwarding || session_mut(st, id)?.display.is_some() {
        return Ok(false)
    }

    match listener::add_x11_listener(st) {
        Ok((listener_id, display_number)) => {
            let session = session_mut(st, id)?;
            session.listeners.push(listener_id);
            session.display = Some(format!("localhost:{}.{}", display_number, screen));
            Ok(true)
        },
        Err(err) => {
            log::debug!("could not start X11 forwarding: {}", err);
            Ok(false)
        },
    }
}

/// Watches for the exit of the process.
pub(super) fn pump_session(channel_st: &mut ChannelState, cx: &mut Context) -> Pump {
    let Some(session) = channel_st.session.as_deref_mut() else { return Pump::Pending };
    let Some(exit) = session.exit.as_mut() else { return Pump::Pending };
    let Poll::Ready(status) = exit.as_mut().poll(cx) else { return Pump::Pending };
    session.exit = None;
    session.control = None;
    log::debug!("process of channel {} exited with {:?}", channel_st.our_id, status);

    // RFC 4254, section 6.10
    let mut payload = PacketEncode::new();
    let request_type = match status {
        ExitStatus::Code(code) => {
            payload.put_u32(code);
            "exit-status"
        },
        ExitStatus::Signal(signal) => {
            signal.encode(&mut payload);
            "exit-signal"
        },
    };
    let req = ChannelReq { request_type, payload: payload.finish(), reply_tx: None };
    if channel_state::send_request(channel_st, req).is_err() {
        log::debug!("channel {} is closing, dropping exit status", channel_st.our_id);
    }

    // the process has exited, close its stdin
    channel_st.io.writer = None;
    channel_st.close_blocked = false;
    Pump::Progress
}

pub(super) fn finish_session(st: &mut ConnState, session: Box<ServerSession>) {
    for listener_id in session.listeners.iter() {
        listener::remove_listener(st, *listener_id);
    }
}

