use rand::RngCore as _;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use crate::error::{Result, Error};
use super::{auth, channels};
use super::channel_state::LocalIo;
use super::channels::OpenChannel;
use super::config::ConnConfig;
use super::conn_state::ConnState;
use super::kind::ChannelKind;
use super::pump::Pump;
use super::slot_map::{SlotId, SlotMap};

pub(super) type ListenerId = SlotId;

pub(super) struct ListenersState {
    listeners: SlotMap<Listener>,
    max_listeners: usize,
}

/// What we do with connections accepted by a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ListenerKind {
    /// Server side of "tcpip-forward", opens "forwarded-tcpip" channels.
    RemoteForward { bind_host: String, bind_port: u32, bound_port: u32 },
    /// Client side of a local forwarding, opens "direct-tcpip" channels.
    LocalForward { connect_host: String, connect_port: u32 },
    /// Server side of agent forwarding, opens "auth-agent@openssh.com" channels.
    Agent,
    /// Server side of X11 forwarding, opens "x11" channels.
    X11,
}

enum ListenerSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

struct Listener {
    kind: ListenerKind,
    socket: ListenerSocket,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        // runs before the socket is closed
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

enum Accepted {
    Tcp(tokio::net::TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

pub(super) fn init_listeners(config: &ConnConfig) -> ListenersState {
    ListenersState { listeners: SlotMap::new(), max_listeners: config.max_listeners }
}

fn add_listener(
    st: &mut ConnState,
    kind: ListenerKind,
    socket: ListenerSocket,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
) -> Result<ListenerId> {
    let listener = Listener { kind, socket, cleanup };
    if st.listeners_st.listeners.len() >= st.listeners_st.max_listeners {
        return Err(Error::ListenerLimit)
    }
    log::debug!("adding listener {:?}", listener.kind);
    Ok(st.listeners_st.listeners.insert(listener))
}

pub(super) fn remove_listener(st: &mut ConnState, id: ListenerId) {
    if let Some(listener) = st.listeners_st.listeners.remove(id) {
        log::debug!("removing listener {:?}", listener.kind);
    }
}

pub(super) fn remove_all_listeners(st: &mut ConnState) {
    for listener in st.listeners_st.listeners.drain() {
        log::debug!("removing listener {:?}", listener.kind);
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<TcpListener> {
    let host = match host {
        "" | "*" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        host => host,
    };
    let listener = std::net::TcpListener::bind((host, port)).map_err(Error::Bind)?;
    listener.set_nonblocking(true).map_err(Error::Bind)?;
    TcpListener::from_std(listener).map_err(Error::Bind)
}

fn local_port(listener: &TcpListener) -> Result<u16> {
    Ok(listener.local_addr().map_err(Error::Bind)?.port())
}

/// Binds a listener for "tcpip-forward" and returns the bound port.
pub(super) fn add_remote_forward(st: &mut ConnState, bind_host: String, bind_port: u32) -> Result<u32> {
    let port = u16::try_from(bind_port)
        .map_err(|_| Error::Bind(io::Error::new(io::ErrorKind::InvalidInput, "invalid port")))?;
    let listener = bind_tcp(&bind_host, port)?;
    let bound_port = local_port(&listener)? as u32;
    let kind = ListenerKind::RemoteForward { bind_host, bind_port, bound_port };
    add_listener(st, kind, ListenerSocket::Tcp(listener), None)?;
    Ok(bound_port)
}

/// Removes the listener of a "tcpip-forward", returns false if there is no such listener.
pub(super) fn remove_remote_forward(st: &mut ConnState, host: &str, port: u32) -> bool {
    let found = st.listeners_st.listeners.ids().into_iter().find(|id| {
        match st.listeners_st.listeners.get(*id).map(|listener| &listener.kind) {
            Some(ListenerKind::RemoteForward { bind_host, bind_port, bound_port }) =>
                bind_host == host && (*bind_port == port || *bound_port == port),
            _ => false,
        }
    });
    match found {
        Some(id) => {
            remove_listener(st, id);
            true
        },
        None => false,
    }
}

/// Binds a local listener whose connections are forwarded through "direct-tcpip" channels.
pub(super) fn add_local_forward(
    st: &mut ConnState,
    bind_host: &str,
    bind_port: u16,
    connect_host: String,
    connect_port: u32,
) -> Result<u16> {
    let listener = bind_tcp(bind_host, bind_port)?;
    let bound_port = local_port(&listener)?;
    let kind = ListenerKind::LocalForward { connect_host, connect_port };
    add_listener(st, kind, ListenerSocket::Tcp(listener), None)?;
    Ok(bound_port)
}

/// Binds a Unix socket for agent forwarding in a fresh private directory.
#[cfg(unix)]
pub(super) fn add_agent_listener(st: &mut ConnState) -> Result<(ListenerId, PathBuf)> {
    use std::os::unix::fs::DirBuilderExt as _;

    let mut suffix = [0u8; 8];
    st.rng.fill_bytes(&mut suffix);
    let suffix = suffix.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    let dir = std::env::temp_dir().join(format!("tsumugi-{}", suffix));
    std::fs::DirBuilder::new().mode(0o700).create(&dir).map_err(Error::Bind)?;

    let path = dir.join("agent.sock");
    let listener = match tokio::net::UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) => {
            let _ = std::fs::remove_dir(&dir);
            return Err(Error::Bind(err))
        },
    };

    let cleanup_path = path.clone();
    let cleanup = Box::new(move || {
        let _ = std::fs::remove_file(&cleanup_path);
        let _ = std::fs::remove_dir(&dir);
    });
    let id = add_listener(st, ListenerKind::Agent, ListenerSocket::Unix(listener), Some(cleanup))?;
    Ok((id, path))
}

#[cfg(not(unix))]
pub(super) fn add_agent_listener(_st: &mut ConnState) -> Result<(ListenerId, PathBuf)> {
    Err(Error::Bind(io::Error::new(io::ErrorKind::Unsupported, "unix sockets are not supported")))
}

/// Binds the first free X11 display port starting at the configured offset.
pub(super) fn add_x11_listener(st: &mut ConnState) -> Result<(ListenerId, u16)> {
    let first_display = st.config.x11_display_offset;
    let mut last_err = None;
    for display_number in first_display..first_display.saturating_add(1000) {
        let Some(port) = 6000u16.checked_add(display_number) else { break };
        match bind_tcp("127.0.0.1", port) {
            Ok(listener) => {
                let id = add_listener(st, ListenerKind::X11, ListenerSocket::Tcp(listener), None)?;
                return Ok((id, display_number))
            },
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::Bind(io::Error::new(io::ErrorKind::AddrInUse, "no free X11 display"))
    }))
}

pub(super) fn pump_listeners(st: &mut ConnState, cx: &mut Context) -> Result<Pump> {
    if !auth::is_authenticated(st) {
        return Ok(Pump::Pending)
    }

    let mut progress = Pump::Pending;
    for id in st.listeners_st.listeners.ids() {
        let Some(listener) = st.listeners_st.listeners.get(id) else { continue };
        let accepted = match &listener.socket {
            ListenerSocket::Tcp(socket) => socket.poll_accept(cx)
                .map_ok(|(stream, addr)| Accepted::Tcp(stream, addr)),
            #[cfg(unix)]
            ListenerSocket::Unix(socket) => socket.poll_accept(cx)
                .map_ok(|(stream, _)| Accepted::Unix(stream)),
        };

        let accepted = match accepted {
            Poll::Ready(Ok(accepted)) => accepted,
            Poll::Ready(Err(err)) => {
                log::debug!("error when accepting on listener {:?}: {}", listener.kind, err);
                continue
            },
            Poll::Pending => continue,
        };

        let kind = listener.kind.clone();
        progress = Pump::Progress;
        accept_connection(st, kind, accepted);
    }
    Ok(progress)
}

fn accept_connection(st: &mut ConnState, kind: ListenerKind, accepted: Accepted) {
    let (channel_kind, io) = match (kind, accepted) {
        (ListenerKind::RemoteForward { bind_host, bound_port, .. }, Accepted::Tcp(stream, addr)) => {
            let channel_kind = ChannelKind::ForwardedTcpip {
                host: bind_host,
                port: bound_port,
                orig_host: addr.ip().to_string(),
                orig_port: addr.port() as u32,
            };
            (channel_kind, LocalIo::from_stream(stream))
        },
        (ListenerKind::LocalForward { connect_host, connect_port }, Accepted::Tcp(stream, addr)) => {
            let channel_kind = ChannelKind::DirectTcpip {
                host: connect_host,
                port: connect_port,
                orig_host: addr.ip().to_string(),
                orig_port: addr.port() as u32,
            };
            (channel_kind, LocalIo::from_stream(stream))
        },
        (ListenerKind::X11, Accepted::Tcp(stream, addr)) => {
            let channel_kind = ChannelKind::X11 {
                orig_host: addr.ip().to_string(),
                orig_port: addr.port() as u32,
            };
            (channel_kind, LocalIo::from_stream(stream))
        },
        #[cfg(unix)]
        (ListenerKind::Agent, Accepted::Unix(stream)) =>
            (ChannelKind::AuthAgent, LocalIo::from_stream(stream)),
        _ => return,
    };

    log::debug!("accepted connection for {:?} channel", channel_kind.type_name());
    let open = OpenChannel { kind: channel_kind, io, event_tx: None, opened_tx: None };
    if let Err(err) = channels::open_channel(st, open) {
        log::debug!("dropping accepted connection: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use super::*;

    #[tokio::test]
    async fn test_cleanup_runs_on_drop() {
        let socket = bind_tcp("127.0.0.1", 0).unwrap();
        let cleaned = Arc::new(AtomicBool::new(false));
        let cleaned_2 = cleaned.clone();
        let listener = Listener {
            kind: ListenerKind::X11,
            socket: ListenerSocket::Tcp(socket),
            cleanup: Some(Box::new(move || cleaned_2.store(true, Ordering::SeqCst))),
        };
        assert!(!cleaned.load(Ordering::SeqCst));
        drop(listener);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let socket = bind_tcp("localhost", 0).unwrap();
        assert_ne!(local_port(&socket).unwrap(), 0);
    }
}
