use parking_lot::Mutex;
use pin_project::pin_project;
use rand::rngs::OsRng;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use crate::error::{Error, Result, DisconnectError};
use crate::pubkey::{PubkeyAlgo, Privkey};
use super::{Role, auth, channels, global, listener, negotiate};
use super::auth::AuthResult;
use super::auth_method::{Credentials, SingleRequest};
use super::channel_state::{self, ChannelReq, LocalIo};
use super::channels::{ChannelId, OpenChannel};
use super::config::{ConnConfig, ServerHooks};
use super::conn_state::{self, ConnState};
use super::event::ConnEvent;
use super::kind::ChannelKind;
use super::session::{Session, SessionEvent, SessionIo, SessionReceiver};

/// Capacity of the in-memory pipes that connect user-opened channels with the application.
const DUPLEX_LEN: usize = 64 * 1024;

/// Handle to an SSH connection.
///
/// The same handle is used by clients and servers. To open a connection, pass your I/O stream
/// (such as `tokio::net::TcpStream`) to [`Connection::connect()`] (client) or
/// [`Connection::accept()`] (server). Both give you three objects:
///
/// - [`Connection`] allows you to interact with the connection: authenticate, open sessions and
/// channels, set up port forwarding or disconnect.
/// - [`ConnReceiver`] produces the [`ConnEvent`]s. A client **must** handle
/// [`ConnEvent::ServerPubkey`]; other events can be ignored, but you must receive them in a
/// timely manner, otherwise the connection will stall.
/// - [`ConnectionFuture`] performs the actual I/O. You must poll it, usually by spawning a task.
///
/// You can cheaply clone this object and safely share the clones between tasks.
#[derive(Clone)]
pub struct Connection {
    conn_st: Weak<Mutex<ConnState>>,
}

impl Connection {
    /// Creates the client side of an SSH connection from an existing stream.
    ///
    /// We do not perform any I/O in this method, the I/O happens when you poll the returned
    /// [`ConnectionFuture`].
    pub fn connect<IO>(stream: IO, config: ConnConfig) -> Result<(Connection, ConnReceiver, ConnectionFuture<IO>)>
        where IO: AsyncRead + AsyncWrite
    {
        Self::open(stream, Role::Client, config, None)
    }

    /// Creates the server side of an SSH connection from an accepted stream.
    ///
    /// The `hooks` provide our host keys and decide how the client is authenticated and how
    /// processes are spawned.
    pub fn accept<IO>(
        stream: IO,
        config: ConnConfig,
        hooks: ServerHooks,
    ) -> Result<(Connection, ConnReceiver, ConnectionFuture<IO>)>
        where IO: AsyncRead + AsyncWrite
    {
        if hooks.host_keys.is_empty() {
            return Err(Error::HostKeyMissing("any"))
        }
        Self::open(stream, Role::Server, config, Some(hooks))
    }

    fn open<IO>(
        stream: IO,
        role: Role,
        config: ConnConfig,
        hooks: Option<ServerHooks>,
    ) -> Result<(Connection, ConnReceiver, ConnectionFuture<IO>)>
        where IO: AsyncRead + AsyncWrite
    {
        let rng = Box::new(OsRng);
        let (event_tx, event_rx) = mpsc::channel(1);
        let conn_st = conn_state::new_conn(role, config, hooks, rng, event_tx)?;
        let conn_st = Arc::new(Mutex::new(conn_st));

        let conn = Connection { conn_st: Arc::downgrade(&conn_st) };
        let conn_rx = ConnReceiver { event_rx };
        let conn_fut = ConnectionFuture { conn_st, stream };
        Ok((conn, conn_rx, conn_fut))
    }

    fn upgrade(&self) -> Result<Arc<Mutex<ConnState>>> {
        self.conn_st.upgrade().ok_or(Error::ConnClosed)
    }

    /// Returns true once the authentication has succeeded.
    ///
    /// On the client, this means that the server accepted one of our `auth_*` attempts. On the
    /// server, this means that the client has logged in.
    pub fn is_authenticated(&self) -> Result<bool> {
        Ok(auth::is_authenticated(&self.upgrade()?.lock()))
    }

    /// The user that the client has authenticated as (server only).
    pub fn username(&self) -> Result<Option<String>> {
        Ok(self.upgrade()?.lock().auth_server_st.username().map(|username| username.to_owned()))
    }

    /// Trigger key exchange (rekeying).
    ///
    /// Starts a key re-exchange (RFC 4253, section 9). Normally, we trigger the re-exchange
    /// automatically (see [`ConnConfig::rekey_after_bytes`] and
    /// [`ConnConfig::rekey_after_duration`]), but you can use this method to start the exchange
    /// earlier. Returns when the exchange completes.
    pub async fn rekey(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        negotiate::start_kex(&mut self.upgrade()?.lock(), Some(done_tx));
        done_rx.await.map_err(|_| Error::ConnClosed)?
    }

    /// Disconnects from the peer.
    ///
    /// We send `SSH_MSG_DISCONNECT` with the given `error` and the [`ConnectionFuture`] returns
    /// once the message is flushed. You may want to use [`DisconnectError::by_app()`] as a
    /// reasonable default value.
    pub fn disconnect(&self, error: DisconnectError) -> Result<()> {
        conn_state::disconnect(&mut self.upgrade()?.lock(), error)
    }
}

/// # Authentication (client only)
///
/// If you start another attempt before the previous attempt is resolved, it fails with
/// [`Error::AuthPending`].
impl Connection {
    /// Try to authenticate using the "none" method (RFC 4252, section 5.2).
    ///
    /// This is mostly useful to find out which methods the server supports: you expect an
    /// [`AuthResult::Failure`] and look at
    /// [`methods_can_continue`][super::AuthFailure::methods_can_continue].
    pub async fn auth_none(&self, username: String) -> Result<AuthResult> {
        self.auth(username, Credentials::None).await
    }

    /// Try to authenticate using the "password" method (RFC 4252, section 8).
    pub async fn auth_password(&self, username: String, password: String) -> Result<AuthResult> {
        self.auth(username, Credentials::Password(password)).await
    }

    /// Try to authenticate using the "publickey" method (RFC 4252, section 7).
    ///
    /// The `algo` must be compatible with the `privkey`, otherwise you get
    /// [`Error::PrivkeyFormat`].
    pub async fn auth_pubkey(
        &self,
        username: String,
        privkey: Privkey,
        algo: &'static PubkeyAlgo,
    ) -> Result<AuthResult> {
        self.auth(username, Credentials::Pubkey { privkey, algo }).await
    }

    async fn auth(&self, username: String, credentials: Credentials) -> Result<AuthResult> {
        let (result_tx, result_rx) = oneshot::channel();
        let method = SingleRequest::new(username, credentials, result_tx);
        auth::start_method(&mut self.upgrade()?.lock(), Box::new(method))?;
        result_rx.await.map_err(|_| Error::ConnClosed)?
    }
}

/// # Channels
///
/// These methods wait until the authentication is complete before they open anything.
impl Connection {
    /// Opens an SSH session to execute a program or the shell (client only).
    ///
    /// You receive the [`Session`] handle to send requests, the [`SessionReceiver`] that produces
    /// the exit status, and the [`SessionIo`] with the data streams of the remote process.
    pub async fn open_session(&self) -> Result<(Session, SessionReceiver, SessionIo)> {
        let (stdio, local_stdio) = tokio::io::duplex(DUPLEX_LEN);
        let (stderr, local_stderr) = tokio::io::duplex(DUPLEX_LEN);
        let (local_reader, local_writer) = tokio::io::split(local_stdio);
        let io = LocalIo {
            reader: Some(Box::pin(local_reader)),
            writer: Some(Box::pin(local_writer)),
            ext_reader: None,
            ext_writer: Some(Box::pin(local_stderr)),
        };

        let (event_tx, event_rx) = mpsc::channel(4);
        let channel = self.open_channel(ChannelKind::Session, io, Some(event_tx)).await?;
        Ok((Session { channel }, SessionReceiver { event_rx }, SessionIo { stdio, stderr }))
    }

    /// Opens a "direct-tcpip" channel to `host:port` on the side of the server (client only).
    ///
    /// `orig_host` and `orig_port` describe the originator of the connection (RFC 4254, section
    /// 7.2). The data of the tunnel is carried by the returned stream.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        orig_host: &str,
        orig_port: u16,
    ) -> Result<(Channel, DuplexStream)> {
        let (stream, local_stream) = tokio::io::duplex(DUPLEX_LEN);
        let kind = ChannelKind::DirectTcpip {
            host: host.into(),
            port: port as u32,
            orig_host: orig_host.into(),
            orig_port: orig_port as u32,
        };
        let channel = self.open_channel(kind, LocalIo::from_stream(local_stream), None).await?;
        Ok((channel, stream))
    }

    async fn open_channel(
        &self,
        kind: ChannelKind,
        io: LocalIo,
        event_tx: Option<mpsc::Sender<SessionEvent>>,
    ) -> Result<Channel> {
        let (opened_tx, opened_rx) = oneshot::channel();
        let open = OpenChannel { kind, io, event_tx, opened_tx: Some(opened_tx) };
        let id = channels::open_channel(&mut self.upgrade()?.lock(), open)?;
        opened_rx.await.map_err(|_| Error::ChannelClosed)??;
        Ok(Channel { conn_st: self.conn_st.clone(), id })
    }
}

/// # Port forwarding (client only)
impl Connection {
    /// Asks the server to listen on `bind_host:bind_port` and forward the connections to
    /// `connect_host:connect_port` on our side (RFC 4254, section 7.1).
    ///
    /// Use port 0 to let the server pick a port. Returns the port that the server bound.
    pub async fn forward_remote(
        &self,
        bind_host: &str,
        bind_port: u16,
        connect_host: &str,
        connect_port: u16,
    ) -> Result<u16> {
        let (result_tx, result_rx) = oneshot::channel();
        global::forward_remote(
            &mut self.upgrade()?.lock(),
            bind_host.into(), bind_port as u32,
            connect_host.into(), connect_port as u32,
            result_tx,
        );
        let bound_port = result_rx.await.map_err(|_| Error::ConnClosed)??;
        u16::try_from(bound_port).map_err(|_| Error::Protocol("server bound an invalid port"))
    }

    /// Cancels a forwarding set up with [`forward_remote()`][Self::forward_remote()].
    pub async fn cancel_forward_remote(&self, bind_host: &str, bind_port: u16) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        global::cancel_forward_remote(&mut self.upgrade()?.lock(), bind_host.into(), bind_port as u32, result_tx);
        result_rx.await.map_err(|_| Error::ConnClosed)?
    }

    /// Listens on `bind_host:bind_port` and forwards every accepted connection to
    /// `connect_host:connect_port` on the side of the server.
    ///
    /// Returns the bound port, which is useful if `bind_port` is 0. The listener lives as long as
    /// the connection.
    pub fn forward_local(
        &self,
        bind_host: &str,
        bind_port: u16,
        connect_host: &str,
        connect_port: u16,
    ) -> Result<u16> {
        let conn_st = self.upgrade()?;
        let mut st = conn_st.lock();
        let bound_port = listener::add_local_forward(
            &mut st, bind_host, bind_port, connect_host.into(), connect_port as u32)?;
        conn_state::wakeup_conn(&mut st);
        Ok(bound_port)
    }
}

/// Handle to a channel opened by us.
///
/// You can cheaply clone this object and safely share the clones between tasks.
#[derive(Clone)]
pub struct Channel {
    conn_st: Weak<Mutex<ConnState>>,
    id: ChannelId,
}

impl Channel {
    fn upgrade(&self) -> Result<Arc<Mutex<ConnState>>> {
        self.conn_st.upgrade().ok_or(Error::ConnClosed)
    }

    /// Close the channel.
    ///
    /// We send `SSH_MSG_CHANNEL_CLOSE` and the channel disappears once the peer replies. Closing
    /// an already closed channel does nothing.
    pub fn close(&self) -> Result<()> {
        let conn_st = self.upgrade()?;
        let mut st = conn_st.lock();
        if let Ok(channel_st) = channels::ready_channel(&mut st, self.id) {
            channel_state::close(channel_st);
            conn_state::wakeup_conn(&mut st);
        }
        Ok(())
    }

    pub(super) fn send_request(&self, req: ChannelReq) -> Result<()> {
        let conn_st = self.upgrade()?;
        let mut st = conn_st.lock();
        channel_state::send_request(channels::ready_channel(&mut st, self.id)?, req)?;
        conn_state::wakeup_conn(&mut st);
        Ok(())
    }
}

/// Receiving half of a [`Connection`].
///
/// Produces the [`ConnEvent`]s. You **must** receive these events, otherwise the connection will
/// stall when the internal buffer of events fills up.
pub struct ConnReceiver {
    event_rx: mpsc::Receiver<ConnEvent>,
}

impl ConnReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` if the connection was closed.
    pub async fn recv(&mut self) -> Option<ConnEvent> {
        self.event_rx.recv().await
    }

    /// Poll-friendly variant of [`.recv()`][Self::recv()].
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<ConnEvent>> {
        self.event_rx.poll_recv(cx)
    }
}

/// Future that drives the connection state machine.
///
/// This future performs the reads and writes on `IO` and stores the state of the connection. You
/// must poll this future, usually by spawning a task for it. The future completes when the
/// connection is closed or when an error happens.
#[pin_project]
pub struct ConnectionFuture<IO> {
    conn_st: Arc<Mutex<ConnState>>,
    #[pin] stream: IO,
}

impl<IO> ConnectionFuture<IO> {
    /// Deconstructs the future and gives the `IO` back to you.
    pub fn into_stream(self) -> IO {
        self.stream
    }
}

impl<IO> Future for ConnectionFuture<IO>
    where IO: AsyncRead + AsyncWrite
{
    type Output = Result<()>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        let this = self.project();
        let mut conn_st = this.conn_st.lock();
        conn_state::poll_conn(&mut conn_st, this.stream, cx)
    }
}
