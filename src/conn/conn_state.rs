use bytes::Bytes;
use futures_core::ready;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::sync::mpsc;
use tokio_util::io::poll_read_buf;
use tokio_util::sync::PollSender;
use crate::codec::{Codec, RecvPipe, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result, DisconnectError};
use crate::util::{AsyncReadWrite, CryptoRngCore};
use super::Role;
use super::auth::{self, AuthState};
use super::auth_server::{self, ServerAuthState};
use super::channels::{self, ChannelsState};
use super::config::{ConnConfig, ServerHooks};
use super::event::ConnEvent;
use super::global::{self, GlobalState};
use super::listener::{self, ListenersState};
use super::negotiate::{self, NegotiateState};
use super::pump::Pump;
use super::recv::{self, RecvState};

pub(super) struct ConnState {
    pub role: Role,
    pub config: Arc<ConnConfig>,
    pub hooks: Option<ServerHooks>,
    pub rng: Box<dyn CryptoRngCore + Send>,
    pub event_tx: PollSender<ConnEvent>,
    pub codec: Codec,
    pub our_ident: Bytes,
    pub their_ident: Option<Bytes>,
    our_disconnect: Option<DisconnectError>,
    disconnect_sent: bool,
    pub recv_st: Option<Box<dyn RecvState + Send>>,
    pub negotiate_st: Box<NegotiateState>,
    pub auth_st: Box<AuthState>,
    pub auth_server_st: Box<ServerAuthState>,
    pub channels_st: Box<ChannelsState>,
    pub global_st: Box<GlobalState>,
    pub listeners_st: Box<ListenersState>,
    pub session_id: Option<Vec<u8>>,
    waker: Option<Waker>,
}

pub(super) fn new_conn(
    role: Role,
    config: ConnConfig,
    hooks: Option<ServerHooks>,
    mut rng: Box<dyn CryptoRngCore + Send>,
    event_tx: mpsc::Sender<ConnEvent>,
) -> Result<ConnState> {
    let our_ident = Bytes::from(format!("SSH-2.0-{}", config.ident_software));
    let codec = Codec::new(&our_ident, config.max_ident_lines, &mut *rng)?;
    log::debug!("sending our identifier {:?} as {:?}", our_ident, role);

    let config = Arc::new(config);
    Ok(ConnState {
        role,
        hooks,
        rng,
        event_tx: PollSender::new(event_tx),
        codec,
        our_ident,
        their_ident: None,
        our_disconnect: None,
        disconnect_sent: false,
        recv_st: None,
        negotiate_st: Box::new(negotiate::init_negotiate()),
        auth_st: Box::new(auth::init_auth()),
        auth_server_st: Box::new(auth_server::init_auth_server()),
        channels_st: Box::new(channels::init_channels(&config)),
        global_st: Box::new(global::init_global()),
        listeners_st: Box::new(listener::init_listeners(&config)),
        session_id: None,
        waker: None,
        config,
    })
}

/// Connection state that is not attached to any socket, for unit tests of the protocol logic.
#[cfg(test)]
pub(super) fn new_test_conn(role: Role, config: ConnConfig) -> ConnState {
    use rand::SeedableRng as _;
    let (event_tx, _) = mpsc::channel(1);
    let rng = Box::new(rand_chacha::ChaCha8Rng::seed_from_u64(1));
    new_conn(role, config, None, rng, event_tx).unwrap()
}

impl ConnState {
    pub fn client_ident(&self) -> &[u8] {
        match self.role {
            Role::Client => &self.our_ident,
            Role::Server => self.their_ident.as_deref().unwrap_or_default(),
        }
    }

    pub fn server_ident(&self) -> &[u8] {
        match self.role {
            Role::Client => self.their_ident.as_deref().unwrap_or_default(),
            Role::Server => &self.our_ident,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.our_disconnect.is_some() || self.disconnect_sent
    }
}

pub(super) fn poll_conn(
    st: &mut ConnState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Poll<Result<()>> {
    let res = ready!(poll_conn_pump(st, stream.as_mut(), cx));
    if let Err(err) = &res {
        send_error_disconnect(st, stream.as_mut(), cx, err);
    }
    listener::remove_all_listeners(st);
    channels::drop_all_channels(st);
    Poll::Ready(res)
}

fn poll_conn_pump(
    st: &mut ConnState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Poll<Result<()>> {
    if let Some(error) = st.our_disconnect.take() {
        send_disconnect(st, error)?;
        st.disconnect_sent = true;
    }

    loop {
        let mut progress = false;

        if !st.disconnect_sent {
            while recv::pump_recv(st, cx)?.is_progress() { progress = true }
            while negotiate::pump_negotiate(st, cx)?.is_progress() { progress = true }
            match st.role {
                Role::Client => while auth::pump_auth(st, cx)?.is_progress() { progress = true },
                Role::Server => while auth_server::pump_auth_server(st, cx)?.is_progress() { progress = true },
            }
            while channels::pump_channels(st, cx)?.is_progress() { progress = true }
            while global::pump_global(st, cx)?.is_progress() { progress = true }
            while listener::pump_listeners(st, cx)?.is_progress() { progress = true }

            if let Some(error) = st.our_disconnect.take() {
                send_disconnect(st, error)?;
                st.disconnect_sent = true;
                progress = true;
            }

            if !st.disconnect_sent && pump_read(st, stream.as_mut(), cx)?.is_progress() { continue }
        }

        while pump_write(st, stream.as_mut(), cx)?.is_progress() { progress = true }

        if !progress { break }
    }

    let flushed = flush_write(st, stream.as_mut(), cx)?;
    if st.disconnect_sent && flushed {
        return Poll::Ready(Ok(()))
    }

    st.waker = Some(cx.waker().clone());
    Poll::Pending
}

pub(super) fn wakeup_conn(st: &mut ConnState) {
    if let Some(waker) = st.waker.take() {
        waker.wake();
    }
}

fn pump_read(
    st: &mut ConnState,
    stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<Pump> {
    if st.their_ident.is_some() {
        pump_read_packet(st, stream, cx)
    } else {
        pump_read_ident(st, stream, cx)
    }
}

fn pump_read_packet(
    st: &mut ConnState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<Pump> {
    if st.recv_st.is_some() {
        return Ok(Pump::Pending)
    }

    let packet = pump_ready!(poll_read(st, stream.as_mut(), cx, |pipe| pipe.consume_packet()))?;
    st.recv_st = recv::recv_packet(st, packet)?;
    Ok(Pump::Progress)
}

fn pump_read_ident(
    st: &mut ConnState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<Pump> {
    let ident = pump_ready!(poll_read(st, stream.as_mut(), cx, |pipe| pipe.consume_ident()))?;
    let ident = Bytes::copy_from_slice(&ident);
    log::debug!("received peer identifier: {:?}", ident);
    st.their_ident = Some(ident);
    Ok(Pump::Progress)
}

fn pump_write(
    st: &mut ConnState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<Pump> {
    let data = st.codec.send_pipe.peek_bytes();
    if data.is_empty() { return Ok(Pump::Pending) }
    match stream.as_mut().poll_write(cx, data) {
        Poll::Ready(Ok(0)) | Poll::Pending => {
            log::trace!("pending write of {} bytes", data.len());
            Ok(Pump::Pending)
        },
        Poll::Ready(Ok(written_len)) => {
            log::trace!("written {}/{} bytes", written_len, data.len());
            st.codec.send_pipe.consume_bytes(written_len);
            Ok(Pump::Progress)
        },
        Poll::Ready(Err(err)) => {
            log::debug!("error when writing: {}", err);
            Err(Error::WriteIo(err))
        },
    }
}

fn flush_write(
    st: &mut ConnState,
    stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<bool> {
    match stream.poll_flush(cx) {
        Poll::Ready(Ok(())) => Ok(st.codec.send_pipe.is_empty()),
        Poll::Pending => Ok(false),
        Poll::Ready(Err(err)) => Err(Error::WriteIo(err)),
    }
}

fn poll_read<F, T>(
    st: &mut ConnState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
    consume_f: F
) -> Poll<Result<T>>
    where F: Fn(&mut RecvPipe) -> Result<Option<T>>
{
    loop {
        if let Some(value) = consume_f(&mut st.codec.recv_pipe)? {
            return Poll::Ready(Ok(value))
        }

        match poll_read_buf(stream.as_mut(), cx, st.codec.recv_pipe.feed_buf()) {
            Poll::Pending => {
                log::trace!("pending read");
                return Poll::Pending
            },
            Poll::Ready(Ok(0)) => {
                log::debug!("received eof");
                return Poll::Ready(Err(Error::PeerClosed))
            },
            Poll::Ready(Ok(read_len)) => {
                log::trace!("read {} bytes", read_len);
                continue
            },
            Poll::Ready(Err(err)) => {
                log::debug!("error when reading: {}", err);
                return Poll::Ready(Err(Error::ReadIo(err)))
            },
        }
    }
}

pub(super) fn disconnect(st: &mut ConnState, error: DisconnectError) -> Result<()> {
    if !st.disconnect_sent && st.our_disconnect.is_none() {
        st.our_disconnect = Some(error);
        wakeup_conn(st);
        Ok(())
    } else {
        Err(Error::ConnDisconnected)
    }
}

fn send_disconnect(st: &mut ConnState, error: DisconnectError) -> Result<()> {
    // RFC 4253, section 11.1
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::DISCONNECT);
    payload.put_u32(error.reason_code);
    payload.put_str(&error.description);
    payload.put_str(&error.description_lang);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_DISCONNECT with reason code {}", error.reason_code);
    Ok(())
}

/// Tells the peer why we are tearing the connection down, if the transport still works.
///
/// Whatever cannot be written without blocking is lost.
fn send_error_disconnect(
    st: &mut ConnState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
    err: &Error,
) {
    let Some(reason_code) = err.disconnect_reason() else { return };
    if st.disconnect_sent || st.their_ident.is_none() {
        return
    }

    let error = DisconnectError {
        reason_code,
        description: err.to_string(),
        description_lang: "".into(),
    };
    if send_disconnect(st, error).is_err() {
        return
    }
    st.disconnect_sent = true;

    while let Ok(Pump::Progress) = pump_write(st, stream.as_mut(), cx) {}
    let _ = flush_write(st, stream.as_mut(), cx);
}
