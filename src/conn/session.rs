use bytes::Bytes;
use std::task::{Context, Poll};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use crate::codec::{PacketDecode, PacketEncode};
use crate::error::{Result, Error};
use super::channel_state::ChannelReq;
use super::connection::Channel;

/// Handle to an SSH session opened by a client.
///
/// SSH session (RFC 4254, section 6) corresponds to the execution of a single process. Open it
/// with [`Connection::open_session()`][super::Connection::open_session()], which also gives you
/// the [`SessionReceiver`] for the requests of the server and the [`SessionIo`] that carries the
/// data of the process.
///
/// Once the session is open, you will typically go through three stages:
/// - prepare the execution environment: [`request_pty()`][Self::request_pty()],
/// [`env()`][Self::env()],
/// - start the execution: [`shell()`][Self::shell()], [`exec()`][Self::exec()],
/// [`subsystem()`][Self::subsystem()],
/// - interact with the process through [`SessionIo`] and with
/// [`window_change()`][Self::window_change()] and [`signal()`][Self::signal()].
///
/// You can cheaply clone this object and safely share the clones between tasks.
#[derive(Clone)]
pub struct Session {
    pub(super) channel: Channel,
}

/// Local end of the data streams of a session.
///
/// Bytes written to `stdio` are sent as the standard input of the remote process; the standard
/// output can be read from `stdio`, the standard error from `stderr`. Shut down the writing half
/// of `stdio` to send end-of-file.
#[derive(Debug)]
pub struct SessionIo {
    /// Standard input and output of the process.
    pub stdio: DuplexStream,
    /// Standard error of the process.
    pub stderr: DuplexStream,
}

impl Session {
    /// Close the session.
    ///
    /// The session will be closed once the server acknowledges our request. This method is
    /// idempotent.
    pub fn close(&self) -> Result<()> {
        self.channel.close()
    }

    async fn request(&self, request_type: &'static str, payload: Bytes) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.channel.send_request(ChannelReq { request_type, payload, reply_tx: Some(reply_tx) })?;
        match reply_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::ChannelReq),
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    fn request_no_reply(&self, request_type: &'static str, payload: Bytes) -> Result<()> {
        self.channel.send_request(ChannelReq { request_type, payload, reply_tx: None })
    }
}

/// # Preparing the execution environment
impl Session {
    /// Request a pseudo-terminal for the future process (RFC 4254, section 6.2).
    pub async fn request_pty(&self, request: &PtyRequest) -> Result<()> {
        let mut payload = PacketEncode::new();
        request.encode(&mut payload);
        self.request("pty-req", payload.finish()).await
    }

    /// Pass an environment variable to the future process.
    pub async fn env(&self, name: &str, value: &str) -> Result<()> {
        let mut payload = PacketEncode::new();
        payload.put_str(name);
        payload.put_str(value);
        self.request("env", payload.finish()).await
    }

    /// Ask the server to forward connections to our authentication agent.
    ///
    /// The connections are delivered to [`ConnConfig::agent_forward_path`][
    /// super::ConnConfig::agent_forward_path].
    pub async fn request_agent_forwarding(&self) -> Result<()> {
        self.request("auth-agent-req@openssh.com", Bytes::new()).await
    }
}

/// # Starting the process
///
/// Only one of these methods can succeed, you cannot start multiple processes with a single
/// session.
impl Session {
    /// Start the user's default shell on the server.
    pub async fn shell(&self) -> Result<()> {
        self.request("shell", Bytes::new()).await
    }

    /// Start a command on the server.
    pub async fn exec(&self, command: &[u8]) -> Result<()> {
        let mut payload = PacketEncode::new();
        payload.put_bytes(command);
        self.request("exec", payload.finish()).await
    }

    /// Start an SSH subsystem on the server (RFC 4254, section 6.5).
    pub async fn subsystem(&self, subsystem_name: &str) -> Result<()> {
        let mut payload = PacketEncode::new();
        payload.put_str(subsystem_name);
        self.request("subsystem", payload.finish()).await
    }
}

/// # Interacting with a running process
impl Session {
    /// Notify the process that the terminal window changed its size.
    pub fn window_change(&self, change: &WindowChange) -> Result<()> {
        let mut payload = PacketEncode::new();
        change.encode(&mut payload);
        self.request_no_reply("window-change", payload.finish())
    }

    /// Deliver a signal to the running process.
    ///
    /// [`codes::signal`][crate::codes::signal] lists the signal names defined by SSH.
    pub fn signal(&self, signal_name: &str) -> Result<()> {
        let mut payload = PacketEncode::new();
        payload.put_str(signal_name);
        self.request_no_reply("signal", payload.finish())
    }
}

/// Receiving half of a [`Session`].
///
/// Produces the exit status of the remote process. If you don't need it, you can drop this
/// object.
pub struct SessionReceiver {
    pub(super) event_rx: mpsc::Receiver<SessionEvent>,
}

impl SessionReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` when the session is closed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    /// Poll-friendly variant of [`.recv()`][Self::recv()].
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<SessionEvent>> {
        self.event_rx.poll_recv(cx)
    }
}

/// An event returned from [`SessionReceiver`].
///
/// This enum is marked as `#[non_exhaustive]`, so that we can add new variants without breaking
/// backwards compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// The process terminated with given exit status.
    ExitStatus(u32),

    /// The process terminated violently due to a signal.
    ExitSignal(ExitSignal),
}

/// How a process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Code(u32),
    /// Termination due to a signal.
    Signal(ExitSignal),
}

/// Information about a process that terminated due to a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Name of the signal that terminated the process.
    ///
    /// Signal names are described in RFC 4254, section 6.10.
    pub signal_name: String,
    /// True if the process produced a core dump.
    pub core_dumped: bool,
    /// Error message.
    pub message: String,
    /// Language tag of `message` (per RFC 3066).
    pub message_lang: String,
}

impl ExitSignal {
    pub(super) fn encode(&self, payload: &mut PacketEncode) {
        payload.put_str(&self.signal_name);
        payload.put_bool(self.core_dumped);
        payload.put_str(&self.message);
        payload.put_str(&self.message_lang);
    }

    pub(super) fn decode(payload: &mut PacketDecode) -> Result<Self> {
        Ok(ExitSignal {
            signal_name: payload.get_string()?,
            core_dumped: payload.get_bool()?,
            message: payload.get_string()?,
            message_lang: payload.get_string()?,
        })
    }
}

/// Pseudo-terminal request (RFC 4254, section 6.2).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value of the `TERM` environment variable (e.g. `"vt100"`).
    pub term: String,
    /// Terminal width in characters.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
    /// Terminal width in pixels.
    pub width_px: u32,
    /// Terminal height in pixels.
    pub height_px: u32,
    /// Encoded terminal modes (RFC 4254, section 8).
    pub modes: Bytes,
}

impl PtyRequest {
    pub(super) fn encode(&self, payload: &mut PacketEncode) {
        payload.put_str(&self.term);
        payload.put_u32(self.width);
        payload.put_u32(self.height);
        payload.put_u32(self.width_px);
        payload.put_u32(self.height_px);
        payload.put_bytes(&self.modes);
    }

    pub(super) fn decode(payload: &mut PacketDecode) -> Result<Self> {
        Ok(PtyRequest {
            term: payload.get_string()?,
            width: payload.get_u32()?,
            height: payload.get_u32()?,
            width_px: payload.get_u32()?,
            height_px: payload.get_u32()?,
            modes: payload.get_bytes()?,
        })
    }
}

/// Change of the terminal window dimensions (RFC 4254, section 6.7).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowChange {
    /// Terminal width in characters.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
    /// Terminal width in pixels.
    pub width_px: u32,
    /// Terminal height in pixels.
    pub height_px: u32,
}

impl WindowChange {
    pub(super) fn encode(&self, payload: &mut PacketEncode) {
        payload.put_u32(self.width);
        payload.put_u32(self.height);
        payload.put_u32(self.width_px);
        payload.put_u32(self.height_px);
    }

    pub(super) fn decode(payload: &mut PacketDecode) -> Result<Self> {
        Ok(WindowChange {
            width: payload.get_u32()?,
            height: payload.get_u32()?,
            width_px: payload.get_u32()?,
            height_px: payload.get_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_request_wire_layout() {
        let request = PtyRequest {
            term: "xterm".into(),
            width: 80,
            height: 24,
            modes: Bytes::from_static(&[0]),
            ..PtyRequest::default()
        };
        let mut payload = PacketEncode::new();
        request.encode(&mut payload);
        let encoded = payload.finish();
        assert_eq!(&encoded[..9], b"\x00\x00\x00\x05xterm");
        assert_eq!(&encoded[9..13], &80u32.to_be_bytes());
        assert_eq!(PtyRequest::decode(&mut PacketDecode::new(encoded)).unwrap(), request);
    }

    #[test]
    fn test_exit_signal_decode() {
        let mut payload = PacketEncode::new();
        payload.put_str("KILL");
        payload.put_bool(true);
        payload.put_str("killed");
        payload.put_str("");
        let signal = ExitSignal::decode(&mut PacketDecode::new(payload.finish())).unwrap();
        assert_eq!(signal.signal_name, "KILL");
        assert!(signal.core_dumped);
        assert_eq!(signal.message, "killed");
    }
}
