use bytes::Bytes;
use derivative::Derivative;
use std::future::Future;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use super::session::{ExitStatus, PtyRequest, WindowChange};

/// Starts processes for server sessions.
///
/// The server calls [`spawn()`][Self::spawn()] when the client sends a `"shell"`, `"exec"` or
/// `"subsystem"` request. The connection then pumps the data between the channel and the
/// process, so the spawner does not need to care about SSH at all.
pub trait SessionSpawner: Send + Sync {
    /// Start the process described by `request`.
    ///
    /// If this returns an error, the request fails and the session stays open.
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedProcess>;
}

/// Description of a process that the client wants to start.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Authenticated user that owns the session.
    pub username: String,
    /// What should be started.
    pub command: SessionCommand,
    /// Pseudo-terminal requested by the client (`"pty-req"`), if any.
    pub pty: Option<PtyRequest>,
    /// Environment variables from `"env"` requests, followed by `SSH_AUTH_SOCK` and `DISPLAY`
    /// if agent or X11 forwarding is active.
    pub env: Vec<(String, String)>,
}

/// The request that starts a process in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// The user's default shell (`"shell"`).
    Shell,
    /// A command (`"exec"`).
    Exec(Bytes),
    /// A named subsystem (`"subsystem"`).
    Subsystem(String),
}

/// Handles to a process started by a [`SessionSpawner`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SpawnedProcess {
    /// Standard input of the process, fed from the channel data.
    #[derivative(Debug = "ignore")]
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    /// Standard output of the process, sent as channel data.
    #[derivative(Debug = "ignore")]
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    /// Standard error of the process, sent as extended data.
    #[derivative(Debug = "ignore")]
    pub stderr: Option<Pin<Box<dyn AsyncRead + Send>>>,
    /// Resolves when the process exits.
    #[derivative(Debug = "ignore")]
    pub exit: Pin<Box<dyn Future<Output = ExitStatus> + Send>>,
    /// Receives the `"window-change"` and `"signal"` requests of the client.
    #[derivative(Debug = "ignore")]
    pub control: Option<Box<dyn SessionControl>>,
}

/// Control interface of a running process.
pub trait SessionControl: Send {
    /// The terminal of the client changed its size.
    fn window_change(&mut self, _change: &WindowChange) {}

    /// The client wants to deliver a signal (see [`codes::signal`][crate::codes::signal]).
    fn signal(&mut self, _signal_name: &str) {}
}
