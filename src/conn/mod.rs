//! The connection engine shared by both roles.
//!
//! A connection is driven by a single state object ([`conn_state::ConnState`]) that is owned by
//! the [`ConnectionFuture`] and shared with the handles through a `Weak<Mutex<_>>`. Every poll of
//! the future pumps the transport, the key exchange, the authentication, the channels and the
//! listeners until no more progress can be made.
pub use self::auth::{AuthFailure, AuthResult};
pub use self::auth_server::{Authenticator, AuthRequest, AuthRequestMethod};
pub use self::config::{ConnConfig, ServerHooks};
pub use self::connection::{Connection, ConnReceiver, ConnectionFuture, Channel};
pub use self::event::{ConnEvent, AcceptPubkeySender, DebugMsg, AuthBanner};
pub use self::kind::ChannelKind;
pub use self::server::serve;
pub use self::session::{
    Session, SessionReceiver, SessionEvent, SessionIo, ExitStatus, ExitSignal,
    PtyRequest, WindowChange,
};
pub use self::spawner::{SessionSpawner, SpawnRequest, SessionCommand, SpawnedProcess, SessionControl};

#[macro_use] mod pump;
mod auth;
mod auth_method;
mod auth_server;
mod channel_state;
mod channels;
mod config;
mod conn_state;
mod connection;
mod event;
mod global;
mod kind;
mod listener;
mod negotiate;
mod recv;
mod server;
mod server_session;
mod session;
mod slot_map;
mod spawner;

/// Side of the connection that we play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We opened the connection and authenticate to the peer.
    Client,
    /// We accepted the connection and authenticate the peer.
    Server,
}
