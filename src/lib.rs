//! Asynchronous SSH2 transport and channel multiplexing engine in pure Rust.
//!
//! The same engine drives both sides of a connection:
//!
//! - A client passes its stream to [`Connection::connect()`], authenticates with one of the
//! `auth_*` methods and then opens [`Session`]s, "direct-tcpip" tunnels or port forwardings.
//! - A server passes an accepted stream to [`Connection::accept()`] together with
//! [`ServerHooks`] that decide who may log in ([`Authenticator`]) and how processes are started
//! ([`SessionSpawner`]). [`serve()`] runs a complete TCP server on top of that.
//!
//! In both cases you must poll the [`ConnectionFuture`] and receive the [`ConnEvent`]s from the
//! [`ConnReceiver`].
//!
#![allow(clippy::box_default)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::unused_unit)]
#![allow(clippy::unit_arg)]
#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]
#![warn(missing_docs)]

pub use crate::conn::{AuthFailure, AuthResult, Authenticator, AuthRequest, AuthRequestMethod};
pub use crate::conn::{ConnConfig, ServerHooks, Role};
pub use crate::conn::{Connection, ConnReceiver, ConnectionFuture, Channel, ChannelKind};
pub use crate::conn::{ConnEvent, AcceptPubkeySender, DebugMsg, AuthBanner};
pub use crate::conn::{
    Session, SessionReceiver, SessionEvent, SessionIo, ExitStatus, ExitSignal,
    PtyRequest, WindowChange,
};
pub use crate::conn::{SessionSpawner, SpawnRequest, SessionCommand, SpawnedProcess, SessionControl};
pub use crate::conn::serve;
pub use crate::codec::{PacketEncode, PacketDecode};
pub use crate::error::{Result, Error, AlgoNegotiateError, DisconnectError, ChannelOpenError};

pub use self::cipher::CipherAlgo;
pub use self::compress::CompressAlgo;
pub use self::kex::KexAlgo;
pub use self::mac::MacAlgo;
pub use self::pubkey::{PubkeyAlgo, Pubkey, Privkey};

pub use bytes;
pub use ed25519_dalek;
pub use rsa;

pub mod cipher;
mod codec;
pub mod codes;
pub mod compress;
mod conn;
mod error;
pub mod kex;
mod key_context;
pub mod mac;
pub mod pubkey;
mod util;
