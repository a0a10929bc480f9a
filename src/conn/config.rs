use derivative::Derivative;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use crate::cipher::{self, CipherAlgo};
use crate::compress::{self, CompressAlgo};
use crate::kex::{self, KexAlgo};
use crate::mac::{self, MacAlgo};
use crate::pubkey::{self, PubkeyAlgo, Privkey};
use super::auth_server::Authenticator;
use super::spawner::SessionSpawner;

/// Configuration of a [`Connection`][super::Connection].
///
/// You should start from the [default][Default] instance, which has reasonable default
/// configuration, and modify it according to your needs. You may also find the method
/// [`ConnConfig::with()`] syntactically convenient.
///
/// If you need compatibility with old SSH implementations that use outdated crypto, you may use
/// [`ConnConfig::default_compatible_less_secure()`]. However, this configuration is less secure.
///
/// The same configuration is used by clients and servers; fields that apply to only one role
/// say so in their documentation.
///
/// This struct is `#[non_exhaustive]`, so we may add more fields without breaking backward
/// compatibility.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnConfig {
    /// Software name and version that we send in our identification line.
    ///
    /// The line is `SSH-2.0-<ident_software>`, so the string must not contain spaces or control
    /// characters.
    pub ident_software: String,

    /// Supported [key exchange algorithms][crate::kex].
    ///
    /// The client's order of preference decides which algorithm is used. If there is no overlap,
    /// the connnection will abort.
    pub kex_algos: Vec<&'static KexAlgo>,

    /// Supported [host key algorithms][crate::pubkey].
    ///
    /// A server offers only the algorithms that work with one of its host keys.
    pub host_key_algos: Vec<&'static PubkeyAlgo>,

    /// Supported [encryption algorithms][crate::cipher].
    pub cipher_algos: Vec<&'static CipherAlgo>,

    /// Supported [message authentication algorithms][crate::mac].
    pub mac_algos: Vec<&'static MacAlgo>,

    /// Supported [compression algorithms][crate::compress].
    pub compress_algos: Vec<&'static CompressAlgo>,

    /// Start key re-exchange after this many bytes.
    ///
    /// We trigger a key re-exchange (RFC 4253, section 9) after this number of bytes is
    /// transmitted and received since the last exchange. By default, this is 2^30 bytes (as
    /// recommended by the SSH specification).
    pub rekey_after_bytes: u64,

    /// Start key re-exchange after this amount of time.
    ///
    /// By default, we perform the re-exchange after one hour (as recommended by the SSH
    /// specification).
    pub rekey_after_duration: Duration,

    /// Maximum number of identification lines that the peer may send before its version line.
    pub max_ident_lines: usize,

    /// Receive window that we advertise for every channel.
    ///
    /// The peer can send at most this many bytes of data before we send
    /// `SSH_MSG_CHANNEL_WINDOW_ADJUST`.
    pub channel_window_max: usize,

    /// Maximum packet size that we advertise for every channel.
    ///
    /// Capped at 32768 bytes, the largest payload that we accept from the transport.
    pub channel_packet_len_max: usize,

    /// Maximum number of channels open at the same time.
    ///
    /// Channels opened by the peer above this limit are rejected with "resource shortage".
    pub max_channels: usize,

    /// Maximum number of listeners for forwarded connections.
    pub max_listeners: usize,

    /// Time limit for user authentication (server only).
    pub auth_timeout: Duration,

    /// Maximum number of failed authentication attempts (server only).
    ///
    /// Attempts with the "none" method are not counted.
    pub max_auth_tries: u32,

    /// Allow the client to open "direct-tcpip" channels (server only).
    pub allow_local_forwarding: bool,

    /// Allow the client to request "tcpip-forward" (server only).
    pub allow_remote_forwarding: bool,

    /// Allow remote forwarding of ports below 1024 (server only).
    pub allow_privileged_ports: bool,

    /// Allow the client to request agent forwarding with "auth-agent-req@openssh.com" (server
    /// only).
    pub allow_agent_forwarding: bool,

    /// Allow the client to request X11 forwarding with "x11-req" (server only).
    pub allow_x11_forwarding: bool,

    /// First X11 display number that we try to use for X11 forwarding (server only).
    pub x11_display_offset: u16,

    /// Path to the local SSH agent socket that forwarded "auth-agent@openssh.com" channels are
    /// connected to (client only).
    ///
    /// If `None`, these channels are rejected.
    pub agent_forward_path: Option<PathBuf>,

    /// Address of the local X server that forwarded "x11" channels are connected to (client
    /// only).
    ///
    /// If `None`, these channels are rejected.
    pub x11_forward_addr: Option<String>,

    /// Disconnect once the last channel is closed.
    ///
    /// Only applies after at least one channel was open.
    pub close_on_last_channel: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            ident_software: concat!("tsumugi_", env!("CARGO_PKG_VERSION")).into(),
            kex_algos: vec![
                &kex::CURVE25519_SHA256, &kex::CURVE25519_SHA256_LIBSSH,
                &kex::DIFFIE_HELLMAN_GROUP16_SHA512, &kex::DIFFIE_HELLMAN_GROUP14_SHA256,
            ],
            host_key_algos: vec![
                &pubkey::SSH_ED25519,
                &pubkey::RSA_SHA2_256, &pubkey::RSA_SHA2_512,
            ],
            cipher_algos: vec![
                &cipher::AES128_CTR, &cipher::AES192_CTR, &cipher::AES256_CTR,
            ],
            mac_algos: vec![
                &mac::HMAC_SHA2_256, &mac::HMAC_SHA2_512,
            ],
            compress_algos: vec![
                &compress::NONE, &compress::ZLIB_OPENSSH, &compress::ZLIB,
            ],
            rekey_after_bytes: 1 << 30,
            rekey_after_duration: Duration::from_secs(60 * 60),
            max_ident_lines: 50,
            channel_window_max: 2 * 1024 * 1024,
            channel_packet_len_max: 32 * 1024,
            max_channels: 100,
            max_listeners: 20,
            auth_timeout: Duration::from_secs(300),
            max_auth_tries: 10,
            allow_local_forwarding: true,
            allow_remote_forwarding: true,
            allow_privileged_ports: false,
            allow_agent_forwarding: true,
            allow_x11_forwarding: false,
            x11_display_offset: 10,
            agent_forward_path: None,
            x11_forward_addr: None,
            close_on_last_channel: false,
        }
    }
}

impl ConnConfig {
    /// Default configuration with higher compatibility and lower security.
    ///
    /// Returns a configuration that includes support for outdated and potentially insecure crypto,
    /// notably SHA-1 and CBC mode. **Use at your own risk!**.
    pub fn default_compatible_less_secure() -> ConnConfig {
        Self::default().with(|c| {
            c.kex_algos.extend_from_slice(&[
                &kex::DIFFIE_HELLMAN_GROUP14_SHA1,
                &kex::DIFFIE_HELLMAN_GROUP1_SHA1,
            ]);
            c.host_key_algos.push(&pubkey::SSH_RSA_SHA1);
            c.cipher_algos.extend_from_slice(&[
                &cipher::AES128_CBC, &cipher::AES256_CBC,
            ]);
            c.mac_algos.push(&mac::HMAC_SHA1);
        })
    }

    /// Mutate `self` in a closure.
    ///
    /// This method applies your closure to `self` and returns the mutated configuration.
    pub fn with<F: FnOnce(&mut Self)>(mut self, f: F) -> Self {
        f(&mut self);
        self
    }

    /// Rekey threshold, capped at the recommended maximum.
    pub(crate) fn rekey_after_bytes(&self) -> u64 {
        self.rekey_after_bytes.min(1 << 30)
    }

    pub(crate) fn channel_window_max(&self) -> usize {
        self.channel_window_max.clamp(1000, u32::MAX as usize)
    }

    pub(crate) fn channel_packet_len_max(&self) -> usize {
        self.channel_packet_len_max.clamp(200, 32 * 1024)
    }
}

/// Collaborators that a server needs in addition to the [`ConnConfig`].
///
/// Pass this to [`Connection::accept()`][super::Connection::accept()].
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct ServerHooks {
    /// Host keys that we use to prove our identity during key exchange.
    ///
    /// We offer every host key algorithm from [`ConnConfig::host_key_algos`] that works with one
    /// of these keys.
    #[derivative(Debug = "ignore")]
    pub host_keys: Vec<Privkey>,

    /// Decides whether the client may log in.
    #[derivative(Debug = "ignore")]
    pub authenticator: Arc<dyn Authenticator>,

    /// Spawns processes for "shell", "exec" and "subsystem" requests.
    ///
    /// If `None`, these requests fail.
    #[derivative(Debug = "ignore")]
    pub spawner: Option<Arc<dyn SessionSpawner>>,

    /// Banner that we send to the client before the first authentication reply.
    pub banner: Option<String>,
}

impl ServerHooks {
    /// Hooks with the given host keys and authenticator, without a spawner or banner.
    pub fn new(host_keys: Vec<Privkey>, authenticator: Arc<dyn Authenticator>) -> Self {
        ServerHooks { host_keys, authenticator, spawner: None, banner: None }
    }

    /// Mutate `self` in a closure.
    pub fn with<F: FnOnce(&mut Self)>(mut self, f: F) -> Self {
        f(&mut self);
        self
    }

    /// Finds a host key that can sign with `algo`.
    pub(crate) fn host_key_for(&self, algo: &PubkeyAlgo) -> Option<&Privkey> {
        self.host_keys.iter().find(|privkey| {
            privkey.pubkey().algos_compatible_less_secure().iter().any(|a| a.name == algo.name)
        })
    }
}
