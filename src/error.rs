use std::fmt;
use crate::codes::{disconnect, open};

/// Result type for our [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error that occured while handling SSH connection.
///
/// This enum is `#[non_exhaustive]`, so we reserve the right to add more variants and don't
/// consider this to break backwards compatibility.
#[derive(thiserror::Error, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    #[error("cryptography error: {0}")]
    Crypto(&'static str),
    #[error("randomness error: {0}")]
    Random(&'static str),
    #[error("mac verification failed")]
    Mac,
    #[error("signature verification failed")]
    Signature,
    #[error("public key does not match the algorithm")]
    PubkeyFormat,
    #[error("private key does not match the algorithm")]
    PrivkeyFormat,
    #[error("no host key for algorithm {0:?}")]
    HostKeyMissing(&'static str),
    #[error("compression error: {0}")]
    Compress(&'static str),
    #[error("server public key was not accepted")]
    PubkeyAccept(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("peer uses unsupported protocol version")]
    ProtocolVersion,
    #[error("could not decode bytes: {0}")]
    Decode(&'static str),
    #[error("could not negotiate algorithm: {0}")]
    AlgoNegotiate(AlgoNegotiateError),
    #[error("packet {0} not implemented")]
    PacketNotImplemented(u8),
    #[error("service {0:?} is not available")]
    ServiceNotAvailable(String),
    #[error("another authentication method is pending")]
    AuthPending,
    #[error("authentication failed")]
    AuthFailed,
    #[error("too many failed authentication attempts")]
    AuthTriesExceeded,
    #[error("authentication was not completed in time")]
    AuthTimeout,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("could not open channel: {0}")]
    ChannelOpen(ChannelOpenError),
    #[error("channel request failed")]
    ChannelReq,
    #[error("global request failed")]
    GlobalReq,
    #[error("too many listeners")]
    ListenerLimit,
    #[error("could not bind listener")]
    Bind(#[source] std::io::Error),
    #[error("IO error when reading")]
    ReadIo(#[source] std::io::Error),
    #[error("IO error when writing")]
    WriteIo(#[source] std::io::Error),
    #[error("connection unexpectedly closed by peer")]
    PeerClosed,
    #[error("peer disconnected: {0}")]
    PeerDisconnected(DisconnectError),
    #[error("connection was disconnected by us")]
    ConnDisconnected,
    #[error("connection is closed")]
    ConnClosed,
}

impl Error {
    /// Reason code that we send to the peer in `SSH_MSG_DISCONNECT` when this error tears the
    /// connection down.
    ///
    /// Returns `None` for errors that leave the transport unusable (I/O errors and errors
    /// reported by the peer itself).
    pub fn disconnect_reason(&self) -> Option<u32> {
        Some(match self {
            Error::Mac => disconnect::MAC_ERROR,
            Error::Compress(_) => disconnect::COMPRESSION_ERROR,
            Error::Crypto(_) | Error::Random(_) | Error::Signature | Error::PubkeyFormat |
            Error::PrivkeyFormat | Error::HostKeyMissing(_) |
            Error::AlgoNegotiate(_) => disconnect::KEY_EXCHANGE_FAILED,
            Error::PubkeyAccept(_) => disconnect::HOST_KEY_NOT_VERIFIABLE,
            Error::ProtocolVersion => disconnect::PROTOCOL_VERSION_NOT_SUPPORTED,
            Error::ServiceNotAvailable(_) => disconnect::SERVICE_NOT_AVAILABLE,
            Error::AuthTriesExceeded => disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
            Error::AuthTimeout => disconnect::BY_APPLICATION,
            Error::Protocol(_) | Error::Decode(_) | Error::PacketNotImplemented(_) =>
                disconnect::PROTOCOL_ERROR,
            Error::ReadIo(_) | Error::WriteIo(_) | Error::PeerClosed |
            Error::PeerDisconnected(_) | Error::ConnDisconnected | Error::ConnClosed =>
                return None,
            _ => disconnect::BY_APPLICATION,
        })
    }
}

/// Error that occured because we could not negotiate an algorithm.
///
/// During the SSH key exchange, the client and the server must negotiate which cryptographic
/// algorithms (such as ciphers or MACs) to use, as described in RFC 4253, section 7.1. This error
/// occurs when there is no intersection between the set of algorithms supported by the client and
/// by the server.
#[derive(Debug, Clone, thiserror::Error)]
#[error("for {algo_name:}, client algos are {client_algos:?}, server algos are {server_algos:?}")]
pub struct AlgoNegotiateError {
    /// Human readable name of the algorithm.
    pub algo_name: String,
    /// The set of algorithms supplied by the client.
    pub client_algos: Vec<String>,
    /// The set of algorithms supplied by the server.
    pub server_algos: Vec<String>,
}

/// Error that occured because the peer disconnected.
///
/// This corresponds to the `SSH_MSG_DISCONNECT` packet described in RFC 4253, section 11.1.
#[derive(Debug, Clone, thiserror::Error)]
pub struct DisconnectError {
    /// Machine-readable reason code (see [`codes::disconnect`][crate::codes::disconnect]).
    pub reason_code: u32,
    /// Human-readable description of the error.
    pub description: String,
    /// Language tag of `description` (per RFC 3066).
    pub description_lang: String,
}

impl DisconnectError {
    /// Disconnect by application, with an empty description.
    pub fn by_app() -> Self {
        Self {
            reason_code: disconnect::BY_APPLICATION,
            description: "".into(),
            description_lang: "".into(),
        }
    }

    /// Translates the [`reason_code`][Self::reason_code] into a string.
    pub fn reason_to_str(&self) -> Option<&'static str> {
        disconnect::to_str(self.reason_code)
    }
}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_reason(f, disconnect::to_str(self.reason_code), self.reason_code, &self.description)
    }
}

/// Error that occured when opening a channel.
///
/// This corresponds to the `SSH_MSG_CHANNEL_OPEN_FAILURE` packet described in RFC 4254, section
/// 5.1.
#[derive(Debug, Clone, thiserror::Error)]
pub struct ChannelOpenError {
    /// Machine-readable reason code (see [`codes::open`][crate::codes::open]).
    pub reason_code: u32,
    /// Human-readable description of the error.
    pub description: String,
    /// Language tag of `description` (per RFC 3066).
    pub description_lang: String,
}

impl ChannelOpenError {
    /// Error with the given reason code and description.
    pub fn new(reason_code: u32, description: &str) -> Self {
        Self { reason_code, description: description.into(), description_lang: "".into() }
    }
}

impl fmt::Display for ChannelOpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_reason(f, open::to_str(self.reason_code), self.reason_code, &self.description)
    }
}

fn fmt_reason(
    f: &mut fmt::Formatter,
    reason: Option<&'static str>,
    reason_code: u32,
    description: &str,
) -> fmt::Result {
    write!(f, "peer returned error ")?;
    if let Some(reason) = reason {
        write!(f, "`{}` ({})", reason, reason_code)?;
    } else {
        write!(f, "{}", reason_code)?;
    }
    if !description.is_empty() {
        write!(f, ": {:?}", description)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason() {
        assert_eq!(Error::Mac.disconnect_reason(), Some(disconnect::MAC_ERROR));
        assert_eq!(Error::Protocol("x").disconnect_reason(), Some(disconnect::PROTOCOL_ERROR));
        assert_eq!(Error::AuthTriesExceeded.disconnect_reason(),
            Some(disconnect::NO_MORE_AUTH_METHODS_AVAILABLE));
        assert_eq!(Error::PeerClosed.disconnect_reason(), None);
    }

    #[test]
    fn test_display_open_error() {
        let err = ChannelOpenError::new(open::CONNECT_FAILED, "no route");
        assert_eq!(err.to_string(), "peer returned error `connect failed` (2): \"no route\"");
    }
}
