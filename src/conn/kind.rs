use crate::codec::{PacketDecode, PacketEncode};
use crate::error::Result;

/// Type of a channel and its type-specific open data.
///
/// Every channel that we multiplex over the connection has one of these kinds (RFC 4254, sections
/// 6, 7 and the OpenSSH `PROTOCOL` document for agent forwarding).
///
/// This enum is `#[non_exhaustive]`, because we may support more channel types in the future.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelKind {
    /// Interactive session (`"session"`), opened by the client.
    Session,

    /// Connection forwarded from the client (`"direct-tcpip"`, RFC 4254, section 7.2).
    DirectTcpip {
        /// Host that the server should connect to.
        host: String,
        /// Port that the server should connect to.
        port: u32,
        /// Address of the machine that originated the connection.
        orig_host: String,
        /// Port of the machine that originated the connection.
        orig_port: u32,
    },

    /// Connection forwarded from the server (`"forwarded-tcpip"`, RFC 4254, section 7.2).
    ForwardedTcpip {
        /// Address that was bound on the server.
        host: String,
        /// Port that was bound on the server.
        port: u32,
        /// Address of the machine that originated the connection.
        orig_host: String,
        /// Port of the machine that originated the connection.
        orig_port: u32,
    },

    /// Connection to the authentication agent of the client (`"auth-agent@openssh.com"`).
    AuthAgent,

    /// X11 connection forwarded from the server (`"x11"`, RFC 4254, section 6.3.2).
    X11 {
        /// Address of the X11 client that connected to the server.
        orig_host: String,
        /// Port of the X11 client that connected to the server.
        orig_port: u32,
    },
}

impl ChannelKind {
    /// Channel type name used in `SSH_MSG_CHANNEL_OPEN`.
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelKind::AuthAgent => "auth-agent@openssh.com",
            ChannelKind::X11 { .. } => "x11",
        }
    }

    /// True if the channel carries stderr as extended data.
    pub(super) fn uses_ext_data(&self) -> bool {
        matches!(self, ChannelKind::Session)
    }

    /// Writes the type-specific data that follow the common fields of `SSH_MSG_CHANNEL_OPEN`.
    pub(super) fn encode_open(&self, payload: &mut PacketEncode) {
        match self {
            ChannelKind::Session | ChannelKind::AuthAgent => {},
            ChannelKind::DirectTcpip { host, port, orig_host, orig_port } |
            ChannelKind::ForwardedTcpip { host, port, orig_host, orig_port } => {
                payload.put_str(host);
                payload.put_u32(*port);
                payload.put_str(orig_host);
                payload.put_u32(*orig_port);
            },
            ChannelKind::X11 { orig_host, orig_port } => {
                payload.put_str(orig_host);
                payload.put_u32(*orig_port);
            },
        }
    }

    /// Parses the type-specific open data, returns `None` if we don't know the type.
    pub(super) fn decode_open(type_name: &str, payload: &mut PacketDecode) -> Result<Option<ChannelKind>> {
        Ok(Some(match type_name {
            "session" => ChannelKind::Session,
            "direct-tcpip" => ChannelKind::DirectTcpip {
                host: payload.get_string()?,
                port: payload.get_u32()?,
                orig_host: payload.get_string()?,
                orig_port: payload.get_u32()?,
            },
            "forwarded-tcpip" => ChannelKind::ForwardedTcpip {
                host: payload.get_string()?,
                port: payload.get_u32()?,
                orig_host: payload.get_string()?,
                orig_port: payload.get_u32()?,
            },
            "auth-agent@openssh.com" => ChannelKind::AuthAgent,
            "x11" => ChannelKind::X11 {
                orig_host: payload.get_string()?,
                orig_port: payload.get_u32()?,
            },
            _ => return Ok(None),
        }))
    }
}
