//! Disconnect reasons and the error value that carries them (RFC 4253 Section 11.1).
//!
//! Handlers inside the transport return `Result<_, Disconnect>`. An `Err`
//! means the peer broke the protocol (or a negotiated check failed) and the
//! connection has to be torn down with the carried reason code. Misuse by the
//! local caller is reported through [`KilnError::InvalidState`] instead.

use kiln_platform::KilnError;
use std::fmt;

/// Reason code sent in SSH_MSG_DISCONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT (1)
    HostNotAllowedToConnect,
    /// SSH_DISCONNECT_PROTOCOL_ERROR (2)
    ProtocolError,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED (3)
    KeyExchangeFailed,
    /// SSH_DISCONNECT_RESERVED (4)
    Reserved,
    /// SSH_DISCONNECT_MAC_ERROR (5)
    MacError,
    /// SSH_DISCONNECT_COMPRESSION_ERROR (6)
    CompressionError,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE (7)
    ServiceNotAvailable,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED (8)
    ProtocolVersionNotSupported,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE (9)
    HostKeyNotVerifiable,
    /// SSH_DISCONNECT_CONNECTION_LOST (10)
    ConnectionLost,
    /// SSH_DISCONNECT_BY_APPLICATION (11)
    ByApplication,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS (12)
    TooManyConnections,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER (13)
    AuthCancelledByUser,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE (14)
    NoMoreAuthMethodsAvailable,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME (15)
    IllegalUserName,
    /// A code outside the RFC 4253 table.
    Other(u32),
}

impl DisconnectReason {
    /// Returns the numeric reason code.
    pub fn code(&self) -> u32 {
        match self {
            DisconnectReason::HostNotAllowedToConnect => 1,
            DisconnectReason::ProtocolError => 2,
            DisconnectReason::KeyExchangeFailed => 3,
            DisconnectReason::Reserved => 4,
            DisconnectReason::MacError => 5,
            DisconnectReason::CompressionError => 6,
            DisconnectReason::ServiceNotAvailable => 7,
            DisconnectReason::ProtocolVersionNotSupported => 8,
            DisconnectReason::HostKeyNotVerifiable => 9,
            DisconnectReason::ConnectionLost => 10,
            DisconnectReason::ByApplication => 11,
            DisconnectReason::TooManyConnections => 12,
            DisconnectReason::AuthCancelledByUser => 13,
            DisconnectReason::NoMoreAuthMethodsAvailable => 14,
            DisconnectReason::IllegalUserName => 15,
            DisconnectReason::Other(code) => *code,
        }
    }

    /// Maps a received reason code.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_proto::ssh::disconnect::DisconnectReason;
    ///
    /// assert_eq!(DisconnectReason::from_code(5), DisconnectReason::MacError);
    /// assert_eq!(DisconnectReason::from_code(99), DisconnectReason::Other(99));
    /// ```
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => DisconnectReason::HostNotAllowedToConnect,
            2 => DisconnectReason::ProtocolError,
            3 => DisconnectReason::KeyExchangeFailed,
            4 => DisconnectReason::Reserved,
            5 => DisconnectReason::MacError,
            6 => DisconnectReason::CompressionError,
            7 => DisconnectReason::ServiceNotAvailable,
            8 => DisconnectReason::ProtocolVersionNotSupported,
            9 => DisconnectReason::HostKeyNotVerifiable,
            10 => DisconnectReason::ConnectionLost,
            11 => DisconnectReason::ByApplication,
            12 => DisconnectReason::TooManyConnections,
            13 => DisconnectReason::AuthCancelledByUser,
            14 => DisconnectReason::NoMoreAuthMethodsAvailable,
            15 => DisconnectReason::IllegalUserName,
            other => DisconnectReason::Other(other),
        }
    }

    /// Returns a short human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::HostNotAllowedToConnect => "host not allowed to connect",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::KeyExchangeFailed => "key exchange failed",
            DisconnectReason::Reserved => "reserved",
            DisconnectReason::MacError => "MAC error",
            DisconnectReason::CompressionError => "compression error",
            DisconnectReason::ServiceNotAvailable => "service not available",
            DisconnectReason::ProtocolVersionNotSupported => "protocol version not supported",
            DisconnectReason::HostKeyNotVerifiable => "host key not verifiable",
            DisconnectReason::ConnectionLost => "connection lost",
            DisconnectReason::ByApplication => "disconnected by application",
            DisconnectReason::TooManyConnections => "too many connections",
            DisconnectReason::AuthCancelledByUser => "auth cancelled by user",
            DisconnectReason::NoMoreAuthMethodsAvailable => "no more auth methods available",
            DisconnectReason::IllegalUserName => "illegal user name",
            DisconnectReason::Other(_) => "unknown reason",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// A fatal protocol failure together with the reason to report to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code for SSH_MSG_DISCONNECT.
    pub reason: DisconnectReason,
    /// Free-form description sent alongside the code.
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect with an explicit reason.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }

    /// SSH_DISCONNECT_PROTOCOL_ERROR.
    pub fn protocol_error(description: impl Into<String>) -> Self {
        Self::new(DisconnectReason::ProtocolError, description)
    }

    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED.
    pub fn key_exchange_failed(description: impl Into<String>) -> Self {
        Self::new(DisconnectReason::KeyExchangeFailed, description)
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.description)
    }
}

impl std::error::Error for Disconnect {}

/// Malformed message contents are a protocol error.
impl From<KilnError> for Disconnect {
    fn from(err: KilnError) -> Self {
        match err {
            KilnError::Protocol(msg) => Disconnect::protocol_error(msg),
            other => Disconnect::protocol_error(other.to_string()),
        }
    }
}

/// Why a connection ended, as reported to the attached service and handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// We sent SSH_MSG_DISCONNECT.
    Local {
        /// Reason we sent.
        reason: DisconnectReason,
        /// Description we sent.
        description: String,
    },
    /// The peer sent SSH_MSG_DISCONNECT.
    Remote {
        /// Reason the peer sent.
        reason: DisconnectReason,
        /// Description the peer sent.
        description: String,
    },
    /// The byte stream closed or failed underneath us.
    Transport(String),
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::Local {
                reason,
                description,
            } => write!(f, "disconnected locally, {}: {}", reason, description),
            DisconnectCause::Remote {
                reason,
                description,
            } => write!(f, "disconnected by peer, {}: {}", reason, description),
            DisconnectCause::Transport(msg) => write!(f, "transport closed: {}", msg),
        }
    }
}
