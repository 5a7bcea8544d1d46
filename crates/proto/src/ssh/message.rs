//! SSH transport message numbers (RFC 4253 Section 12, RFC 4419 Section 5).
//!
//! # Message Ranges
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service request
//! - **Algorithm Negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key Exchange Method** (30-49): Method-specific messages, numbers reused between methods
//! - **Upper Layers** (50-255): Delivered to the attached service
//!
//! # Example
//!
//! ```rust
//! use kiln_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! ```

/// SSH_MSG_KEX_DH_GEX_REQUEST_OLD, sharing its number with KEXDH_INIT.
pub const KEX_DH_GEX_REQUEST_OLD: u8 = 30;

/// SSH_MSG_KEX_DH_GEX_GROUP, sharing its number with KEXDH_REPLY.
pub const KEX_DH_GEX_GROUP: u8 = 31;

/// SSH message types handled by the transport layer.
///
/// Each message type has a unique numeric identifier used in the binary protocol.
/// Numbers 30 and 31 carry different messages depending on the negotiated key
/// exchange method; the variants here use their fixed-group names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// Diffie-Hellman key exchange init (`e`).
    KexdhInit = 30,
    /// Diffie-Hellman key exchange reply (`K_S, f, signature`).
    KexdhReply = 31,
    /// Group exchange init (`e`).
    KexDhGexInit = 32,
    /// Group exchange reply (`K_S, f, signature`).
    KexDhGexReply = 33,
    /// Group exchange request (`min, n, max`).
    KexDhGexRequest = 34,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            32 => Some(MessageType::KexDhGexInit),
            33 => Some(MessageType::KexDhGexReply),
            34 => Some(MessageType::KexDhGexRequest),
            _ => None,
        }
    }

    /// Returns the message type name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::KexInit.name(), "SSH_MSG_KEXINIT");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::KexDhGexInit => "SSH_MSG_KEX_DH_GEX_INIT",
            MessageType::KexDhGexReply => "SSH_MSG_KEX_DH_GEX_REPLY",
            MessageType::KexDhGexRequest => "SSH_MSG_KEX_DH_GEX_REQUEST",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Whether `msg` lies in the key exchange method range (30-49).
pub fn is_kex_method_message(msg: u8) -> bool {
    (30..=49).contains(&msg)
}

/// Whether `msg` may be sent while a key exchange is in progress (RFC 4253 Section 7.1).
///
/// Generic transport messages other than the service request/accept pair,
/// negotiation messages other than KEXINIT itself, and method messages pass;
/// anything else has to wait for NEWKEYS.
pub fn allowed_during_kex(msg: u8) -> bool {
    match msg {
        5 | 6 => false,
        1..=19 => true,
        20 => false,
        21..=29 => true,
        30..=49 => true,
        _ => false,
    }
}
