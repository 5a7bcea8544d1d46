//! SSH algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_NEWKEYS message
//! - Per-category algorithm selection (first client preference the server supports)
//! - Validation of a speculative "guessed" first key exchange packet
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first match wins)
//! 3. Key exchange (see [`kex_dh`](crate::ssh::kex_dh))
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys at its NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use kiln_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new(
//!     [0u8; 16],
//!     &["diffie-hellman-group14-sha1"],
//!     &["ssh-rsa"],
//!     &["aes128-ctr"],
//!     &["hmac-sha1"],
//!     &["none"],
//! );
//! let bytes = kexinit.to_bytes();
//! assert_eq!(bytes[0], 20);
//! assert_eq!(KexInit::from_bytes(&bytes).unwrap(), kexinit);
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::config::{Role, TransportConfig};
use crate::ssh::disconnect::Disconnect;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{put_bool, put_name_list, WireReader};
use bytes::{BufMut, BytesMut};
use kiln_platform::{KilnError, KilnResult, SecureRandom};

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_algorithms_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_algorithms_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_algorithms_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_algorithms_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_algorithms_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_algorithms_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl KexInit {
    /// Creates a KEXINIT offering the same lists in both directions.
    pub fn new(
        cookie: [u8; 16],
        kex: &[&str],
        host_keys: &[&str],
        ciphers: &[&str],
        macs: &[&str],
        compressions: &[&str],
    ) -> Self {
        Self {
            cookie,
            kex_algorithms: owned(kex),
            server_host_key_algorithms: owned(host_keys),
            encryption_algorithms_client_to_server: owned(ciphers),
            encryption_algorithms_server_to_client: owned(ciphers),
            mac_algorithms_client_to_server: owned(macs),
            mac_algorithms_server_to_client: owned(macs),
            compression_algorithms_client_to_server: owned(compressions),
            compression_algorithms_server_to_client: owned(compressions),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Builds our KEXINIT from the configuration with a fresh random cookie.
    ///
    /// `host_key_algorithms` is passed separately because a server only
    /// advertises algorithms it holds a key for.
    pub fn from_config(
        config: &TransportConfig,
        host_key_algorithms: Vec<String>,
        rng: &mut dyn SecureRandom,
    ) -> Self {
        let mut cookie = [0u8; 16];
        rng.fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: config.kex_algorithms.clone(),
            server_host_key_algorithms: host_key_algorithms,
            encryption_algorithms_client_to_server: config.ciphers.clone(),
            encryption_algorithms_server_to_client: config.ciphers.clone(),
            mac_algorithms_client_to_server: config.macs.clone(),
            mac_algorithms_server_to_client: config.macs.clone(),
            compression_algorithms_client_to_server: config.compressions.clone(),
            compression_algorithms_server_to_client: config.compressions.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Sets the `first_kex_packet_follows` flag.
    pub fn with_first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the client-to-server encryption algorithms.
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the server-to-client encryption algorithms.
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the client-to-server MAC algorithms.
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the server-to-client MAC algorithms.
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the client-to-server compression algorithms.
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the server-to-client compression algorithms.
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns the first_kex_packet_follows flag.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message, including the leading message number.
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    ///
    /// These are the exact bytes hashed into the exchange hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        put_name_list(&mut buf, &self.kex_algorithms);
        put_name_list(&mut buf, &self.server_host_key_algorithms);
        put_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        put_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        put_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        put_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        put_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        put_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        put_name_list(&mut buf, &self.languages_client_to_server);
        put_name_list(&mut buf, &self.languages_server_to_client);

        put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message, including its leading message number.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Protocol`] if:
    /// - Message type is not SSH_MSG_KEXINIT (20)
    /// - Any field is truncated
    /// - A name-list is not valid UTF-8
    pub fn from_bytes(data: &[u8]) -> KilnResult<Self> {
        let mut reader = WireReader::new(data);

        let msg_type = reader.read_u8()?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(KilnError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg_type
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(reader.read_bytes(16)?);

        let kex_algorithms = reader.read_name_list()?;
        let server_host_key_algorithms = reader.read_name_list()?;
        let encryption_algorithms_client_to_server = reader.read_name_list()?;
        let encryption_algorithms_server_to_client = reader.read_name_list()?;
        let mac_algorithms_client_to_server = reader.read_name_list()?;
        let mac_algorithms_server_to_client = reader.read_name_list()?;
        let compression_algorithms_client_to_server = reader.read_name_list()?;
        let compression_algorithms_server_to_client = reader.read_name_list()?;
        let languages_client_to_server = reader.read_name_list()?;
        let languages_server_to_client = reader.read_name_list()?;
        let first_kex_packet_follows = reader.read_bool()?;
        // reserved
        reader.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// After a side sends NEWKEYS, everything it sends uses the new keys; after
/// it receives NEWKEYS, everything it receives does. Sequence numbers are not
/// reset.
///
/// # Wire Format
///
/// ```text
/// byte    SSH_MSG_NEWKEYS (21)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Protocol`] if:
    /// - Message is empty
    /// - Message type is not SSH_MSG_NEWKEYS (21)
    /// - Anything follows the message number
    pub fn from_bytes(data: &[u8]) -> KilnResult<Self> {
        match data {
            [] => Err(KilnError::Protocol("NEWKEYS message is empty".to_string())),
            [21] => Ok(Self),
            [21, rest @ ..] => Err(KilnError::Protocol(format!(
                "NEWKEYS carries {} unexpected payload bytes",
                rest.len()
            ))),
            [other, ..] => Err(KilnError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                other
            ))),
        }
    }
}

/// Algorithms chosen for one key exchange, from our point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method.
    pub kex: String,
    /// Server host key algorithm.
    pub host_key: String,
    /// Cipher for packets we send.
    pub outgoing_cipher: String,
    /// Cipher for packets we receive.
    pub incoming_cipher: String,
    /// MAC for packets we send.
    pub outgoing_mac: String,
    /// MAC for packets we receive.
    pub incoming_mac: String,
    /// Compression for packets we send.
    pub outgoing_compression: String,
    /// Compression for packets we receive.
    pub incoming_compression: String,
    /// Language for packets we send, if both sides named one.
    pub outgoing_language: Option<String>,
    /// Language for packets we receive, if both sides named one.
    pub incoming_language: Option<String>,
}

/// Selects the first algorithm in `client_list` that `server_list` contains.
///
/// # Example
///
/// ```rust
/// use kiln_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["a".to_string(), "b".to_string(), "c".to_string()];
/// let server = vec!["c".to_string(), "b".to_string()];
///
/// assert_eq!(negotiate_algorithm(&client, &server).as_deref(), Some("b"));
/// assert_eq!(negotiate_algorithm(&client, &["d".to_string()]), None);
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> Option<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
}

fn required(category: &str, client_list: &[String], server_list: &[String]) -> Result<String, Disconnect> {
    negotiate_algorithm(client_list, server_list).ok_or_else(|| {
        Disconnect::key_exchange_failed(format!(
            "couldn't match all kex parts: no common {} algorithm",
            category
        ))
    })
}

/// Runs negotiation for every category.
///
/// The client's lists take priority. Languages are optional; every other
/// category must match.
///
/// # Errors
///
/// Returns a KEY_EXCHANGE_FAILED [`Disconnect`] naming the first category
/// without a common algorithm.
pub fn negotiate(role: Role, ours: &KexInit, theirs: &KexInit) -> Result<NegotiatedAlgorithms, Disconnect> {
    let (client, server) = match role {
        Role::Client => (ours, theirs),
        Role::Server => (theirs, ours),
    };

    let kex = required("key exchange", &client.kex_algorithms, &server.kex_algorithms)?;
    let host_key = required(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;
    let cipher_c2s = required(
        "client to server cipher",
        &client.encryption_algorithms_client_to_server,
        &server.encryption_algorithms_client_to_server,
    )?;
    let cipher_s2c = required(
        "server to client cipher",
        &client.encryption_algorithms_server_to_client,
        &server.encryption_algorithms_server_to_client,
    )?;
    let mac_c2s = required(
        "client to server MAC",
        &client.mac_algorithms_client_to_server,
        &server.mac_algorithms_client_to_server,
    )?;
    let mac_s2c = required(
        "server to client MAC",
        &client.mac_algorithms_server_to_client,
        &server.mac_algorithms_server_to_client,
    )?;
    let compression_c2s = required(
        "client to server compression",
        &client.compression_algorithms_client_to_server,
        &server.compression_algorithms_client_to_server,
    )?;
    let compression_s2c = required(
        "server to client compression",
        &client.compression_algorithms_server_to_client,
        &server.compression_algorithms_server_to_client,
    )?;
    let language_c2s = negotiate_algorithm(
        &client.languages_client_to_server,
        &server.languages_client_to_server,
    );
    let language_s2c = negotiate_algorithm(
        &client.languages_server_to_client,
        &server.languages_server_to_client,
    );

    Ok(match role {
        Role::Client => NegotiatedAlgorithms {
            kex,
            host_key,
            outgoing_cipher: cipher_c2s,
            incoming_cipher: cipher_s2c,
            outgoing_mac: mac_c2s,
            incoming_mac: mac_s2c,
            outgoing_compression: compression_c2s,
            incoming_compression: compression_s2c,
            outgoing_language: language_c2s,
            incoming_language: language_s2c,
        },
        Role::Server => NegotiatedAlgorithms {
            kex,
            host_key,
            outgoing_cipher: cipher_s2c,
            incoming_cipher: cipher_c2s,
            outgoing_mac: mac_s2c,
            incoming_mac: mac_c2s,
            outgoing_compression: compression_s2c,
            incoming_compression: compression_c2s,
            outgoing_language: language_s2c,
            incoming_language: language_c2s,
        },
    })
}

/// Whether a speculative first key exchange packet matches the negotiation.
///
/// The guess is right only when both sides list the same key exchange
/// method first and the same host key algorithm first (RFC 4253 Section 7).
pub fn is_guessed_packet_valid(
    local_first_kex: &str,
    local_first_host_key: &str,
    remote_first_kex: &str,
    remote_first_host_key: &str,
) -> bool {
    local_first_kex == remote_first_kex && local_first_host_key == remote_first_host_key
}

/// Whether the peer announced a guessed packet that must be discarded.
pub fn should_ignore_guess(ours: &KexInit, theirs: &KexInit) -> bool {
    fn first(list: &[String]) -> &str {
        list.first().map(String::as_str).unwrap_or("")
    }
    theirs.first_kex_packet_follows
        && !is_guessed_packet_valid(
            first(&ours.kex_algorithms),
            first(&ours.server_host_key_algorithms),
            first(&theirs.kex_algorithms),
            first(&theirs.server_host_key_algorithms),
        )
}
