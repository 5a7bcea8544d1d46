//! Transport configuration.
//!
//! A [`TransportConfig`] is built once, validated, and shared read-only
//! between connections (typically through an `Arc`). Host keys and the
//! service registry are per-listener state and are handed to the transport
//! constructor instead.
//!
//! # Example
//!
//! ```rust
//! use kiln_proto::ssh::config::TransportConfig;
//!
//! let config = TransportConfig::default()
//!     .with_ciphers(&["aes128-ctr"])
//!     .with_macs(&["hmac-sha1"]);
//! assert!(config.validate().is_ok());
//! ```

use crate::ssh::compression;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey;
use crate::ssh::kex_dh::KexMethod;
use crate::ssh::version::Version;
use kiln_platform::{KilnError, KilnResult};

/// Smallest packet length limit an implementation must accept (RFC 4253 Section 6.1).
pub const MIN_MAX_PACKET_LEN: usize = 35_000;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the connection and requests services.
    Client,
    /// Accepts the connection, holds host keys, offers services.
    Server,
}

impl Role {
    /// Whether this is the client role.
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Transport layer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Software version sent in our identification line.
    pub software_version: String,

    /// Optional comment appended to the identification line.
    pub comments: Option<String>,

    /// Peer protocol versions we accept.
    pub supported_versions: Vec<String>,

    /// Key exchange methods, most preferred first.
    pub kex_algorithms: Vec<String>,

    /// Host key algorithms, most preferred first.
    ///
    /// A server only advertises the entries it holds a key for.
    pub host_key_algorithms: Vec<String>,

    /// Ciphers, most preferred first (both directions).
    pub ciphers: Vec<String>,

    /// MACs, most preferred first (both directions).
    pub macs: Vec<String>,

    /// Compression algorithms, most preferred first (both directions).
    pub compressions: Vec<String>,

    /// Group exchange request: minimum modulus size in bits.
    pub gex_min_bits: u32,

    /// Group exchange request: preferred modulus size in bits.
    pub gex_preferred_bits: u32,

    /// Group exchange request: maximum modulus size in bits.
    pub gex_max_bits: u32,

    /// Largest `packet_length` accepted from the peer.
    pub max_packet_len: usize,

    /// Bytes sent and received before an automatic rekey (default: 1 GB, 0 disables).
    pub rekey_bytes_limit: u64,

    /// Seconds before an automatic rekey (default: 3600 = 1 hour, 0 disables).
    pub rekey_time_limit: u64,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            software_version: format!("Kiln_{}", env!("CARGO_PKG_VERSION")),
            comments: None,
            supported_versions: owned(&["2.0", "1.99"]),
            kex_algorithms: owned(&[
                "diffie-hellman-group-exchange-sha256",
                "diffie-hellman-group-exchange-sha1",
                "diffie-hellman-group14-sha256",
                "diffie-hellman-group14-sha1",
            ]),
            host_key_algorithms: owned(&["ssh-ed25519", "ssh-rsa"]),
            ciphers: owned(&[
                "aes256-ctr",
                "aes192-ctr",
                "aes128-ctr",
                "aes256-cbc",
                "aes192-cbc",
                "aes128-cbc",
            ]),
            macs: owned(&["hmac-sha2-512", "hmac-sha2-256", "hmac-sha1"]),
            compressions: owned(&["none", "zlib"]),
            gex_min_bits: 1024,
            gex_preferred_bits: 2048,
            gex_max_bits: 8192,
            max_packet_len: 256 * 1024,
            rekey_bytes_limit: 1_000_000_000,
            rekey_time_limit: 3600,
        }
    }
}

impl TransportConfig {
    /// Sets the software version of our identification line.
    pub fn with_software_version(mut self, software: &str) -> Self {
        self.software_version = software.to_string();
        self
    }

    /// Sets the identification line comment.
    pub fn with_comments(mut self, comments: &str) -> Self {
        self.comments = Some(comments.to_string());
        self
    }

    /// Sets the accepted peer protocol versions.
    pub fn with_supported_versions(mut self, versions: &[&str]) -> Self {
        self.supported_versions = owned(versions);
        self
    }

    /// Sets the key exchange preference list.
    pub fn with_kex_algorithms(mut self, names: &[&str]) -> Self {
        self.kex_algorithms = owned(names);
        self
    }

    /// Sets the host key preference list.
    pub fn with_host_key_algorithms(mut self, names: &[&str]) -> Self {
        self.host_key_algorithms = owned(names);
        self
    }

    /// Sets the cipher preference list.
    pub fn with_ciphers(mut self, names: &[&str]) -> Self {
        self.ciphers = owned(names);
        self
    }

    /// Sets the MAC preference list.
    pub fn with_macs(mut self, names: &[&str]) -> Self {
        self.macs = owned(names);
        self
    }

    /// Sets the compression preference list.
    pub fn with_compressions(mut self, names: &[&str]) -> Self {
        self.compressions = owned(names);
        self
    }

    /// Sets the group exchange size request.
    pub fn with_group_exchange_bits(mut self, min: u32, preferred: u32, max: u32) -> Self {
        self.gex_min_bits = min;
        self.gex_preferred_bits = preferred;
        self.gex_max_bits = max;
        self
    }

    /// Sets the largest accepted packet length.
    pub fn with_max_packet_len(mut self, len: usize) -> Self {
        self.max_packet_len = len;
        self
    }

    /// Sets the automatic rekey limits; 0 disables a limit.
    pub fn with_rekey_limits(mut self, bytes: u64, seconds: u64) -> Self {
        self.rekey_bytes_limit = bytes;
        self.rekey_time_limit = seconds;
        self
    }

    /// Our identification line.
    pub fn version(&self) -> Version {
        Version::new(&self.software_version, self.comments.as_deref())
    }

    /// Checks the configuration for mistakes that would only surface mid-handshake.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Config`] if:
    /// - A required algorithm list is empty
    /// - An algorithm name is not implemented
    /// - The group exchange sizes are not ordered `min <= preferred <= max`
    /// - `max_packet_len` is below 35000
    /// - The identification line would be invalid
    pub fn validate(&self) -> KilnResult<()> {
        check_list("kex", &self.kex_algorithms, |n| KexMethod::from_name(n).is_some())?;
        check_list("host key", &self.host_key_algorithms, hostkey::is_supported_algorithm)?;
        check_list("cipher", &self.ciphers, |n| CipherAlgorithm::from_name(n).is_some())?;
        check_list("MAC", &self.macs, |n| MacAlgorithm::from_name(n).is_some())?;
        check_list("compression", &self.compressions, compression::is_supported)?;

        if self.supported_versions.is_empty() {
            return Err(KilnError::Config(
                "No supported protocol versions configured".to_string(),
            ));
        }

        if !(self.gex_min_bits <= self.gex_preferred_bits
            && self.gex_preferred_bits <= self.gex_max_bits)
        {
            return Err(KilnError::Config(format!(
                "Group exchange sizes out of order: min {} preferred {} max {}",
                self.gex_min_bits, self.gex_preferred_bits, self.gex_max_bits
            )));
        }

        if self.max_packet_len < MIN_MAX_PACKET_LEN {
            return Err(KilnError::Config(format!(
                "max_packet_len {} below required minimum {}",
                self.max_packet_len, MIN_MAX_PACKET_LEN
            )));
        }

        if self.software_version.is_empty()
            || self
                .software_version
                .contains(|c: char| matches!(c, ' ' | '-') || c.is_control())
        {
            return Err(KilnError::Config(format!(
                "Invalid software version: '{}'",
                self.software_version
            )));
        }

        Version::parse(&self.version().to_string())
            .map_err(|e| KilnError::Config(format!("Invalid identification line: {}", e)))?;

        Ok(())
    }
}

fn check_list(category: &str, names: &[String], known: impl Fn(&str) -> bool) -> KilnResult<()> {
    if names.is_empty() {
        return Err(KilnError::Config(format!(
            "Empty {} algorithm list",
            category
        )));
    }
    match names.iter().find(|n| !known(n)) {
        Some(unknown) => Err(KilnError::Config(format!(
            "Unsupported {} algorithm: {}",
            category, unknown
        ))),
        None => Ok(()),
    }
}
