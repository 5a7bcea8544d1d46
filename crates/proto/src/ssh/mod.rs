//! SSH transport layer implementation (RFC 4253).
//!
//! # Architecture
//!
//! The transport is layered bottom-up:
//!
//! 1. **Wire encoding** ([`wire`], [`message`]) - SSH data types and message numbers
//! 2. **Packet Layer** ([`packet`]) - Binary packet protocol (RFC 4253 Section 6)
//! 3. **Protection** ([`crypto`], [`compression`]) - Ciphers, MACs, key derivation, zlib
//! 4. **Key exchange** ([`kex`], [`kex_dh`], [`hostkey`]) - Negotiation, Diffie-Hellman, host keys
//! 5. **State machine** ([`transport`]) - Version exchange, KEXINIT/NEWKEYS, rekeying, dispatch
//! 6. **Services** ([`service`]) - Upper-layer protocols bound by name
//! 7. **Driver** ([`io`]) - Runs a transport over a tokio stream
//!
//! # Security Considerations
//!
//! - **Input Validation**: Packet lengths are checked against a configured
//!   maximum before any buffering
//! - **Constant-Time Operations**: MAC verification uses `subtle`
//! - **Memory Safety**: Secrets are zeroized on drop using [`zeroize`]
//! - **Key Exchange**: DH public values are range checked and degenerate private
//!   exponents are resampled
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust
//! use kiln_proto::ssh::{SshTransport, State, TransportConfig};
//! use kiln_proto::ssh::transport::LoggingHandler;
//! use std::sync::Arc;
//!
//! let mut transport = SshTransport::client(
//!     Arc::new(TransportConfig::default()),
//!     Box::new(LoggingHandler),
//! );
//! transport.connection_made(None, None);
//! transport.data_received(b"SSH-2.0-OpenSSH_9.6\r\n");
//! assert_eq!(transport.state(), State::ExpectKexInit);
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4419](https://datatracker.ietf.org/doc/html/rfc4419) - Diffie-Hellman Group Exchange
//! - [RFC 8268](https://datatracker.ietf.org/doc/html/rfc8268) - More MODP Diffie-Hellman Groups

pub mod compression;
pub mod config;
pub mod crypto;
pub mod disconnect;
pub mod hostkey;
pub mod io;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod service;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use config::{Role, TransportConfig};
pub use crypto::{CipherAlgorithm, CipherSuite, DerivedKeySet, HashAlgorithm, MacAlgorithm};
pub use disconnect::{Disconnect, DisconnectCause, DisconnectReason};
pub use hostkey::{Ed25519HostKey, HostKey, HostKeyAlgorithm, SshRsaHostKey};
pub use kex::{KexInit, NegotiatedAlgorithms, NewKeys};
pub use kex_dh::{KexMethod, KeyExchange};
pub use message::MessageType;
pub use packet::{DecodeError, Packet, PacketCodec};
pub use service::{Service, ServiceRegistry, ServiceTransport};
pub use transport::{Direction, SshTransport, State, TransportHandler};
pub use version::Version;
