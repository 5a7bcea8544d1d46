//! SSH binary transport protocol for the Kiln ecosystem.
//!
//! This crate implements the transport layer of SSH version 2: identification
//! exchange, algorithm negotiation, Diffie-Hellman key exchange, the binary
//! packet protocol with encryption, MAC and compression, rekeying, and the
//! hand-off to an upper-layer service.
//!
//! # Features
//!
//! - `ssh` (default) - SSH transport support (client + server)
//!
//! # Example
//!
//! ```rust
//! use kiln_platform::mock::MockRandom;
//! use kiln_proto::ssh::PacketCodec;
//! use bytes::BytesMut;
//!
//! let mut rng = MockRandom::new(1);
//! let mut sender = PacketCodec::new(35_000);
//! let mut receiver = PacketCodec::new(35_000);
//!
//! let wire = sender.encode(94, b"channel data", &mut rng).unwrap();
//! let mut buf = BytesMut::from(&wire[..]);
//! let packet = receiver.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(packet.msg_type(), 94);
//! assert_eq!(packet.payload(), b"channel data");
//! ```
//!
//! # Security
//!
//! - All cryptographic primitives come from vetted crates (`ring`, RustCrypto, `dalek`)
//! - MACs are compared in constant time
//! - Key material is zeroized on drop with `zeroize`
//! - Decoding is fuzzed (`fuzz/`)
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4419](https://datatracker.ietf.org/doc/html/rfc4419) - Diffie-Hellman Group Exchange
//! - [RFC 4344](https://datatracker.ietf.org/doc/html/rfc4344) - SSH Transport Layer Encryption Modes

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
