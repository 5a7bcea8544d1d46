//! Diffie-Hellman key exchange (RFC 4253 Section 8, RFC 4419, RFC 8268).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 and diffie-hellman-group14-sha1 (RFC 4253)
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - diffie-hellman-group-exchange-sha1 and -sha256 (RFC 4419)
//!
//! One [`KeyExchange`] runs one exchange. It consumes the method messages
//! (numbers 30-34) and tells the transport what to send back; the transport
//! owns packet framing, host-key trust, and key installation.
//!
//! # Phases
//!
//! ```text
//! Idle -> AwaitingGroup (group exchange client only) -> AwaitingReply -> Complete
//! ```
//!
//! A server sits in `Idle` until the first method message arrives; with group
//! exchange it moves to `AwaitingReply` after sending the group.
//!
//! # Security
//!
//! - Peer public values must lie strictly between 1 and p-1
//! - Private exponents equal to 0, 1, p-1 or (p-1)/2 are resampled
//! - Private exponents and the shared secret are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use kiln_platform::mock::MockRandom;
//! use kiln_proto::ssh::config::Role;
//! use kiln_proto::ssh::hostkey::Ed25519HostKey;
//! use kiln_proto::ssh::kex_dh::{ExchangeContext, KexMethod, KexStep, KeyExchange};
//!
//! let context = ExchangeContext {
//!     client_version: "SSH-2.0-client".into(),
//!     server_version: "SSH-2.0-server".into(),
//!     client_kexinit: vec![20; 32],
//!     server_kexinit: vec![20; 40],
//! };
//! let method = KexMethod::Group14Sha256;
//! let host_key = Ed25519HostKey::from_bytes(&[1; 32]).unwrap();
//! let mut rng = MockRandom::new(1);
//!
//! let mut client = KeyExchange::new(method, "ssh-ed25519", Role::Client, context.clone());
//! let mut server = KeyExchange::new(method, "ssh-ed25519", Role::Server, context);
//!
//! let (msg, init) = client.start(&mut rng, (1024, 2048, 8192)).unwrap().unwrap();
//! let server_done = match server.handle(msg, &init, &mut rng, Some(&host_key)).unwrap() {
//!     KexStep::Complete { reply: Some(reply), outcome } => (reply, outcome),
//!     other => panic!("{:?}", other),
//! };
//! let ((msg, reply), server_outcome) = server_done;
//! match client.handle(msg, &reply, &mut rng, None).unwrap() {
//!     KexStep::Complete { outcome, .. } => {
//!         assert_eq!(outcome.exchange_hash, server_outcome.exchange_hash)
//!     }
//!     other => panic!("{:?}", other),
//! }
//! ```

use crate::ssh::config::Role;
use crate::ssh::crypto::HashAlgorithm;
use crate::ssh::disconnect::Disconnect;
use crate::ssh::hostkey::{self, HostKey};
use crate::ssh::message::{MessageType, KEX_DH_GEX_GROUP, KEX_DH_GEX_REQUEST_OLD};
use crate::ssh::wire::{put_biguint, put_string, WireReader};
use bytes::{BufMut, BytesMut};
use kiln_platform::SecureRandom;
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use tracing::debug;
use zeroize::Zeroizing;

/// Upper bound on private exponent size in bytes.
const MAX_EXPONENT_BYTES: usize = 64;

/// Attempts at drawing a usable private exponent before giving up.
const MAX_EXPONENT_ATTEMPTS: usize = 32;

/// A MODP group: prime modulus and generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    p: BigUint,
    g: BigUint,
}

impl DhGroup {
    /// Creates a group from its parameters.
    pub fn new(p: BigUint, g: BigUint) -> Self {
        Self { p, g }
    }

    /// Prime modulus.
    pub fn p(&self) -> &BigUint {
        &self.p
    }

    /// Generator.
    pub fn g(&self) -> &BigUint {
        &self.g
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> u64 {
        self.p.bits()
    }
}

fn group_from_hex(p_hex: &str) -> DhGroup {
    let p = hex::decode(p_hex).expect("Invalid hex");
    DhGroup::new(BigUint::from_bytes_be(&p), BigUint::from(2u32))
}

/// Oakley Group 2, 1024-bit MODP (RFC 2409 Section 6.2).
pub static GROUP1: Lazy<DhGroup> = Lazy::new(|| {
    group_from_hex(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
         FFFFFFFFFFFFFFFF",
    )
});

/// 2048-bit MODP group (RFC 3526 Section 3).
pub static GROUP14: Lazy<DhGroup> = Lazy::new(|| {
    group_from_hex(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
         83655D23DCA3AD961C62F356208552BB9ED529077096966D\
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

/// Groups a group exchange server chooses from, smallest first.
pub fn candidate_groups() -> [&'static DhGroup; 2] {
    [&GROUP1, &GROUP14]
}

/// Picks the candidate group for a group exchange request.
///
/// Within `[min, max]` the group closest to `preferred` wins (the larger one
/// on a tie). If no group fits, the largest group not above `max` is used.
pub fn select_group(min: u32, preferred: u32, max: u32) -> Option<&'static DhGroup> {
    let groups = candidate_groups();
    let distance = |g: &DhGroup| g.bits().abs_diff(u64::from(preferred));

    groups
        .iter()
        .copied()
        .filter(|g| (u64::from(min)..=u64::from(max)).contains(&g.bits()))
        .min_by(|a, b| distance(a).cmp(&distance(b)).then(b.bits().cmp(&a.bits())))
        .or_else(|| {
            groups
                .iter()
                .copied()
                .filter(|g| g.bits() <= u64::from(max))
                .max_by_key(|g| g.bits())
        })
}

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMethod {
    /// diffie-hellman-group-exchange-sha256
    GroupExchangeSha256,
    /// diffie-hellman-group-exchange-sha1
    GroupExchangeSha1,
    /// diffie-hellman-group14-sha256
    Group14Sha256,
    /// diffie-hellman-group14-sha1
    Group14Sha1,
    /// diffie-hellman-group1-sha1
    Group1Sha1,
}

impl KexMethod {
    /// Every supported method, most preferred first.
    pub const ALL: [KexMethod; 5] = [
        KexMethod::GroupExchangeSha256,
        KexMethod::GroupExchangeSha1,
        KexMethod::Group14Sha256,
        KexMethod::Group14Sha1,
        KexMethod::Group1Sha1,
    ];

    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::GroupExchangeSha256 => "diffie-hellman-group-exchange-sha256",
            KexMethod::GroupExchangeSha1 => "diffie-hellman-group-exchange-sha1",
            KexMethod::Group14Sha256 => "diffie-hellman-group14-sha256",
            KexMethod::Group14Sha1 => "diffie-hellman-group14-sha1",
            KexMethod::Group1Sha1 => "diffie-hellman-group1-sha1",
        }
    }

    /// Parses a method name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    /// Hash used for the exchange hash and key derivation.
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            KexMethod::GroupExchangeSha256 | KexMethod::Group14Sha256 => HashAlgorithm::Sha256,
            _ => HashAlgorithm::Sha1,
        }
    }

    /// Whether the group is negotiated (RFC 4419).
    pub fn is_group_exchange(&self) -> bool {
        matches!(
            self,
            KexMethod::GroupExchangeSha256 | KexMethod::GroupExchangeSha1
        )
    }

    /// The fixed group, if this method has one.
    pub fn fixed_group(&self) -> Option<&'static DhGroup> {
        match self {
            KexMethod::Group14Sha256 | KexMethod::Group14Sha1 => Some(&GROUP14),
            KexMethod::Group1Sha1 => Some(&GROUP1),
            _ => None,
        }
    }
}

/// Progress of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexPhase {
    /// Nothing sent or received yet.
    Idle,
    /// Client sent a group request and waits for `(p, g)`.
    AwaitingGroup,
    /// Waiting for the peer's next DH value.
    AwaitingReply,
    /// Shared secret and exchange hash are known.
    Complete,
}

/// Transcript inputs shared by both sides, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeContext {
    /// Client identification line without CR LF.
    pub client_version: String,
    /// Server identification line without CR LF.
    pub server_version: String,
    /// Client KEXINIT payload, starting with the message number.
    pub client_kexinit: Vec<u8>,
    /// Server KEXINIT payload, starting with the message number.
    pub server_kexinit: Vec<u8>,
}

/// Group exchange request fields as they were sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GexRequest {
    /// SSH_MSG_KEX_DH_GEX_REQUEST_OLD: preferred size only.
    Old {
        /// Preferred modulus size.
        n: u32,
    },
    /// SSH_MSG_KEX_DH_GEX_REQUEST.
    Full {
        /// Minimum modulus size.
        min: u32,
        /// Preferred modulus size.
        n: u32,
        /// Maximum modulus size.
        max: u32,
    },
}

/// Result of a finished exchange.
pub struct KexOutcome {
    /// Exchange hash H.
    pub exchange_hash: Vec<u8>,
    /// Shared secret K, big-endian without mpint framing.
    pub shared_secret: Zeroizing<Vec<u8>>,
    /// Server host key blob K_S.
    pub host_key_blob: Vec<u8>,
    /// Hash bound to the method.
    pub hash: HashAlgorithm,
}

impl std::fmt::Debug for KexOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutcome")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .field("shared_secret", &"<redacted>")
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// What the transport must do after feeding a message to [`KeyExchange::handle`].
#[derive(Debug)]
pub enum KexStep {
    /// Send this message and wait for the next one.
    Continue {
        /// Message number.
        msg_type: u8,
        /// Message body after the number.
        payload: Vec<u8>,
    },
    /// The exchange finished; send `reply` (server side) first.
    Complete {
        /// Final message to send, if any.
        reply: Option<(u8, Vec<u8>)>,
        /// Exchange hash and shared secret.
        outcome: KexOutcome,
    },
}

/// Computes the exchange hash H (RFC 4253 Section 8, RFC 4419 Section 3).
///
/// ```text
/// fixed group:    V_C || V_S || I_C || I_S || K_S || e || f || K
/// group exchange: V_C || V_S || I_C || I_S || K_S || min || n || max || p || g || e || f || K
/// ```
///
/// A REQUEST_OLD exchange hashes only `n` in place of `min || n || max`.
pub fn compute_exchange_hash(
    hash: HashAlgorithm,
    context: &ExchangeContext,
    host_key_blob: &[u8],
    gex: Option<(&GexRequest, &DhGroup)>,
    e: &BigUint,
    f: &BigUint,
    k: &BigUint,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, context.client_version.as_bytes());
    put_string(&mut buf, context.server_version.as_bytes());
    put_string(&mut buf, &context.client_kexinit);
    put_string(&mut buf, &context.server_kexinit);
    put_string(&mut buf, host_key_blob);
    if let Some((request, group)) = gex {
        match *request {
            GexRequest::Old { n } => buf.put_u32(n),
            GexRequest::Full { min, n, max } => {
                buf.put_u32(min);
                buf.put_u32(n);
                buf.put_u32(max);
            }
        }
        put_biguint(&mut buf, group.p());
        put_biguint(&mut buf, group.g());
    }
    put_biguint(&mut buf, e);
    put_biguint(&mut buf, f);
    put_biguint(&mut buf, k);

    hash.digest(&[&buf[..]])
}

/// Checks `1 < value < p - 1`.
pub fn is_valid_public_value(value: &BigUint, p: &BigUint) -> bool {
    let one = BigUint::from(1u32);
    value > &one && *value < p - &one
}

/// Draws a private exponent, resampling degenerate values.
fn generate_private(rng: &mut dyn SecureRandom, group: &DhGroup) -> Result<BigUint, Disconnect> {
    let p_minus_one = group.p() - 1u32;
    let half = &p_minus_one >> 1;
    let two = BigUint::from(2u32);
    let len = (((group.bits() as usize).saturating_sub(1)) / 8).clamp(1, MAX_EXPONENT_BYTES);

    let mut bytes = Zeroizing::new(vec![0u8; len]);
    for _ in 0..MAX_EXPONENT_ATTEMPTS {
        rng.fill_bytes(&mut bytes);
        let x = BigUint::from_bytes_be(&bytes);
        if x >= two && x < p_minus_one && x != half {
            return Ok(x);
        }
    }
    Err(Disconnect::key_exchange_failed(
        "could not generate a usable private exponent",
    ))
}

fn read_mpint(reader: &mut WireReader<'_>, what: &str) -> Result<BigUint, Disconnect> {
    reader
        .read_mpint()
        .map_err(|e| Disconnect::protocol_error(format!("bad {}: {}", what, e)))
}

fn mpint_message(value: &BigUint) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_biguint(&mut buf, value);
    buf.to_vec()
}

/// One Diffie-Hellman exchange, client or server side.
pub struct KeyExchange {
    method: KexMethod,
    host_key_algorithm: String,
    role: Role,
    phase: KexPhase,
    context: ExchangeContext,
    group: Option<DhGroup>,
    request: Option<GexRequest>,
    private: Option<Zeroizing<Vec<u8>>>,
    e: Option<BigUint>,
}

impl KeyExchange {
    /// Creates an exchange for the negotiated method and host key algorithm.
    pub fn new(
        method: KexMethod,
        host_key_algorithm: &str,
        role: Role,
        context: ExchangeContext,
    ) -> Self {
        Self {
            method,
            host_key_algorithm: host_key_algorithm.to_string(),
            role,
            phase: KexPhase::Idle,
            context,
            group: method.fixed_group().cloned(),
            request: None,
            private: None,
            e: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> KexPhase {
        self.phase
    }

    /// Negotiated method.
    pub fn method(&self) -> KexMethod {
        self.method
    }

    /// Sends the client's opening message.
    ///
    /// Returns `None` for a server, which waits for the client.
    /// `gex_bits` is the `(min, preferred, max)` request used with group exchange.
    pub fn start(
        &mut self,
        rng: &mut dyn SecureRandom,
        gex_bits: (u32, u32, u32),
    ) -> Result<Option<(u8, Vec<u8>)>, Disconnect> {
        if self.role == Role::Server || self.phase != KexPhase::Idle {
            return Ok(None);
        }

        if self.method.is_group_exchange() {
            let (min, n, max) = gex_bits;
            let mut buf = BytesMut::new();
            buf.put_u32(min);
            buf.put_u32(n);
            buf.put_u32(max);
            self.request = Some(GexRequest::Full { min, n, max });
            self.phase = KexPhase::AwaitingGroup;
            debug!(method = self.method.name(), min, n, max, "requesting DH group");
            return Ok(Some((MessageType::KexDhGexRequest as u8, buf.to_vec())));
        }

        let e = self.generate_e(rng)?;
        self.phase = KexPhase::AwaitingReply;
        Ok(Some((MessageType::KexdhInit as u8, mpint_message(&e))))
    }

    /// Feeds one key exchange method message (30-49).
    ///
    /// `host_key` must be `Some` on the server side.
    ///
    /// # Errors
    ///
    /// PROTOCOL_ERROR for a message that does not fit the current phase or
    /// cannot be parsed; KEY_EXCHANGE_FAILED for out-of-range DH values, a bad
    /// signature, or an unusable group.
    pub fn handle(
        &mut self,
        msg_type: u8,
        payload: &[u8],
        rng: &mut dyn SecureRandom,
        host_key: Option<&dyn HostKey>,
    ) -> Result<KexStep, Disconnect> {
        let gex = self.method.is_group_exchange();
        match (self.role, self.phase, gex, msg_type) {
            (Role::Client, KexPhase::AwaitingGroup, true, KEX_DH_GEX_GROUP) => {
                self.client_group(payload, rng)
            }
            (Role::Client, KexPhase::AwaitingReply, false, 31)
            | (Role::Client, KexPhase::AwaitingReply, true, 33) => self.client_reply(payload),
            (Role::Server, KexPhase::Idle, true, 34)
            | (Role::Server, KexPhase::Idle, true, KEX_DH_GEX_REQUEST_OLD) => {
                self.server_request(msg_type, payload)
            }
            (Role::Server, KexPhase::Idle, false, 30)
            | (Role::Server, KexPhase::AwaitingReply, true, 32) => {
                let host_key = host_key.ok_or_else(|| {
                    Disconnect::key_exchange_failed("no host key for negotiated algorithm")
                })?;
                self.server_init(payload, rng, host_key)
            }
            _ => Err(Disconnect::protocol_error(format!(
                "unexpected key exchange message {} in phase {:?}",
                msg_type, self.phase
            ))),
        }
    }

    fn group(&self) -> Result<&DhGroup, Disconnect> {
        self.group
            .as_ref()
            .ok_or_else(|| Disconnect::key_exchange_failed("no DH group selected"))
    }

    fn generate_e(&mut self, rng: &mut dyn SecureRandom) -> Result<BigUint, Disconnect> {
        let group = self.group()?;
        let x = generate_private(rng, group)?;
        let e = group.g().modpow(&x, group.p());
        self.private = Some(Zeroizing::new(x.to_bytes_be()));
        self.e = Some(e.clone());
        Ok(e)
    }

    fn private(&self) -> Result<BigUint, Disconnect> {
        self.private
            .as_ref()
            .map(|x| BigUint::from_bytes_be(x))
            .ok_or_else(|| Disconnect::key_exchange_failed("no private exponent"))
    }

    fn client_group(
        &mut self,
        payload: &[u8],
        rng: &mut dyn SecureRandom,
    ) -> Result<KexStep, Disconnect> {
        let mut reader = WireReader::new(payload);
        let p = read_mpint(&mut reader, "group modulus")?;
        let g = read_mpint(&mut reader, "group generator")?;

        if let Some(GexRequest::Full { min, max, .. }) = self.request {
            let bits = p.bits();
            if bits < u64::from(min) || bits > u64::from(max) {
                return Err(Disconnect::key_exchange_failed(format!(
                    "server sent {}-bit group outside requested {}..{}",
                    bits, min, max
                )));
            }
        }
        if !is_valid_public_value(&g, &p) {
            return Err(Disconnect::key_exchange_failed("bad group generator"));
        }

        debug!(bits = p.bits(), "received DH group");
        self.group = Some(DhGroup::new(p, g));
        let e = self.generate_e(rng)?;
        self.phase = KexPhase::AwaitingReply;
        Ok(KexStep::Continue {
            msg_type: MessageType::KexDhGexInit as u8,
            payload: mpint_message(&e),
        })
    }

    fn client_reply(&mut self, payload: &[u8]) -> Result<KexStep, Disconnect> {
        let mut reader = WireReader::new(payload);
        let host_key_blob = reader.read_string()?.to_vec();
        let f = read_mpint(&mut reader, "server DH value")?;
        let signature = reader.read_string()?.to_vec();

        let key_type = hostkey::blob_algorithm(&host_key_blob)?;
        if key_type != self.host_key_algorithm {
            return Err(Disconnect::key_exchange_failed(format!(
                "host key type {} does not match negotiated {}",
                key_type, self.host_key_algorithm
            )));
        }

        let group = self.group()?.clone();
        if !is_valid_public_value(&f, group.p()) {
            return Err(Disconnect::key_exchange_failed("server DH value out of range"));
        }

        let x = self.private()?;
        let e = self
            .e
            .clone()
            .ok_or_else(|| Disconnect::key_exchange_failed("no client DH value"))?;
        let k = f.modpow(&x, group.p());

        let exchange_hash = compute_exchange_hash(
            self.method.hash(),
            &self.context,
            &host_key_blob,
            self.request.as_ref().map(|r| (r, &group)),
            &e,
            &f,
            &k,
        );

        match hostkey::verify_signature(&host_key_blob, &signature, &exchange_hash) {
            Ok(true) => {}
            Ok(false) => {
                return Err(Disconnect::key_exchange_failed("bad host key signature"));
            }
            Err(err) => {
                return Err(Disconnect::key_exchange_failed(format!(
                    "unverifiable host key signature: {}",
                    err
                )));
            }
        }

        self.phase = KexPhase::Complete;
        self.private = None;
        Ok(KexStep::Complete {
            reply: None,
            outcome: KexOutcome {
                exchange_hash,
                shared_secret: Zeroizing::new(k.to_bytes_be()),
                host_key_blob,
                hash: self.method.hash(),
            },
        })
    }

    fn server_request(&mut self, msg_type: u8, payload: &[u8]) -> Result<KexStep, Disconnect> {
        let mut reader = WireReader::new(payload);
        let request = if msg_type == KEX_DH_GEX_REQUEST_OLD {
            GexRequest::Old {
                n: reader.read_u32()?,
            }
        } else {
            GexRequest::Full {
                min: reader.read_u32()?,
                n: reader.read_u32()?,
                max: reader.read_u32()?,
            }
        };

        let group = match request {
            GexRequest::Old { n } => select_group(0, n, u32::MAX),
            GexRequest::Full { min, n, max } => {
                if min > n || n > max {
                    return Err(Disconnect::protocol_error(format!(
                        "bad group exchange request {}/{}/{}",
                        min, n, max
                    )));
                }
                select_group(min, n, max)
            }
        }
        .ok_or_else(|| Disconnect::key_exchange_failed("no suitable DH group"))?;

        debug!(?request, bits = group.bits(), "selected DH group");
        let mut buf = BytesMut::new();
        put_biguint(&mut buf, group.p());
        put_biguint(&mut buf, group.g());

        self.request = Some(request);
        self.group = Some(group.clone());
        self.phase = KexPhase::AwaitingReply;
        Ok(KexStep::Continue {
            msg_type: KEX_DH_GEX_GROUP,
            payload: buf.to_vec(),
        })
    }

    fn server_init(
        &mut self,
        payload: &[u8],
        rng: &mut dyn SecureRandom,
        host_key: &dyn HostKey,
    ) -> Result<KexStep, Disconnect> {
        let mut reader = WireReader::new(payload);
        let e = read_mpint(&mut reader, "client DH value")?;

        let group = self.group()?.clone();
        if !is_valid_public_value(&e, group.p()) {
            return Err(Disconnect::key_exchange_failed("client DH value out of range"));
        }

        let y = generate_private(rng, &group)?;
        let f = group.g().modpow(&y, group.p());
        let k = e.modpow(&y, group.p());

        let host_key_blob = host_key.public_key_bytes();
        let exchange_hash = compute_exchange_hash(
            self.method.hash(),
            &self.context,
            &host_key_blob,
            self.request.as_ref().map(|r| (r, &group)),
            &e,
            &f,
            &k,
        );
        let signature = host_key.sign(&exchange_hash).map_err(|err| {
            Disconnect::key_exchange_failed(format!("host key signing failed: {}", err))
        })?;

        let mut buf = BytesMut::new();
        put_string(&mut buf, &host_key_blob);
        put_biguint(&mut buf, &f);
        put_string(&mut buf, &signature);

        let reply_type = if self.method.is_group_exchange() {
            MessageType::KexDhGexReply as u8
        } else {
            MessageType::KexdhReply as u8
        };

        self.phase = KexPhase::Complete;
        Ok(KexStep::Complete {
            reply: Some((reply_type, buf.to_vec())),
            outcome: KexOutcome {
                exchange_hash,
                shared_secret: Zeroizing::new(k.to_bytes_be()),
                host_key_blob,
                hash: self.method.hash(),
            },
        })
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("method", &self.method.name())
            .field("role", &self.role)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}
