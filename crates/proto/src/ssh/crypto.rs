//! SSH cryptographic operations.
//!
//! This module implements the symmetric half of the transport:
//! - AES-128/192/256 in CTR mode (RFC 4344) and CBC mode (RFC 4253)
//! - HMAC-SHA1, HMAC-SHA2-256, HMAC-SHA2-512 (RFC 4253, RFC 6668)
//! - The `none` cipher and MAC used before the first NEWKEYS
//! - Key derivation from the shared secret (RFC 4253 Section 7.2)
//!
//! Algorithm properties live in immutable `match` tables on
//! [`CipherAlgorithm`] and [`MacAlgorithm`]; an unknown name is an error, never
//! a silent default.
//!
//! A [`CipherSuite`] pairs one outgoing and one incoming direction. After
//! [`CipherSuite::set_keys`] it splits into a [`Sealer`] and an [`Opener`] so
//! each direction can be switched at its own NEWKEYS.
//!
//! # Security
//!
//! - **MAC verification** - Constant-time comparison with `subtle`
//! - **Key material** - Derived keys are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use kiln_proto::ssh::crypto::{CipherSuite, HashAlgorithm};
//! use kiln_proto::ssh::config::Role;
//!
//! let client = CipherSuite::new("aes128-ctr", "aes128-ctr", "hmac-sha1", "hmac-sha1").unwrap();
//! let keys = client.derive_keys(HashAlgorithm::Sha1, Role::Client, &[7; 128], &[1; 20], &[1; 20]);
//! assert_eq!(keys.key_out.len(), 16);
//! assert_eq!(keys.mac_out.len(), 20);
//! ```

use crate::ssh::config::Role;
use crate::ssh::wire::encode_mpint;
use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use kiln_platform::{KilnError, KilnResult};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Block size assumed for padding when no cipher is active.
pub const NONE_BLOCK_SIZE: usize = 8;

/// Hash function bound to a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (20-byte output)
    Sha1,
    /// SHA-256 (32-byte output)
    Sha256,
}

impl HashAlgorithm {
    /// Output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption
    None,
    /// AES-128-CTR stream cipher
    Aes128Ctr,
    /// AES-192-CTR stream cipher
    Aes192Ctr,
    /// AES-256-CTR stream cipher
    Aes256Ctr,
    /// AES-128-CBC block cipher
    Aes128Cbc,
    /// AES-192-CBC block cipher
    Aes192Cbc,
    /// AES-256-CBC block cipher
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Every supported cipher, strongest first.
    pub const ALL: [CipherAlgorithm; 7] = [
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes192Ctr,
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes256Cbc,
        CipherAlgorithm::Aes192Cbc,
        CipherAlgorithm::Aes128Cbc,
        CipherAlgorithm::None,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes192Cbc => "aes192-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Ctr | CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            _ => 16,
        }
    }

    /// Returns the block size used for padding and length decryption.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => NONE_BLOCK_SIZE,
            _ => 16,
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }

    /// Like [`from_name`](Self::from_name), but an unknown name is an error.
    pub fn lookup(name: &str) -> KilnResult<Self> {
        Self::from_name(name)
            .ok_or_else(|| KilnError::Config(format!("Unknown cipher algorithm: {}", name)))
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// No integrity protection
    None,
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Every supported MAC, strongest first.
    pub const ALL: [MacAlgorithm; 4] = [
        MacAlgorithm::HmacSha512,
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha1,
        MacAlgorithm::None,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::None => "none",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes (equal to the digest size).
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::None => 0,
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }

    /// Like [`from_name`](Self::from_name), but an unknown name is an error.
    pub fn lookup(name: &str) -> KilnResult<Self> {
        Self::from_name(name)
            .ok_or_else(|| KilnError::Config(format!("Unknown MAC algorithm: {}", name)))
    }
}

/// Per-direction key material derived after a key exchange.
///
/// "Out" is the direction we send in, "in" the direction we receive in; the
/// mapping onto the RFC's client-to-server and server-to-client letters
/// depends on our [`Role`].
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeySet {
    /// Initial IV for outgoing packets.
    pub iv_out: Vec<u8>,
    /// Encryption key for outgoing packets.
    pub key_out: Vec<u8>,
    /// Initial IV for incoming packets.
    pub iv_in: Vec<u8>,
    /// Decryption key for incoming packets.
    pub key_in: Vec<u8>,
    /// MAC key for incoming packets.
    pub mac_in: Vec<u8>,
    /// MAC key for outgoing packets.
    pub mac_out: Vec<u8>,
}

impl std::fmt::Debug for DerivedKeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeySet")
            .field("key_out_len", &self.key_out.len())
            .field("key_in_len", &self.key_in.len())
            .field("keys", &"<redacted>")
            .finish()
    }
}

/// Derives one SSH session key (RFC 4253 Section 7.2).
///
/// # Key Derivation
///
/// ```text
/// K1 = HASH(K || H || key_type || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
///
/// `K` is hashed in mpint encoding. Tags:
///
/// ```text
/// 'A' initial IV client to server     'B' initial IV server to client
/// 'C' encryption key client to server 'D' encryption key server to client
/// 'E' integrity key client to server  'F' integrity key server to client
/// ```
///
/// # Example
///
/// ```rust
/// use kiln_proto::ssh::crypto::{derive_key, HashAlgorithm};
///
/// let key = derive_key(HashAlgorithm::Sha256, &[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 48);
/// assert_eq!(key.len(), 48);
/// ```
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    if key_length == 0 {
        return Vec::new();
    }

    let k_mpint = encode_mpint(shared_secret);
    let mut key = hash.digest(&[&k_mpint, exchange_hash, &[key_type], session_id]);

    while key.len() < key_length {
        let block = hash.digest(&[&k_mpint, exchange_hash, &key]);
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

enum CipherState {
    None,
    Aes128Ctr(Box<Aes128Ctr>),
    Aes192Ctr(Box<Aes192Ctr>),
    Aes256Ctr(Box<Aes256Ctr>),
    Aes128CbcEnc(Box<cbc::Encryptor<Aes128>>),
    Aes192CbcEnc(Box<cbc::Encryptor<Aes192>>),
    Aes256CbcEnc(Box<cbc::Encryptor<Aes256>>),
    Aes128CbcDec(Box<cbc::Decryptor<Aes128>>),
    Aes192CbcDec(Box<cbc::Decryptor<Aes192>>),
    Aes256CbcDec(Box<cbc::Decryptor<Aes256>>),
}

fn key_error(algorithm: CipherAlgorithm) -> impl Fn(cipher::InvalidLength) -> KilnError {
    move |_| KilnError::Security(format!("Invalid key or IV length for {}", algorithm.name()))
}

impl CipherState {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8], encrypt: bool) -> KilnResult<Self> {
        if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
            return Err(KilnError::Security(format!(
                "Insufficient key material for {}: key {} of {}, iv {} of {}",
                algorithm.name(),
                key.len(),
                algorithm.key_size(),
                iv.len(),
                algorithm.iv_size()
            )));
        }
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];
        let err = key_error(algorithm);

        let state = match (algorithm, encrypt) {
            (CipherAlgorithm::None, _) => CipherState::None,
            (CipherAlgorithm::Aes128Ctr, _) => {
                CipherState::Aes128Ctr(Box::new(Aes128Ctr::new_from_slices(key, iv).map_err(err)?))
            }
            (CipherAlgorithm::Aes192Ctr, _) => {
                CipherState::Aes192Ctr(Box::new(Aes192Ctr::new_from_slices(key, iv).map_err(err)?))
            }
            (CipherAlgorithm::Aes256Ctr, _) => {
                CipherState::Aes256Ctr(Box::new(Aes256Ctr::new_from_slices(key, iv).map_err(err)?))
            }
            (CipherAlgorithm::Aes128Cbc, true) => CipherState::Aes128CbcEnc(Box::new(
                cbc::Encryptor::new_from_slices(key, iv).map_err(err)?,
            )),
            (CipherAlgorithm::Aes192Cbc, true) => CipherState::Aes192CbcEnc(Box::new(
                cbc::Encryptor::new_from_slices(key, iv).map_err(err)?,
            )),
            (CipherAlgorithm::Aes256Cbc, true) => CipherState::Aes256CbcEnc(Box::new(
                cbc::Encryptor::new_from_slices(key, iv).map_err(err)?,
            )),
            (CipherAlgorithm::Aes128Cbc, false) => CipherState::Aes128CbcDec(Box::new(
                cbc::Decryptor::new_from_slices(key, iv).map_err(err)?,
            )),
            (CipherAlgorithm::Aes192Cbc, false) => CipherState::Aes192CbcDec(Box::new(
                cbc::Decryptor::new_from_slices(key, iv).map_err(err)?,
            )),
            (CipherAlgorithm::Aes256Cbc, false) => CipherState::Aes256CbcDec(Box::new(
                cbc::Decryptor::new_from_slices(key, iv).map_err(err)?,
            )),
        };
        Ok(state)
    }

    /// Transforms `data` in place. CBC input must be whole blocks.
    fn apply(&mut self, data: &mut [u8]) -> KilnResult<()> {
        match self {
            CipherState::None => {}
            CipherState::Aes128Ctr(c) => c.apply_keystream(data),
            CipherState::Aes192Ctr(c) => c.apply_keystream(data),
            CipherState::Aes256Ctr(c) => c.apply_keystream(data),
            CipherState::Aes128CbcEnc(c) => {
                check_blocks(data)?;
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes192CbcEnc(c) => {
                check_blocks(data)?;
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes256CbcEnc(c) => {
                check_blocks(data)?;
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes128CbcDec(c) => {
                check_blocks(data)?;
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes192CbcDec(c) => {
                check_blocks(data)?;
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes256CbcDec(c) => {
                check_blocks(data)?;
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
        Ok(())
    }
}

fn check_blocks(data: &[u8]) -> KilnResult<()> {
    if data.len() % 16 != 0 {
        return Err(KilnError::Protocol(format!(
            "CBC input of {} bytes is not block aligned",
            data.len()
        )));
    }
    Ok(())
}

#[derive(Clone)]
enum MacState {
    None,
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

impl MacState {
    fn new(algorithm: MacAlgorithm, key: &[u8]) -> KilnResult<Self> {
        if key.len() < algorithm.key_size() {
            return Err(KilnError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key.len()
            )));
        }
        let key = &key[..algorithm.key_size()];
        let invalid = |_| KilnError::Security(format!("Invalid {} key", algorithm.name()));
        Ok(match algorithm {
            MacAlgorithm::None => MacState::None,
            MacAlgorithm::HmacSha1 => MacState::Sha1(Hmac::new_from_slice(key).map_err(invalid)?),
            MacAlgorithm::HmacSha256 => {
                MacState::Sha256(Hmac::new_from_slice(key).map_err(invalid)?)
            }
            MacAlgorithm::HmacSha512 => {
                MacState::Sha512(Hmac::new_from_slice(key).map_err(invalid)?)
            }
        })
    }

    fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        let seq = sequence.to_be_bytes();
        match self {
            MacState::None => Vec::new(),
            MacState::Sha1(h) => {
                let mut mac = h.clone();
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacState::Sha256(h) => {
                let mut mac = h.clone();
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacState::Sha512(h) => {
                let mut mac = h.clone();
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// Outgoing half of a cipher suite: encrypts and MACs packets we send.
pub struct Sealer {
    cipher: CipherAlgorithm,
    mac: MacAlgorithm,
    cipher_state: CipherState,
    mac_state: MacState,
}

impl Sealer {
    /// The identity transform used before the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            cipher: CipherAlgorithm::None,
            mac: MacAlgorithm::None,
            cipher_state: CipherState::None,
            mac_state: MacState::None,
        }
    }

    /// Builds the outgoing half from explicit key material.
    pub fn new(
        cipher: CipherAlgorithm,
        mac: MacAlgorithm,
        key: &[u8],
        iv: &[u8],
        mac_key: &[u8],
    ) -> KilnResult<Self> {
        Ok(Self {
            cipher,
            mac,
            cipher_state: CipherState::new(cipher, key, iv, true)?,
            mac_state: MacState::new(mac, mac_key)?,
        })
    }

    /// Encrypts `data` in place.
    pub fn encrypt(&mut self, data: &mut [u8]) -> KilnResult<()> {
        self.cipher_state.apply(data)
    }

    /// Computes the MAC over `sequence || packet`. Empty for `none`.
    pub fn compute_mac(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        self.mac_state.compute(sequence, packet)
    }

    /// Cipher block size (8 for `none`).
    pub fn block_size(&self) -> usize {
        self.cipher.block_size()
    }

    /// MAC length in bytes.
    pub fn mac_size(&self) -> usize {
        self.mac.mac_size()
    }

    /// Cipher in use.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    /// MAC in use.
    pub fn mac(&self) -> MacAlgorithm {
        self.mac
    }
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac.name())
            .field("keys", &"<redacted>")
            .finish()
    }
}

/// Incoming half of a cipher suite: decrypts and verifies packets we receive.
pub struct Opener {
    cipher: CipherAlgorithm,
    mac: MacAlgorithm,
    cipher_state: CipherState,
    mac_state: MacState,
}

impl Opener {
    /// The identity transform used before the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            cipher: CipherAlgorithm::None,
            mac: MacAlgorithm::None,
            cipher_state: CipherState::None,
            mac_state: MacState::None,
        }
    }

    /// Builds the incoming half from explicit key material.
    pub fn new(
        cipher: CipherAlgorithm,
        mac: MacAlgorithm,
        key: &[u8],
        iv: &[u8],
        mac_key: &[u8],
    ) -> KilnResult<Self> {
        Ok(Self {
            cipher,
            mac,
            cipher_state: CipherState::new(cipher, key, iv, false)?,
            mac_state: MacState::new(mac, mac_key)?,
        })
    }

    /// Decrypts `data` in place.
    pub fn decrypt(&mut self, data: &mut [u8]) -> KilnResult<()> {
        self.cipher_state.apply(data)
    }

    /// Checks `mac` against `sequence || packet` in constant time.
    ///
    /// Always true for the `none` MAC.
    pub fn verify_mac(&self, sequence: u32, packet: &[u8], mac: &[u8]) -> bool {
        if matches!(self.mac, MacAlgorithm::None) {
            return true;
        }
        let expected = self.mac_state.compute(sequence, packet);
        if expected.len() != mac.len() {
            return false;
        }
        expected.ct_eq(mac).into()
    }

    /// Cipher block size (8 for `none`).
    pub fn block_size(&self) -> usize {
        self.cipher.block_size()
    }

    /// MAC length in bytes.
    pub fn mac_size(&self) -> usize {
        self.mac.mac_size()
    }

    /// Cipher in use.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    /// MAC in use.
    pub fn mac(&self) -> MacAlgorithm {
        self.mac
    }
}

impl std::fmt::Debug for Opener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opener")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac.name())
            .field("keys", &"<redacted>")
            .finish()
    }
}

/// Negotiated cipher and MAC for both directions of one key exchange.
///
/// Created from the negotiated names, keyed once with [`set_keys`](Self::set_keys),
/// then split with [`into_halves`](Self::into_halves) when NEWKEYS is sent and
/// received.
#[derive(Debug)]
pub struct CipherSuite {
    out_cipher: CipherAlgorithm,
    in_cipher: CipherAlgorithm,
    out_mac: MacAlgorithm,
    in_mac: MacAlgorithm,
    outgoing: Option<Sealer>,
    incoming: Option<Opener>,
}

impl CipherSuite {
    /// Creates an unkeyed suite.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Config`] for an algorithm name missing from the tables.
    pub fn new(out_cipher: &str, in_cipher: &str, out_mac: &str, in_mac: &str) -> KilnResult<Self> {
        Ok(Self {
            out_cipher: CipherAlgorithm::lookup(out_cipher)?,
            in_cipher: CipherAlgorithm::lookup(in_cipher)?,
            out_mac: MacAlgorithm::lookup(out_mac)?,
            in_mac: MacAlgorithm::lookup(in_mac)?,
            outgoing: None,
            incoming: None,
        })
    }

    /// The keyed `none`/`none` suite a connection starts with.
    pub fn none() -> Self {
        Self {
            out_cipher: CipherAlgorithm::None,
            in_cipher: CipherAlgorithm::None,
            out_mac: MacAlgorithm::None,
            in_mac: MacAlgorithm::None,
            outgoing: Some(Sealer::none()),
            incoming: Some(Opener::none()),
        }
    }

    /// Derives all six keys at the sizes this suite needs.
    pub fn derive_keys(
        &self,
        hash: HashAlgorithm,
        role: Role,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
    ) -> DerivedKeySet {
        let derive = |tag: u8, len: usize| {
            derive_key(hash, shared_secret, exchange_hash, session_id, tag, len)
        };
        // (iv, key, mac) tags for the direction we send in, then the one we receive in
        let (out_tags, in_tags) = match role {
            Role::Client => ((b'A', b'C', b'E'), (b'B', b'D', b'F')),
            Role::Server => ((b'B', b'D', b'F'), (b'A', b'C', b'E')),
        };
        DerivedKeySet {
            iv_out: derive(out_tags.0, self.out_cipher.iv_size()),
            key_out: derive(out_tags.1, self.out_cipher.key_size()),
            mac_out: derive(out_tags.2, self.out_mac.key_size()),
            iv_in: derive(in_tags.0, self.in_cipher.iv_size()),
            key_in: derive(in_tags.1, self.in_cipher.key_size()),
            mac_in: derive(in_tags.2, self.in_mac.key_size()),
        }
    }

    /// Installs cipher and MAC state for both directions.
    pub fn set_keys(&mut self, keys: &DerivedKeySet) -> KilnResult<()> {
        self.outgoing = Some(Sealer::new(
            self.out_cipher,
            self.out_mac,
            &keys.key_out,
            &keys.iv_out,
            &keys.mac_out,
        )?);
        self.incoming = Some(Opener::new(
            self.in_cipher,
            self.in_mac,
            &keys.key_in,
            &keys.iv_in,
            &keys.mac_in,
        )?);
        Ok(())
    }

    /// Encrypts outgoing data in place.
    pub fn encrypt(&mut self, data: &mut [u8]) -> KilnResult<()> {
        self.sealer_mut()?.encrypt(data)
    }

    /// Decrypts incoming data in place.
    pub fn decrypt(&mut self, data: &mut [u8]) -> KilnResult<()> {
        self.opener_mut()?.decrypt(data)
    }

    /// MAC for an outgoing packet.
    pub fn compute_mac(&self, sequence: u32, packet: &[u8]) -> KilnResult<Vec<u8>> {
        let sealer = self.outgoing.as_ref().ok_or_else(not_keyed)?;
        Ok(sealer.compute_mac(sequence, packet))
    }

    /// Verifies an incoming packet's MAC. False when the suite is unkeyed.
    pub fn verify_mac(&self, sequence: u32, packet: &[u8], mac: &[u8]) -> bool {
        self.incoming
            .as_ref()
            .is_some_and(|opener| opener.verify_mac(sequence, packet, mac))
    }

    /// Outgoing cipher.
    pub fn out_cipher(&self) -> CipherAlgorithm {
        self.out_cipher
    }

    /// Incoming cipher.
    pub fn in_cipher(&self) -> CipherAlgorithm {
        self.in_cipher
    }

    /// Splits a keyed suite into its directional halves.
    pub fn into_halves(self) -> KilnResult<(Sealer, Opener)> {
        match (self.outgoing, self.incoming) {
            (Some(sealer), Some(opener)) => Ok((sealer, opener)),
            _ => Err(not_keyed()),
        }
    }

    fn sealer_mut(&mut self) -> KilnResult<&mut Sealer> {
        self.outgoing.as_mut().ok_or_else(not_keyed)
    }

    fn opener_mut(&mut self) -> KilnResult<&mut Opener> {
        self.incoming.as_mut().ok_or_else(not_keyed)
    }
}

fn not_keyed() -> KilnError {
    KilnError::InvalidState("cipher suite used before set_keys".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed_pair(cipher: &str, mac: &str) -> (CipherSuite, CipherSuite) {
        let mut client = CipherSuite::new(cipher, cipher, mac, mac).unwrap();
        let mut server = CipherSuite::new(cipher, cipher, mac, mac).unwrap();
        let secret = [0x5Au8; 64];
        let h = [0x11u8; 20];
        client
            .set_keys(&client.derive_keys(HashAlgorithm::Sha1, Role::Client, &secret, &h, &h))
            .unwrap();
        server
            .set_keys(&server.derive_keys(HashAlgorithm::Sha1, Role::Server, &secret, &h, &h))
            .unwrap();
        (client, server)
    }

    #[test]
    fn test_cipher_algorithm_properties() {
        let none = CipherAlgorithm::None;
        assert_eq!(none.block_size(), 8);
        assert_eq!(none.key_size(), 0);

        let aes128 = CipherAlgorithm::Aes128Ctr;
        assert_eq!(aes128.name(), "aes128-ctr");
        assert_eq!(aes128.key_size(), 16);
        assert_eq!(aes128.iv_size(), 16);
        assert_eq!(aes128.block_size(), 16);

        assert_eq!(CipherAlgorithm::Aes192Cbc.key_size(), 24);
        assert_eq!(CipherAlgorithm::Aes256Ctr.key_size(), 32);
    }

    #[test]
    fn test_cipher_from_name() {
        for alg in CipherAlgorithm::ALL {
            assert_eq!(CipherAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert!(CipherAlgorithm::from_name("blowfish-cbc").is_none());
        assert!(matches!(
            CipherAlgorithm::lookup("blowfish-cbc"),
            Err(KilnError::Config(_))
        ));
    }

    #[test]
    fn test_mac_algorithm_properties() {
        assert_eq!(MacAlgorithm::HmacSha1.mac_size(), 20);
        assert_eq!(MacAlgorithm::HmacSha256.key_size(), 32);
        assert_eq!(MacAlgorithm::HmacSha512.mac_size(), 64);
        assert_eq!(MacAlgorithm::None.mac_size(), 0);
        assert!(MacAlgorithm::lookup("hmac-md5").is_err());
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key(HashAlgorithm::Sha1, &[1, 2, 3], &[4; 20], &[5; 20], b'A', 40);
        let b = derive_key(HashAlgorithm::Sha1, &[1, 2, 3], &[4; 20], &[5; 20], b'A', 40);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_derive_key_single_byte_changes() {
        let base = derive_key(HashAlgorithm::Sha1, &[1, 2, 3], &[4; 20], &[5; 20], b'A', 20);
        assert_ne!(
            base,
            derive_key(HashAlgorithm::Sha1, &[1, 2, 4], &[4; 20], &[5; 20], b'A', 20)
        );
        let mut h = [4u8; 20];
        h[19] = 5;
        assert_ne!(
            base,
            derive_key(HashAlgorithm::Sha1, &[1, 2, 3], &h, &[5; 20], b'A', 20)
        );
        let mut sid = [5u8; 20];
        sid[0] = 6;
        assert_ne!(
            base,
            derive_key(HashAlgorithm::Sha1, &[1, 2, 3], &[4; 20], &sid, b'A', 20)
        );
        assert_ne!(
            base,
            derive_key(HashAlgorithm::Sha1, &[1, 2, 3], &[4; 20], &[5; 20], b'B', 20)
        );
    }

    #[test]
    fn test_derive_key_extension_hashes_all_previous_blocks() {
        let secret = [0x42u8; 32];
        let h = [0x01u8; 20];
        let sid = [0x02u8; 20];
        let key = derive_key(HashAlgorithm::Sha1, &secret, &h, &sid, b'C', 60);

        let k = encode_mpint(&secret);
        let k1 = HashAlgorithm::Sha1.digest(&[&k, &h, b"C", &sid]);
        let k2 = HashAlgorithm::Sha1.digest(&[&k, &h, &k1]);
        let k3 = HashAlgorithm::Sha1.digest(&[&k, &h, &k1, &k2]);
        assert_eq!(&key[..20], &k1[..]);
        assert_eq!(&key[20..40], &k2[..]);
        assert_eq!(&key[40..60], &k3[..]);
    }

    #[test]
    fn test_derived_keys_mirror_between_roles() {
        let suite = CipherSuite::new("aes256-ctr", "aes128-cbc", "hmac-sha2-512", "hmac-sha1")
            .unwrap();
        let mirror = CipherSuite::new("aes128-cbc", "aes256-ctr", "hmac-sha1", "hmac-sha2-512")
            .unwrap();
        let client = suite.derive_keys(HashAlgorithm::Sha256, Role::Client, &[9; 64], &[3; 32], &[4; 32]);
        let server = mirror.derive_keys(HashAlgorithm::Sha256, Role::Server, &[9; 64], &[3; 32], &[4; 32]);
        assert_eq!(client.key_out, server.key_in);
        assert_eq!(client.iv_out, server.iv_in);
        assert_eq!(client.mac_out, server.mac_in);
        assert_eq!(client.key_in, server.key_out);
        assert_eq!(client.key_out.len(), 32);
        assert_eq!(client.key_in.len(), 16);
        assert_eq!(client.mac_out.len(), 64);
        assert_eq!(client.mac_in.len(), 20);
    }

    #[test]
    fn test_none_suite_is_identity() {
        let mut suite = CipherSuite::none();
        let mut data = b"plaintext".to_vec();
        suite.encrypt(&mut data).unwrap();
        assert_eq!(data, b"plaintext");
        assert!(suite.compute_mac(0, &data).unwrap().is_empty());
        assert!(suite.verify_mac(0, &data, &[]));
    }

    #[test]
    fn test_unkeyed_suite_refuses_work() {
        let mut suite = CipherSuite::new("aes128-ctr", "aes128-ctr", "hmac-sha1", "hmac-sha1")
            .unwrap();
        let mut data = [0u8; 16];
        assert!(matches!(
            suite.encrypt(&mut data),
            Err(KilnError::InvalidState(_))
        ));
        assert!(!suite.verify_mac(0, &data, &[0; 20]));
        assert!(suite.into_halves().is_err());
    }

    #[test]
    fn test_ctr_and_cbc_encrypt_decrypt() {
        for cipher in ["aes128-ctr", "aes192-ctr", "aes256-ctr", "aes128-cbc", "aes192-cbc", "aes256-cbc"] {
            let (mut client, mut server) = keyed_pair(cipher, "hmac-sha2-256");
            for round in 0..3u8 {
                let original = vec![round; 48];
                let mut data = original.clone();
                client.encrypt(&mut data).unwrap();
                assert_ne!(data, original, "{} produced plaintext", cipher);
                server.decrypt(&mut data).unwrap();
                assert_eq!(data, original, "{} round {} failed", cipher, round);
            }
        }
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let (mut client, _) = keyed_pair("aes128-cbc", "none");
        let mut data = [0u8; 15];
        assert!(client.encrypt(&mut data).is_err());
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let (client, server) = keyed_pair("none", "hmac-sha1");
        let packet = b"\x00\x00\x00\x0c\x0a\x15payloadpad";
        let mac = client.compute_mac(3, packet).unwrap();
        assert_eq!(mac.len(), 20);
        assert!(server.verify_mac(3, packet, &mac));
        assert!(!server.verify_mac(4, packet, &mac));

        let mut tampered = mac.clone();
        tampered[0] ^= 1;
        assert!(!server.verify_mac(3, packet, &tampered));
        assert!(!server.verify_mac(3, packet, &mac[..19]));
    }

    #[test]
    fn test_hmac_sha1_known_answer() {
        // RFC 2202 test case 2, with the sequence number folded into the data
        let sealer = Sealer::new(CipherAlgorithm::None, MacAlgorithm::HmacSha1, &[], &[], b"Jefe\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0")
            .unwrap();
        let opener = Opener::new(CipherAlgorithm::None, MacAlgorithm::HmacSha1, &[], &[], b"Jefe\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0")
            .unwrap();
        let mac = sealer.compute_mac(0x7768_6174, b" do ya want for nothing?");
        assert_eq!(hex::encode(&mac), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
        assert!(opener.verify_mac(0x7768_6174, b" do ya want for nothing?", &mac));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let (client, _) = keyed_pair("aes128-ctr", "hmac-sha1");
        let (sealer, opener) = client.into_halves().unwrap();
        assert!(format!("{:?}", sealer).contains("<redacted>"));
        assert!(format!("{:?}", opener).contains("aes128-ctr"));
    }
}
