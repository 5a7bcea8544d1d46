//! SSH Host Key Algorithms
//!
//! This module implements host key algorithms for SSH server authentication
//! according to RFC 4253 Section 6.6.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519 (RFC 8709)
//! - `ssh-rsa` - RSA PKCS#1 v1.5 signature with SHA-1 (RFC 4253)
//!
//! # Security
//!
//! - Ed25519 provides 128-bit security with constant-time operations
//! - RSA keys must be ≥ 2048 bits to verify
//!
//! # Example
//!
//! ```rust
//! use kiln_platform::mock::MockRandom;
//! use kiln_proto::ssh::hostkey::{verify_signature, Ed25519HostKey, HostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate(&mut MockRandom::new(1));
//!
//! let blob = hostkey.public_key_bytes();
//! let signature = hostkey.sign(b"data to sign")?;
//!
//! assert!(verify_signature(&blob, &signature, b"data to sign")?);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use crate::ssh::wire::{put_mpint, put_string, WireReader};
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use kiln_platform::{KilnError, KilnResult, SecureRandom};
use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Host key algorithm names this crate can sign and verify with.
pub const SUPPORTED_ALGORITHMS: [&str; 2] = ["ssh-ed25519", "ssh-rsa"];

/// Whether `name` is a supported host key algorithm.
pub fn is_supported_algorithm(name: &str) -> bool {
    HostKeyAlgorithm::from_name(name).is_some()
}

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 - EdDSA signature using Ed25519
    SshEd25519,
    /// ssh-rsa - RSA with SHA-1
    SshRsa,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as specified in RFC 4253
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            _ => None,
        }
    }
}

/// Trait for host key operations
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format
    ///
    /// Format: string algorithm_name, followed by algorithm-specific data
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Sign data and return signature in SSH wire format
    ///
    /// The signature format depends on the algorithm:
    /// - Ed25519: string "ssh-ed25519", string signature (64 bytes)
    /// - RSA: string "ssh-rsa", string signature
    fn sign(&self, data: &[u8]) -> KilnResult<Vec<u8>>;

    /// Get the algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

fn signature_blob(algorithm: &str, signature: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, algorithm.as_bytes());
    put_string(&mut buf, signature);
    buf.to_vec()
}

/// Ed25519 host key (ssh-ed25519)
///
/// Provides 128-bit security with constant-time operations.
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate(rng: &mut dyn SecureRandom) -> Self {
        let mut secret_bytes = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        rng.fill_bytes(&mut secret_bytes[..]);
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from raw key bytes (32-byte secret key)
    pub fn from_bytes(secret_bytes: &[u8]) -> KilnResult<Self> {
        if secret_bytes.len() != SECRET_KEY_LENGTH {
            return Err(KilnError::Security(
                "Ed25519 secret key must be 32 bytes".to_string(),
            ));
        }
        let mut key_bytes = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        key_bytes.copy_from_slice(secret_bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Verify an Ed25519 signature
    ///
    /// # Arguments
    ///
    /// * `public_key` - The 32-byte Ed25519 public key
    /// * `data` - The data that was signed
    /// * `signature` - The 64-byte signature
    pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> KilnResult<bool> {
        let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
            KilnError::Security("Ed25519 public key must be 32 bytes".to_string())
        })?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| KilnError::Security("Ed25519 signature must be 64 bytes".to_string()))?;

        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| KilnError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
        let signature = Signature::from_bytes(&sig_bytes);

        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"ssh-ed25519");
        put_string(&mut buf, self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> KilnResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        Ok(signature_blob("ssh-ed25519", &signature.to_bytes()))
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// RSA host key with SHA-1 (ssh-rsa)
///
/// Signs with RSASSA-PKCS1-v1_5 over a SHA-1 digest.
pub struct SshRsaHostKey {
    private_key: RsaPrivateKey,
}

impl SshRsaHostKey {
    /// Create from a PKCS#1 PEM private key (`BEGIN RSA PRIVATE KEY`)
    pub fn from_pkcs1_pem(pem: &str) -> KilnResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| KilnError::Security(format!("Invalid RSA private key: {}", e)))?;
        Self::from_private_key(private_key)
    }

    /// Wrap an existing RSA private key
    pub fn from_private_key(private_key: RsaPrivateKey) -> KilnResult<Self> {
        if private_key.size() < 256 {
            return Err(KilnError::Security(format!(
                "RSA host key too small: {} bits (minimum 2048)",
                private_key.size() * 8
            )));
        }
        Ok(Self { private_key })
    }

    /// Verify an ssh-rsa signature against a public key given as `(n, e)`
    pub fn verify(n: &[u8], e: &[u8], data: &[u8], signature: &[u8]) -> KilnResult<bool> {
        let components = RsaPublicKeyComponents {
            n: strip_leading_zeros(n),
            e: strip_leading_zeros(e),
        };
        Ok(components
            .verify(&RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY, data, signature)
            .is_ok())
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

impl HostKey for SshRsaHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshRsa
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"ssh-rsa");
        put_mpint(&mut buf, &self.private_key.e().to_bytes_be());
        put_mpint(&mut buf, &self.private_key.n().to_bytes_be());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> KilnResult<Vec<u8>> {
        let digest = Sha1::digest(data);
        let signature = self
            .private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| KilnError::Security(format!("RSA signing failed: {}", e)))?;
        Ok(signature_blob("ssh-rsa", &signature))
    }
}

impl std::fmt::Debug for SshRsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshRsaHostKey")
            .field("algorithm", &"ssh-rsa")
            .field("key_size_bits", &(self.private_key.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Returns the algorithm name a host key blob starts with.
pub fn blob_algorithm(host_key_blob: &[u8]) -> KilnResult<&str> {
    WireReader::new(host_key_blob).read_utf8()
}

/// Verifies a signature blob made by the key in `host_key_blob` over `data`.
///
/// Returns `Ok(false)` for a well-formed signature that does not verify.
///
/// # Errors
///
/// Returns [`KilnError::Protocol`] for malformed blobs, an unsupported key
/// type, or a signature format that does not match the key.
pub fn verify_signature(host_key_blob: &[u8], signature: &[u8], data: &[u8]) -> KilnResult<bool> {
    let mut key = WireReader::new(host_key_blob);
    let key_type = key.read_utf8()?;

    let mut sig = WireReader::new(signature);
    let sig_type = sig.read_utf8()?;
    let sig_data = sig.read_string()?;

    if sig_type != key_type {
        return Err(KilnError::Protocol(format!(
            "Signature format {} does not match host key type {}",
            sig_type, key_type
        )));
    }

    match HostKeyAlgorithm::from_name(key_type) {
        Some(HostKeyAlgorithm::SshEd25519) => {
            let public_key = key.read_string()?;
            Ed25519HostKey::verify(public_key, data, sig_data)
        }
        Some(HostKeyAlgorithm::SshRsa) => {
            // string "ssh-rsa", mpint e, mpint n
            let e = key.read_string()?;
            let n = key.read_string()?;
            SshRsaHostKey::verify(n, e, data, sig_data)
        }
        None => Err(KilnError::Protocol(format!(
            "Unsupported host key type: {}",
            key_type
        ))),
    }
}

/// Formats a key fingerprint for display (SHA256).
pub fn fingerprint(host_key_blob: &[u8]) -> String {
    let hash = Sha256::digest(host_key_blob);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD.encode(hash)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_platform::mock::MockRandom;

    const TEST_RSA_KEY: &str = include_str!("../../tests/data/test_rsa.pem");

    #[test]
    fn test_algorithm_names() {
        for name in SUPPORTED_ALGORITHMS {
            assert_eq!(HostKeyAlgorithm::from_name(name).unwrap().name(), name);
        }
        assert!(!is_supported_algorithm("ssh-dss"));
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate(&mut MockRandom::new(5));
        let blob = key.public_key_bytes();
        assert_eq!(blob_algorithm(&blob).unwrap(), "ssh-ed25519");
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);

        let sig = key.sign(b"exchange hash").unwrap();
        assert!(verify_signature(&blob, &sig, b"exchange hash").unwrap());
        assert!(!verify_signature(&blob, &sig, b"other data").unwrap());
    }

    #[test]
    fn test_ed25519_from_bytes() {
        let a = Ed25519HostKey::from_bytes(&[9u8; 32]).unwrap();
        let b = Ed25519HostKey::from_bytes(&[9u8; 32]).unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert!(Ed25519HostKey::from_bytes(&[9u8; 31]).is_err());
    }

    #[test]
    fn test_ed25519_verify_rejects_bad_lengths() {
        assert!(Ed25519HostKey::verify(&[0u8; 31], b"x", &[0u8; 64]).is_err());
        assert!(Ed25519HostKey::verify(&[0u8; 32], b"x", &[0u8; 63]).is_err());
    }

    #[test]
    fn test_rsa_sign_verify() {
        let key = SshRsaHostKey::from_pkcs1_pem(TEST_RSA_KEY).unwrap();
        let blob = key.public_key_bytes();
        assert_eq!(blob_algorithm(&blob).unwrap(), "ssh-rsa");

        let sig = key.sign(b"exchange hash").unwrap();
        let mut reader = WireReader::new(&sig);
        assert_eq!(reader.read_utf8().unwrap(), "ssh-rsa");
        assert_eq!(reader.read_string().unwrap().len(), 256);

        assert!(verify_signature(&blob, &sig, b"exchange hash").unwrap());
        assert!(!verify_signature(&blob, &sig, b"exchange hasH").unwrap());
    }

    #[test]
    fn test_rsa_rejects_garbage_pem() {
        assert!(SshRsaHostKey::from_pkcs1_pem("not a key").is_err());
    }

    #[test]
    fn test_signature_type_mismatch() {
        let ed = Ed25519HostKey::from_bytes(&[1u8; 32]).unwrap();
        let rsa = SshRsaHostKey::from_pkcs1_pem(TEST_RSA_KEY).unwrap();
        let sig = rsa.sign(b"data").unwrap();
        assert!(verify_signature(&ed.public_key_bytes(), &sig, b"data").is_err());
    }

    #[test]
    fn test_unknown_key_type() {
        let mut blob = BytesMut::new();
        put_string(&mut blob, b"ssh-dss");
        let sig = signature_blob("ssh-dss", &[0; 40]);
        assert!(verify_signature(&blob, &sig, b"data").is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let key = Ed25519HostKey::from_bytes(&[3u8; 32]).unwrap();
        let fp = fingerprint(&key.public_key_bytes());
        assert!(fp.starts_with("SHA256:"));
        // 32-byte digest in padded base64
        assert_eq!(fp.len(), 7 + 44);
        assert_eq!(fp, fingerprint(&key.public_key_bytes()));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rsa = SshRsaHostKey::from_pkcs1_pem(TEST_RSA_KEY).unwrap();
        let out = format!("{:?}", rsa);
        assert!(out.contains("2048"));
        assert!(!out.contains("BEGIN"));
    }
}
