//! Error types shared by the Kiln crates.
//!
//! Faults caused by the remote peer are carried as SSH disconnects in
//! `kiln-proto`; [`KilnError`] covers everything else: the byte stream,
//! local configuration, key material, and misuse of the API.

use std::fmt;

/// Error returned by fallible Kiln operations.
#[derive(Debug)]
pub enum KilnError {
    /// The underlying byte stream failed.
    Io(std::io::Error),

    /// A `TransportConfig` names an unknown algorithm, leaves a required
    /// list empty, or sets a limit out of range.
    Config(String),

    /// Bytes that do not parse as the SSH wire format: identification line,
    /// packet framing, message fields, compressed data.
    Protocol(String),

    /// Key material or signatures are unusable: bad host key encodings,
    /// wrong key lengths, failed signing or verification.
    Security(String),

    /// Operation not permitted in the current state.
    ///
    /// Signals misuse by the local caller, never a fault of the remote peer.
    InvalidState(String),

    /// A recognised algorithm or message that this build does not handle.
    NotImplemented(String),

    /// Failure from a third-party component with no better category.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for KilnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KilnError::Io(e) => write!(f, "IO error: {}", e),
            KilnError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KilnError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KilnError::Security(msg) => write!(f, "Security error: {}", msg),
            KilnError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            KilnError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            KilnError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for KilnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KilnError::Io(e) => Some(e),
            KilnError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(err)
    }
}

/// Result alias used across the Kiln crates.
pub type KilnResult<T> = Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KilnError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_invalid_state_display() {
        let err = KilnError::InvalidState("key exchange already in progress".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid state: key exchange already in progress"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let kiln_err: KilnError = io_err.into();
        assert!(matches!(kiln_err, KilnError::Io(_)));
        assert!(std::error::Error::source(&kiln_err).is_some());
    }

    #[test]
    fn test_result_type() {
        fn example() -> KilnResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
