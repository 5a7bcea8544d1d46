//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Example: `SSH-2.0-Kiln_0.1.0 transport`
//!
//! A server may send other lines before its identification string; those are
//! skipped. Bare LF line endings are accepted from the peer.
//!
//! # Security
//!
//! - Maximum identification length: 255 characters (DoS prevention)
//! - Maximum length of any pre-identification line: 1024 bytes
//! - At most 256 pre-identification lines
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use kiln_proto::ssh::version::Version;
//!
//! // Create version string
//! let version = Version::new("Kiln_0.1.0", Some("transport"));
//! assert_eq!(version.to_string(), "SSH-2.0-Kiln_0.1.0 transport");
//!
//! // Parse version string
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use bytes::BytesMut;
use kiln_platform::{KilnError, KilnResult};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum length of a line received before the identification string.
pub const MAX_BANNER_LINE_LENGTH: usize = 1024;

/// Maximum number of lines received before the identification string.
pub const MAX_BANNER_LINES: usize = 256;

/// SSH protocol version string.
///
/// Represents the SSH identification string exchanged at connection start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "Kiln_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH version string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Kiln_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Kiln_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Kiln version string.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_proto::ssh::version::Version;
    ///
    /// let version = Version::default_kiln();
    /// assert!(version.to_string().starts_with("SSH-2.0-Kiln_"));
    /// ```
    pub fn default_kiln() -> Self {
        Self::new(&format!("Kiln_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH version string.
    ///
    /// The protocol version is not checked against a supported set here; that
    /// decision belongs to the transport, which must still answer with KEXINIT
    /// and a disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Line has no software version
    /// - Line contains null bytes
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_proto::ssh::version::Version;
    ///
    /// let version = Version::parse("SSH-1.99-OpenSSH_3.9\r\n").unwrap();
    /// assert_eq!(version.proto_version(), "1.99");
    /// assert_eq!(version.software(), "OpenSSH_3.9");
    /// ```
    pub fn parse(line: &str) -> KilnResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(KilnError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(KilnError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(KilnError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        // SSH-protoversion-softwareversion[ comments]
        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 || parts[1].is_empty() {
            return Err(KilnError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "Kiln_0.1.0").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Whether the protocol version is one of `supported`.
    pub fn is_supported(&self, supported: &[String]) -> bool {
        supported.iter().any(|v| v == &self.proto_version)
    }

    /// Converts to wire format (with CR LF).
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Kiln_0.1.0", None);
    /// assert_eq!(version.to_wire_format(), b"SSH-2.0-Kiln_0.1.0\r\n");
    /// ```
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Pulls the peer's identification line out of the receive buffer.
///
/// Complete lines that do not start with `SSH-` are discarded and counted in
/// `skipped`, which the caller keeps across calls. Returns the identification
/// line exactly as received minus its line terminator, or `None` if more data
/// is needed. Bytes after the identification line stay in `buf` as packet data.
///
/// # Errors
///
/// Returns [`KilnError::Protocol`] when a line grows past
/// [`MAX_BANNER_LINE_LENGTH`] without a terminator, when more than
/// [`MAX_BANNER_LINES`] lines precede the identification line, or when the
/// identification line is not valid UTF-8.
pub fn take_identification_line(
    buf: &mut BytesMut,
    skipped: &mut usize,
) -> KilnResult<Option<String>> {
    loop {
        let newline = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => {
                if buf.len() > MAX_BANNER_LINE_LENGTH {
                    return Err(KilnError::Protocol(format!(
                        "Pre-version line exceeds {} bytes",
                        MAX_BANNER_LINE_LENGTH
                    )));
                }
                return Ok(None);
            }
        };

        if newline > MAX_BANNER_LINE_LENGTH {
            return Err(KilnError::Protocol(format!(
                "Pre-version line exceeds {} bytes",
                MAX_BANNER_LINE_LENGTH
            )));
        }

        let line = buf.split_to(newline + 1);
        let mut line = &line[..newline];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        if line.starts_with(b"SSH-") {
            let text = std::str::from_utf8(line).map_err(|_| {
                KilnError::Protocol("Identification string is not valid UTF-8".to_string())
            })?;
            return Ok(Some(text.to_string()));
        }

        *skipped += 1;
        if *skipped > MAX_BANNER_LINES {
            return Err(KilnError::Protocol(format!(
                "More than {} lines before the identification string",
                MAX_BANNER_LINES
            )));
        }
    }
}
