//! Packet payload compression (RFC 4253 Section 6.2).
//!
//! `zlib` compresses the `messageType || payload` part of every packet as one
//! continuous deflate stream per direction, ending each packet with a sync
//! flush so the peer can decompress it immediately.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use kiln_platform::{KilnError, KilnResult};

/// Compression algorithm names understood by [`Compressor`] and [`Decompressor`].
pub const SUPPORTED: [&str; 2] = ["none", "zlib"];

/// zlib level used for outgoing data.
const ZLIB_LEVEL: u32 = 6;

/// Whether `name` is a supported compression algorithm.
pub fn is_supported(name: &str) -> bool {
    SUPPORTED.contains(&name)
}

/// Outgoing compression state.
pub enum Compressor {
    /// Identity.
    None,
    /// zlib stream.
    Zlib(Box<Compress>),
}

impl Compressor {
    /// Creates a compressor for the negotiated algorithm.
    pub fn new(name: &str) -> KilnResult<Self> {
        match name {
            "none" => Ok(Compressor::None),
            "zlib" => Ok(Compressor::Zlib(Box::new(Compress::new(
                Compression::new(ZLIB_LEVEL),
                true,
            )))),
            other => Err(KilnError::Config(format!(
                "Unknown compression algorithm: {}",
                other
            ))),
        }
    }

    /// Whether this compressor changes the data.
    pub fn is_active(&self) -> bool {
        matches!(self, Compressor::Zlib(_))
    }

    /// Compresses one packet's worth of data, including the flush bytes.
    pub fn compress(&mut self, data: &[u8]) -> KilnResult<Vec<u8>> {
        let stream = match self {
            Compressor::None => return Ok(data.to_vec()),
            Compressor::Zlib(stream) => stream,
        };

        let mut out = Vec::with_capacity(data.len() + 64);
        let mut input = data;
        loop {
            let before = stream.total_in();
            stream
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(|e| KilnError::Protocol(format!("zlib compression failed: {}", e)))?;
            let consumed = (stream.total_in() - before) as usize;
            input = &input[consumed..];

            // Spare capacity left over means the flush completed.
            if input.is_empty() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(out.capacity().max(64));
        }
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compressor::None => f.write_str("Compressor(none)"),
            Compressor::Zlib(_) => f.write_str("Compressor(zlib)"),
        }
    }
}

/// Incoming decompression state.
pub enum Decompressor {
    /// Identity.
    None,
    /// zlib stream.
    Zlib(Box<Decompress>),
}

impl Decompressor {
    /// Creates a decompressor for the negotiated algorithm.
    pub fn new(name: &str) -> KilnResult<Self> {
        match name {
            "none" => Ok(Decompressor::None),
            "zlib" => Ok(Decompressor::Zlib(Box::new(Decompress::new(true)))),
            other => Err(KilnError::Config(format!(
                "Unknown compression algorithm: {}",
                other
            ))),
        }
    }

    /// Whether this decompressor changes the data.
    pub fn is_active(&self) -> bool {
        matches!(self, Decompressor::Zlib(_))
    }

    /// Decompresses one packet's worth of data.
    ///
    /// Output is capped at `limit` bytes to bound memory used by a hostile peer.
    pub fn decompress(&mut self, data: &[u8], limit: usize) -> KilnResult<Vec<u8>> {
        let stream = match self {
            Decompressor::None => return Ok(data.to_vec()),
            Decompressor::Zlib(stream) => stream,
        };

        let mut out = Vec::with_capacity(data.len().saturating_mul(2).max(64));
        let mut input = data;
        loop {
            let before = stream.total_in();
            let status = stream
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
                .map_err(|e| KilnError::Protocol(format!("zlib decompression failed: {}", e)))?;
            let consumed = (stream.total_in() - before) as usize;
            input = &input[consumed..];

            if out.len() > limit {
                return Err(KilnError::Protocol(format!(
                    "Decompressed payload exceeds {} bytes",
                    limit
                )));
            }
            if matches!(status, Status::StreamEnd) {
                return Ok(out);
            }
            if input.is_empty()
                && (out.len() < out.capacity() || matches!(status, Status::BufError))
            {
                return Ok(out);
            }
            if consumed == 0 && out.len() < out.capacity() {
                return Err(KilnError::Protocol(
                    "zlib decompression made no progress".to_string(),
                ));
            }
            out.reserve(out.capacity().max(64));
        }
    }
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decompressor::None => f.write_str("Decompressor(none)"),
            Decompressor::Zlib(_) => f.write_str("Decompressor(zlib)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_identity() {
        let mut c = Compressor::new("none").unwrap();
        let mut d = Decompressor::new("none").unwrap();
        assert!(!c.is_active());
        let out = c.compress(b"hello").unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(d.decompress(&out, 1024).unwrap(), b"hello");
    }

    #[test]
    fn test_unknown_algorithm() {
        assert!(Compressor::new("zlib@openssh.com").is_err());
        assert!(Decompressor::new("lz4").is_err());
        assert!(is_supported("zlib"));
        assert!(!is_supported("lz4"));
    }

    #[test]
    fn test_zlib_stream_spans_packets() {
        let mut c = Compressor::new("zlib").unwrap();
        let mut d = Decompressor::new("zlib").unwrap();
        let messages: Vec<Vec<u8>> = vec![
            b"\x05ssh-userauth".to_vec(),
            vec![0x5e; 4000],
            b"\x02".to_vec(),
            (0..=255u8).collect(),
        ];
        for msg in &messages {
            let compressed = c.compress(msg).unwrap();
            let restored = d.decompress(&compressed, 1 << 20).unwrap();
            assert_eq!(&restored, msg);
        }
    }

    #[test]
    fn test_zlib_repetitive_data_shrinks() {
        let mut c = Compressor::new("zlib").unwrap();
        let compressed = c.compress(&[b'a'; 10_000]).unwrap();
        assert!(compressed.len() < 200);
    }

    #[test]
    fn test_zlib_rejects_garbage() {
        let mut d = Decompressor::new("zlib").unwrap();
        assert!(d.decompress(b"\xff\xff\xff\xff\xff\xff", 1024).is_err());
    }

    #[test]
    fn test_zlib_enforces_limit() {
        let mut c = Compressor::new("zlib").unwrap();
        let mut d = Decompressor::new("zlib").unwrap();
        let compressed = c.compress(&[0u8; 50_000]).unwrap();
        assert!(d.decompress(&compressed, 1000).is_err());
    }
}
