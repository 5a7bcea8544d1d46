//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length`: Does NOT include `mac` or `packet_length` field itself
//! - `padding_length`: Length of padding (minimum 4, maximum 255 bytes)
//! - `packet_length + 4` MUST be a multiple of the cipher block size (8 for `none`)
//! - The payload (`messageType || data`) is compressed before padding when
//!   compression is active
//!
//! # Security
//!
//! - **Size Validation**: Rejects declared lengths above the configured maximum
//! - **Padding Validation**: Ensures padding is within valid range (4-255 bytes)
//! - **Random Padding**: Padding comes from the injected [`SecureRandom`]
//! - **MAC Verification**: Checked before padding is interpreted or data decompressed
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use kiln_platform::mock::MockRandom;
//! use kiln_proto::ssh::packet::PacketCodec;
//!
//! let mut rng = MockRandom::new(7);
//! let mut sender = PacketCodec::new(35000);
//! let mut receiver = PacketCodec::new(35000);
//!
//! let bytes = sender.encode(2, b"padding", &mut rng).unwrap();
//! let mut buf = BytesMut::from(&bytes[..]);
//! let packet = receiver.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(packet.msg_type(), 2);
//! assert_eq!(packet.payload(), b"padding");
//! ```

use crate::ssh::compression::{Compressor, Decompressor};
use crate::ssh::crypto::{Opener, Sealer};
use crate::ssh::disconnect::{Disconnect, DisconnectReason};
use bytes::{BufMut, BytesMut};
use kiln_platform::{KilnError, KilnResult, SecureRandom};
use std::fmt;
use tracing::trace;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// A decoded packet: message number plus the bytes after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    msg_type: u8,
    payload: Vec<u8>,
}

impl Packet {
    /// Creates a packet.
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Message number.
    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    /// Data following the message number.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Fatal decoding failure, classified by the disconnect reason it calls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bad length, alignment or padding.
    Framing(String),
    /// MAC mismatch on the packet with this sequence number.
    Mac {
        /// Incoming sequence number of the rejected packet.
        sequence: u32,
    },
    /// The decompressor rejected the data.
    Compression(String),
}

impl DecodeError {
    /// Disconnect reason this failure maps to.
    pub fn reason(&self) -> DisconnectReason {
        match self {
            DecodeError::Framing(_) => DisconnectReason::ProtocolError,
            DecodeError::Mac { .. } => DisconnectReason::MacError,
            DecodeError::Compression(_) => DisconnectReason::CompressionError,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Framing(msg) => write!(f, "bad packet framing: {}", msg),
            DecodeError::Mac { sequence } => write!(f, "bad MAC on packet {}", sequence),
            DecodeError::Compression(msg) => write!(f, "decompression failed: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for Disconnect {
    fn from(err: DecodeError) -> Self {
        let description = match &err {
            DecodeError::Mac { .. } => "bad packet MAC".to_string(),
            other => other.to_string(),
        };
        Disconnect::new(err.reason(), description)
    }
}

/// Padding length for `data_len` bytes of payload at `block_size` alignment.
///
/// The result is at least [`MIN_PADDING_LEN`] and makes
/// `4 + 1 + data_len + padding` a multiple of `block_size`.
pub fn padding_len(data_len: usize, block_size: usize) -> usize {
    let mut pad = block_size - ((5 + data_len) % block_size);
    if pad < MIN_PADDING_LEN {
        pad += block_size;
    }
    pad
}

/// Frames, protects and numbers packets for one connection.
///
/// Each direction has its own [`Sealer`]/[`Opener`] and compression state,
/// replaced independently when NEWKEYS is sent or received. Sequence numbers
/// are never reset and wrap at 2^32.
pub struct PacketCodec {
    sealer: Sealer,
    opener: Opener,
    compressor: Compressor,
    decompressor: Decompressor,
    outgoing_seq: u32,
    incoming_seq: u32,
    max_packet_len: usize,
    // First cipher block of the packet being received, already decrypted.
    first_block: Option<Vec<u8>>,
    bytes_since_rekey: u64,
}

impl PacketCodec {
    /// Creates a codec in the initial `none` state.
    pub fn new(max_packet_len: usize) -> Self {
        Self {
            sealer: Sealer::none(),
            opener: Opener::none(),
            compressor: Compressor::None,
            decompressor: Decompressor::None,
            outgoing_seq: 0,
            incoming_seq: 0,
            max_packet_len,
            first_block: None,
            bytes_since_rekey: 0,
        }
    }

    /// Encodes one packet and advances the outgoing sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Protocol`] if compression fails or the packet
    /// would not fit the 32-bit length field.
    pub fn encode(
        &mut self,
        msg_type: u8,
        payload: &[u8],
        rng: &mut dyn SecureRandom,
    ) -> KilnResult<Vec<u8>> {
        let mut data = Vec::with_capacity(1 + payload.len());
        data.push(msg_type);
        data.extend_from_slice(payload);
        if self.compressor.is_active() {
            data = self.compressor.compress(&data)?;
        }

        let block_size = self.sealer.block_size();
        let pad = padding_len(data.len(), block_size);
        let packet_length = 1 + data.len() + pad;
        let packet_length_u32 = u32::try_from(packet_length).map_err(|_| {
            KilnError::Protocol(format!("Packet of {} bytes is too large", packet_length))
        })?;

        let mut buf = BytesMut::with_capacity(4 + packet_length + self.sealer.mac_size());
        buf.put_u32(packet_length_u32);
        buf.put_u8(pad as u8);
        buf.put_slice(&data);
        let mut padding = vec![0u8; pad];
        rng.fill_bytes(&mut padding);
        buf.put_slice(&padding);

        let mac = self.sealer.compute_mac(self.outgoing_seq, &buf);
        self.sealer.encrypt(&mut buf)?;
        buf.put_slice(&mac);

        trace!(msg_type, seq = self.outgoing_seq, len = buf.len(), "encoded packet");
        self.outgoing_seq = self.outgoing_seq.wrapping_add(1);
        self.bytes_since_rekey += buf.len() as u64;
        Ok(buf.to_vec())
    }

    /// Decodes at most one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `buf` only once a whole packet is available. After an
    /// error the codec state is undefined and the connection must be closed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        let block_size = self.opener.block_size();

        let first = match self.first_block.take() {
            Some(block) => block,
            None => {
                if buf.len() < block_size {
                    return Ok(None);
                }
                let mut block = buf[..block_size].to_vec();
                self.opener
                    .decrypt(&mut block)
                    .map_err(|e| DecodeError::Framing(e.to_string()))?;
                block
            }
        };

        let packet_length = u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
        if packet_length > self.max_packet_len {
            return Err(DecodeError::Framing(format!(
                "packet length {} exceeds maximum {}",
                packet_length, self.max_packet_len
            )));
        }
        if packet_length < 1 + MIN_PADDING_LEN + 1 {
            return Err(DecodeError::Framing(format!(
                "packet length {} too small",
                packet_length
            )));
        }
        if (4 + packet_length) % block_size != 0 {
            return Err(DecodeError::Framing(format!(
                "packet length {} not aligned to block size {}",
                packet_length, block_size
            )));
        }

        let mac_len = self.opener.mac_size();
        let total = 4 + packet_length + mac_len;
        if buf.len() < total {
            self.first_block = Some(first);
            return Ok(None);
        }

        let frame = buf.split_to(total);
        let mut plain = Vec::with_capacity(4 + packet_length);
        plain.extend_from_slice(&first);
        let mut rest = frame[block_size..4 + packet_length].to_vec();
        self.opener
            .decrypt(&mut rest)
            .map_err(|e| DecodeError::Framing(e.to_string()))?;
        plain.extend_from_slice(&rest);

        let sequence = self.incoming_seq;
        if !self
            .opener
            .verify_mac(sequence, &plain, &frame[4 + packet_length..])
        {
            return Err(DecodeError::Mac { sequence });
        }

        let pad = plain[4] as usize;
        if pad < MIN_PADDING_LEN {
            return Err(DecodeError::Framing(format!(
                "padding length {} below minimum {}",
                pad, MIN_PADDING_LEN
            )));
        }
        if pad + 1 >= packet_length {
            return Err(DecodeError::Framing(format!(
                "padding length {} leaves no payload in packet of {}",
                pad, packet_length
            )));
        }

        let compressed = &plain[5..4 + packet_length - pad];
        let data = if self.decompressor.is_active() {
            self.decompressor
                .decompress(compressed, self.max_packet_len)
                .map_err(|e| DecodeError::Compression(e.to_string()))?
        } else {
            compressed.to_vec()
        };
        if data.is_empty() {
            return Err(DecodeError::Framing("empty payload".to_string()));
        }

        self.incoming_seq = self.incoming_seq.wrapping_add(1);
        self.bytes_since_rekey += total as u64;
        trace!(msg_type = data[0], seq = sequence, len = total, "decoded packet");

        let msg_type = data[0];
        let mut payload = data;
        payload.remove(0);
        Ok(Some(Packet::new(msg_type, payload)))
    }

    /// Switches the outgoing direction to new keys.
    pub fn set_outgoing(&mut self, sealer: Sealer, compressor: Compressor) {
        self.sealer = sealer;
        self.compressor = compressor;
    }

    /// Switches the incoming direction to new keys.
    pub fn set_incoming(&mut self, opener: Opener, decompressor: Decompressor) {
        self.opener = opener;
        self.decompressor = decompressor;
    }

    /// Sequence number of the next packet we send.
    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_seq
    }

    /// Sequence number of the next packet we receive.
    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_seq
    }

    /// Active outgoing protection.
    pub fn sealer(&self) -> &Sealer {
        &self.sealer
    }

    /// Active incoming protection.
    pub fn opener(&self) -> &Opener {
        &self.opener
    }

    /// Bytes encoded plus decoded since the last [`reset_rekey_counter`](Self::reset_rekey_counter).
    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey
    }

    /// Restarts the byte count used for the automatic rekey limit.
    pub fn reset_rekey_counter(&mut self) {
        self.bytes_since_rekey = 0;
    }
}

impl fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketCodec")
            .field("sealer", &self.sealer)
            .field("opener", &self.opener)
            .field("compressor", &self.compressor)
            .field("decompressor", &self.decompressor)
            .field("outgoing_seq", &self.outgoing_seq)
            .field("incoming_seq", &self.incoming_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::config::Role;
    use crate::ssh::crypto::{CipherSuite, HashAlgorithm};
    use kiln_platform::mock::{FixedRandom, MockRandom};

    fn codec_pair(cipher: &str, mac: &str, compression: &str) -> (PacketCodec, PacketCodec) {
        let secret = [0x33u8; 128];
        let h = [0x44u8; 20];
        let mut client = CipherSuite::new(cipher, cipher, mac, mac).unwrap();
        let mut server = CipherSuite::new(cipher, cipher, mac, mac).unwrap();
        client
            .set_keys(&client.derive_keys(HashAlgorithm::Sha1, Role::Client, &secret, &h, &h))
            .unwrap();
        server
            .set_keys(&server.derive_keys(HashAlgorithm::Sha1, Role::Server, &secret, &h, &h))
            .unwrap();
        let (sealer, _) = client.into_halves().unwrap();
        let (_, opener) = server.into_halves().unwrap();

        let mut sender = PacketCodec::new(35000);
        let mut receiver = PacketCodec::new(35000);
        sender.set_outgoing(sealer, Compressor::new(compression).unwrap());
        receiver.set_incoming(opener, Decompressor::new(compression).unwrap());
        (sender, receiver)
    }

    fn round_trip(sender: &mut PacketCodec, receiver: &mut PacketCodec, msg_type: u8, payload: &[u8]) {
        let mut rng = MockRandom::new(1);
        let bytes = sender.encode(msg_type, payload, &mut rng).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let packet = receiver.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.msg_type(), msg_type);
        assert_eq!(packet.payload(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_padding_len() {
        assert_eq!(padding_len(1, 8), 10);
        assert_eq!(padding_len(3, 8), 8);
        assert_eq!(padding_len(7, 8), 4);
        assert_eq!(padding_len(0, 16), 11);
        assert_eq!(padding_len(8, 16), 19);
        for len in 0..200 {
            for bs in [8, 16] {
                let pad = padding_len(len, bs);
                assert!((MIN_PADDING_LEN..=MAX_PADDING_LEN).contains(&pad));
                assert_eq!((5 + len + pad) % bs, 0);
            }
        }
    }

    #[test]
    fn test_encode_layout_none() {
        let mut codec = PacketCodec::new(35000);
        let bytes = codec.encode(5, b"ssh-userauth", &mut FixedRandom(0xAB)).unwrap();
        // 1 type byte + 12 payload bytes + 6 padding
        let packet_length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + packet_length);
        assert_eq!((4 + packet_length) % 8, 0);
        let pad = bytes[4] as usize;
        assert!(pad >= MIN_PADDING_LEN);
        assert_eq!(bytes[5], 5);
        assert_eq!(&bytes[6..18], b"ssh-userauth");
        assert!(bytes[18..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_round_trip_none() {
        let mut sender = PacketCodec::new(35000);
        let mut receiver = PacketCodec::new(35000);
        for len in [0usize, 1, 7, 8, 100, 1000, 30000] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            round_trip(&mut sender, &mut receiver, 94, &payload);
        }
    }

    #[test]
    fn test_round_trip_protected() {
        for (cipher, mac) in [
            ("aes128-ctr", "hmac-sha1"),
            ("aes256-ctr", "hmac-sha2-512"),
            ("aes192-cbc", "hmac-sha2-256"),
            ("aes128-cbc", "none"),
            ("none", "hmac-sha1"),
        ] {
            let (mut sender, mut receiver) = codec_pair(cipher, mac, "none");
            for len in [0usize, 3, 15, 16, 1000] {
                round_trip(&mut sender, &mut receiver, 50, &vec![0x7E; len]);
            }
        }
    }

    #[test]
    fn test_round_trip_zlib() {
        let (mut sender, mut receiver) = codec_pair("aes128-ctr", "hmac-sha1", "zlib");
        round_trip(&mut sender, &mut receiver, 94, &[0x41; 5000]);
        round_trip(&mut sender, &mut receiver, 2, b"");
        round_trip(&mut sender, &mut receiver, 94, b"more data on the same stream");
    }

    #[test]
    fn test_encrypted_packet_alignment() {
        let (mut sender, _) = codec_pair("aes256-cbc", "hmac-sha1", "none");
        let mut rng = MockRandom::new(3);
        for len in 0..64 {
            let bytes = sender.encode(94, &vec![0; len], &mut rng).unwrap();
            assert_eq!((bytes.len() - 20) % 16, 0);
        }
    }

    #[test]
    fn test_partial_delivery() {
        let (mut sender, mut receiver) = codec_pair("aes128-ctr", "hmac-sha2-256", "none");
        let mut rng = MockRandom::new(9);
        let mut wire = sender.encode(94, b"first", &mut rng).unwrap();
        wire.extend(sender.encode(94, b"second", &mut rng).unwrap());

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire {
            buf.put_u8(byte);
            while let Some(packet) = receiver.decode(&mut buf).unwrap() {
                decoded.push(packet.into_payload());
            }
        }
        assert_eq!(decoded, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(receiver.incoming_sequence(), 2);
    }

    #[test]
    fn test_sequence_numbers_advance_and_wrap() {
        let mut sender = PacketCodec::new(35000);
        let mut receiver = PacketCodec::new(35000);
        for _ in 0..5 {
            round_trip(&mut sender, &mut receiver, 2, b"x");
        }
        assert_eq!(sender.outgoing_sequence(), 5);
        assert_eq!(receiver.incoming_sequence(), 5);
        assert_eq!(sender.incoming_sequence(), 0);

        sender.outgoing_seq = u32::MAX;
        receiver.incoming_seq = u32::MAX;
        round_trip(&mut sender, &mut receiver, 2, b"x");
        assert_eq!(sender.outgoing_sequence(), 0);
        assert_eq!(receiver.incoming_sequence(), 0);
    }

    #[test]
    fn test_mac_uses_sequence_number() {
        let (mut sender, mut receiver) = codec_pair("none", "hmac-sha1", "none");
        let mut rng = MockRandom::new(2);
        let bytes = sender.encode(94, b"data", &mut rng).unwrap();
        receiver.incoming_seq = 1;
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(
            receiver.decode(&mut buf),
            Err(DecodeError::Mac { sequence: 1 })
        );
    }

    #[test]
    fn test_bit_flip_never_decodes() {
        let (mut sender, _) = codec_pair("aes128-ctr", "hmac-sha1", "none");
        let mut rng = MockRandom::new(4);
        let bytes = sender.encode(94, b"integrity matters", &mut rng).unwrap();

        for bit in 0..bytes.len() * 8 {
            let (_, mut receiver) = codec_pair("aes128-ctr", "hmac-sha1", "none");
            let mut tampered = bytes.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            let mut buf = BytesMut::from(&tampered[..]);
            let result = receiver.decode(&mut buf);
            assert!(!matches!(result, Ok(Some(_))), "bit {} decoded", bit);
            if bit >= 32 {
                assert_eq!(result, Err(DecodeError::Mac { sequence: 0 }), "bit {}", bit);
            }
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut receiver = PacketCodec::new(35000);
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 4, 0, 0, 0][..]);
        match receiver.decode(&mut buf) {
            Err(err @ DecodeError::Framing(_)) => {
                assert_eq!(err.reason(), DisconnectReason::ProtocolError)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_misaligned_length_rejected() {
        let mut receiver = PacketCodec::new(35000);
        let mut buf = BytesMut::from(&[0, 0, 0, 13, 4, 0, 0, 0][..]);
        assert!(matches!(
            receiver.decode(&mut buf),
            Err(DecodeError::Framing(_))
        ));
    }

    #[test]
    fn test_short_padding_rejected() {
        let mut receiver = PacketCodec::new(35000);
        let mut buf = BytesMut::from(&[0, 0, 0, 12, 3, 94, 1, 2, 3, 4, 5, 6, 0, 0, 0, 0][..]);
        match receiver.decode(&mut buf) {
            Err(DecodeError::Framing(msg)) => assert!(msg.contains("padding")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_padding_swallowing_payload_rejected() {
        let mut receiver = PacketCodec::new(35000);
        let mut buf = BytesMut::from(&[0, 0, 0, 12, 11, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            receiver.decode(&mut buf),
            Err(DecodeError::Framing(_))
        ));
    }

    #[test]
    fn test_corrupt_compressed_data() {
        let (_, mut receiver) = codec_pair("none", "none", "zlib");
        let mut plain = PacketCodec::new(35000);
        let bytes = plain
            .encode(0xFF, &[0xFF; 10], &mut FixedRandom(0))
            .unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let err = receiver.decode(&mut buf).unwrap_err();
        assert_eq!(err.reason(), DisconnectReason::CompressionError);
    }

    #[test]
    fn test_decode_error_to_disconnect() {
        let disconnect: Disconnect = DecodeError::Mac { sequence: 4 }.into();
        assert_eq!(disconnect.reason, DisconnectReason::MacError);
        let disconnect: Disconnect = DecodeError::Compression("bad".into()).into();
        assert_eq!(disconnect.reason, DisconnectReason::CompressionError);
    }

    #[test]
    fn test_rekey_counter() {
        let mut sender = PacketCodec::new(35000);
        let mut receiver = PacketCodec::new(35000);
        round_trip(&mut sender, &mut receiver, 94, &[0; 100]);
        assert!(sender.bytes_since_rekey() > 100);
        assert_eq!(sender.bytes_since_rekey(), receiver.bytes_since_rekey());
        sender.reset_rekey_counter();
        assert_eq!(sender.bytes_since_rekey(), 0);
    }
}
