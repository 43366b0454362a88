//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag
//! ```
//!
//! # Constraints
//!
//! - `padding_length` is at least 4 and the padding is random
//! - the framed packet is a multiple of the cipher block size (minimum 8);
//!   for AEAD ciphers and ETM MACs the length field is left out of the
//!   alignment because it travels outside the encrypted body
//! - a packet is at least 16 bytes
//! - inbound lengths are checked against a configured maximum before any
//!   buffer is sized from them
//!
//! # Direction state
//!
//! Encoding and decoding state are separate values: [`PacketEncoder`] is
//! owned by the single writer path and [`PacketDecoder`] by the single reader
//! path. New keys are handed to each through [`install`](PacketEncoder::install).
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use latch_proto::ssh::packet::{PacketDecoder, PacketEncoder};
//!
//! let mut encoder = PacketEncoder::new();
//! let mut decoder = PacketDecoder::new(256 * 1024);
//!
//! let mut wire = BytesMut::from(&encoder.encode(b"\x05hello").unwrap()[..]);
//! let packet = decoder.decode(&mut wire).unwrap().unwrap();
//! assert_eq!(packet.payload, b"\x05hello");
//! assert_eq!(packet.sequence_number, 0);
//! assert_eq!(encoder.sequence_number(), 1);
//! ```

use crate::ssh::compression::Compressor;
use crate::ssh::crypto::{CipherState, Mac};
use bytes::{BufMut, BytesMut};
use latch_platform::{LatchError, LatchResult};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default maximum inbound packet size in bytes, length field included.
pub const DEFAULT_MAX_PACKET_LEN: usize = 256 * 1024;

/// Minimum packet size in bytes.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Compression stage for one direction.
pub enum CompressionState {
    /// No compression
    None,
    /// `zlib@openssh.com` negotiated; waits for user authentication
    Delayed(Box<dyn Compressor>),
    /// Compressing every payload
    Active(Box<dyn Compressor>),
}

impl CompressionState {
    fn activate(&mut self) {
        if let CompressionState::Delayed(_) = self {
            if let CompressionState::Delayed(c) = std::mem::replace(self, CompressionState::None) {
                *self = CompressionState::Active(c);
            }
        }
    }

    /// True once payloads are being compressed.
    pub fn is_active(&self) -> bool {
        matches!(self, CompressionState::Active(_))
    }
}

impl std::fmt::Debug for CompressionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionState::None => f.write_str("None"),
            CompressionState::Delayed(_) => f.write_str("Delayed"),
            CompressionState::Active(_) => f.write_str("Active"),
        }
    }
}

/// Cipher, MAC and compression for one direction.
pub struct DirectionKeys {
    /// Active cipher
    pub cipher: CipherState,
    /// MAC; `None` for AEAD ciphers and before the first exchange
    pub mac: Option<Box<dyn Mac>>,
    /// MAC covers the ciphertext instead of the plaintext
    pub etm: bool,
    /// Compression stage
    pub compression: CompressionState,
}

impl DirectionKeys {
    /// Clear-text state used until the first NEWKEYS.
    pub fn plaintext() -> Self {
        Self {
            cipher: CipherState::none(),
            mac: None,
            etm: false,
            compression: CompressionState::None,
        }
    }

    fn mac_len(&self) -> usize {
        self.mac.as_ref().map_or(0, |m| m.mac_len())
    }

    /// The length field sits outside the aligned, encrypted body.
    fn length_in_clear(&self) -> bool {
        self.cipher.is_aead() || (self.etm && self.mac.is_some())
    }
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac_len", &self.mac_len())
            .field("etm", &self.etm)
            .field("compression", &self.compression)
            .finish()
    }
}

/// One decoded inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number the packet was received under
    pub sequence_number: u32,
    /// Decompressed payload; the first byte is the message number
    pub payload: Vec<u8>,
    /// Bytes the packet occupied on the wire
    pub wire_len: usize,
}

fn advance_sequence(seq: &mut u32, wrap_is_fatal: bool, direction: &str) -> LatchResult<()> {
    *seq = seq.wrapping_add(1);
    if *seq == 0 && wrap_is_fatal {
        return Err(LatchError::Protocol(format!(
            "{} sequence number wrapped during initial key exchange",
            direction
        )));
    }
    Ok(())
}

/// Outbound half of the packet codec.
#[derive(Debug)]
pub struct PacketEncoder {
    sequence_number: u32,
    keys: DirectionKeys,
    wrap_is_fatal: bool,
}

impl PacketEncoder {
    /// Clear-text encoder starting at sequence number 0.
    pub fn new() -> Self {
        Self {
            sequence_number: 0,
            keys: DirectionKeys::plaintext(),
            wrap_is_fatal: true,
        }
    }

    /// Sequence number the next packet will use.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Overrides the sequence number.
    pub fn set_sequence_number(&mut self, sequence_number: u32) {
        self.sequence_number = sequence_number;
    }

    /// Whether a sequence number wrap is an error. Set during the initial exchange.
    pub fn set_wrap_fatal(&mut self, fatal: bool) {
        self.wrap_is_fatal = fatal;
    }

    /// Switches to new keys; `reset_sequence` restarts numbering at zero.
    pub fn install(&mut self, keys: DirectionKeys, reset_sequence: bool) {
        self.keys = keys;
        if reset_sequence {
            self.sequence_number = 0;
        }
    }

    /// Turns on delayed compression.
    pub fn enable_delayed_compression(&mut self) {
        self.keys.compression.activate();
    }

    /// True once outbound payloads are compressed.
    pub fn compression_active(&self) -> bool {
        self.keys.compression.is_active()
    }

    /// Frames, encrypts and authenticates one payload.
    pub fn encode(&mut self, payload: &[u8]) -> LatchResult<Vec<u8>> {
        let compressed;
        let payload = match &mut self.keys.compression {
            CompressionState::Active(c) => {
                compressed = c.compress(payload)?;
                &compressed[..]
            }
            _ => payload,
        };

        let block_size = self.keys.cipher.block_size();
        let length_in_clear = self.keys.length_in_clear();

        let header_len = if length_in_clear { 1 } else { 5 };
        let aligned = header_len + payload.len();
        let mut padding_len = block_size - (aligned % block_size);
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }
        while 5 + payload.len() + padding_len < MIN_PACKET_SIZE {
            padding_len += block_size;
        }
        debug_assert!(padding_len <= MAX_PADDING_LEN);

        let packet_len = 1 + payload.len() + padding_len;
        let tag_len = match &self.keys.cipher {
            CipherState::Aead(c) => c.tag_len(),
            CipherState::Streaming(_) => self.keys.mac_len(),
        };

        let mut frame = BytesMut::with_capacity(4 + packet_len + tag_len);
        frame.put_u32(packet_len as u32);
        frame.put_u8(padding_len as u8);
        frame.put_slice(payload);
        let mut padding = [0u8; MAX_PADDING_LEN];
        rand::thread_rng().fill_bytes(&mut padding[..padding_len]);
        frame.put_slice(&padding[..padding_len]);

        let seq = self.sequence_number;
        match &mut self.keys.cipher {
            CipherState::Aead(cipher) => {
                frame.put_bytes(0, tag_len);
                cipher.seal(seq, &mut frame)?;
            }
            CipherState::Streaming(cipher) => match &self.keys.mac {
                Some(mac) if self.keys.etm => {
                    cipher.update(&mut frame[4..])?;
                    let tag = mac.compute(seq, &frame);
                    frame.put_slice(&tag);
                }
                Some(mac) => {
                    let tag = mac.compute(seq, &frame);
                    cipher.update(&mut frame)?;
                    frame.put_slice(&tag);
                }
                None => cipher.update(&mut frame)?,
            },
        }

        advance_sequence(&mut self.sequence_number, self.wrap_is_fatal, "Outgoing")?;
        Ok(frame.to_vec())
    }
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound half of the packet codec.
///
/// Fed incrementally: [`decode`](Self::decode) consumes complete packets from
/// the front of a buffer and returns `Ok(None)` when more bytes are needed.
#[derive(Debug)]
pub struct PacketDecoder {
    sequence_number: u32,
    keys: DirectionKeys,
    wrap_is_fatal: bool,
    max_packet_len: usize,
    /// Length and decrypted first block of a packet whose body is still arriving
    pending: Option<(usize, Vec<u8>)>,
}

impl PacketDecoder {
    /// Clear-text decoder accepting packets up to `max_packet_len` bytes.
    pub fn new(max_packet_len: usize) -> Self {
        Self {
            sequence_number: 0,
            keys: DirectionKeys::plaintext(),
            wrap_is_fatal: true,
            max_packet_len,
            pending: None,
        }
    }

    /// Sequence number expected on the next packet.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Overrides the sequence number.
    pub fn set_sequence_number(&mut self, sequence_number: u32) {
        self.sequence_number = sequence_number;
    }

    /// Whether a sequence number wrap is an error.
    pub fn set_wrap_fatal(&mut self, fatal: bool) {
        self.wrap_is_fatal = fatal;
    }

    /// Switches to new keys; `reset_sequence` restarts numbering at zero.
    pub fn install(&mut self, keys: DirectionKeys, reset_sequence: bool) {
        self.keys = keys;
        if reset_sequence {
            self.sequence_number = 0;
        }
    }

    /// Turns on delayed compression.
    pub fn enable_delayed_compression(&mut self) {
        self.keys.compression.activate();
    }

    fn check_length(&self, packet_len: usize, aligned_len: usize, block_size: usize) -> LatchResult<()> {
        if packet_len + 4 > self.max_packet_len {
            return Err(LatchError::Protocol(format!(
                "Packet length {} exceeds maximum {}",
                packet_len + 4,
                self.max_packet_len
            )));
        }
        if packet_len < 1 + MIN_PADDING_LEN {
            return Err(LatchError::Protocol(format!(
                "Packet length {} too small",
                packet_len
            )));
        }
        if aligned_len % block_size != 0 {
            return Err(LatchError::Protocol(format!(
                "Packet length {} not aligned to block size {}",
                packet_len, block_size
            )));
        }
        Ok(())
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole packet. Any
    /// error is fatal for the connection.
    pub fn decode(&mut self, buf: &mut BytesMut) -> LatchResult<Option<Packet>> {
        let seq = self.sequence_number;
        let block_size = self.keys.cipher.block_size();

        let (body, wire_len) = if self.keys.cipher.is_aead() {
            let tag_len = match &self.keys.cipher {
                CipherState::Aead(c) => c.tag_len(),
                CipherState::Streaming(_) => 0,
            };
            if buf.len() < 4 {
                return Ok(None);
            }
            let mut header = [0u8; 4];
            header.copy_from_slice(&buf[..4]);
            let length_bytes = match &self.keys.cipher {
                CipherState::Aead(c) => c.packet_length(seq, header),
                CipherState::Streaming(_) => header,
            };
            let packet_len = u32::from_be_bytes(length_bytes) as usize;
            self.check_length(packet_len, packet_len, block_size)?;

            let total = 4 + packet_len + tag_len;
            if buf.len() < total {
                return Ok(None);
            }
            let mut frame = buf.split_to(total);
            if let CipherState::Aead(c) = &mut self.keys.cipher {
                c.open(seq, &mut frame)?;
            }
            (frame[4..4 + packet_len].to_vec(), total)
        } else if self.keys.length_in_clear() {
            let mac_len = self.keys.mac_len();
            if buf.len() < 4 {
                return Ok(None);
            }
            let packet_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            self.check_length(packet_len, packet_len, block_size)?;

            let total = 4 + packet_len + mac_len;
            if buf.len() < total {
                return Ok(None);
            }
            let frame = buf.split_to(total);
            let (authenticated, tag) = frame.split_at(4 + packet_len);
            if let Some(mac) = &self.keys.mac {
                if !mac.verify(seq, authenticated, tag) {
                    return Err(LatchError::Security("MAC verification failed".to_string()));
                }
            }
            let mut body = authenticated[4..].to_vec();
            if let CipherState::Streaming(c) = &mut self.keys.cipher {
                c.update(&mut body)?;
            }
            (body, total)
        } else {
            let mac_len = self.keys.mac_len();
            if self.pending.is_none() {
                if buf.len() < block_size {
                    return Ok(None);
                }
                let mut first = buf.split_to(block_size).to_vec();
                if let CipherState::Streaming(c) = &mut self.keys.cipher {
                    c.update(&mut first)?;
                }
                let packet_len = u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
                self.check_length(packet_len, packet_len + 4, block_size)?;
                self.pending = Some((packet_len, first));
            }

            let Some((packet_len, _)) = &self.pending else {
                return Ok(None);
            };
            let packet_len = *packet_len;
            let remaining = 4 + packet_len - block_size;
            if buf.len() < remaining + mac_len {
                return Ok(None);
            }
            let Some((_, mut plaintext)) = self.pending.take() else {
                return Ok(None);
            };
            let mut rest = buf.split_to(remaining).to_vec();
            if let CipherState::Streaming(c) = &mut self.keys.cipher {
                c.update(&mut rest)?;
            }
            plaintext.extend_from_slice(&rest);

            let tag = buf.split_to(mac_len);
            if let Some(mac) = &self.keys.mac {
                if !mac.verify(seq, &plaintext, &tag) {
                    return Err(LatchError::Security("MAC verification failed".to_string()));
                }
            }
            let wire_len = plaintext.len() + mac_len;
            (plaintext.split_off(4), wire_len)
        };

        let padding_len = body[0] as usize;
        if padding_len < MIN_PADDING_LEN || padding_len + 1 > body.len() {
            return Err(LatchError::Protocol(format!(
                "Invalid padding length: {}",
                padding_len
            )));
        }
        let raw = &body[1..body.len() - padding_len];
        let payload = match &mut self.keys.compression {
            CompressionState::Active(c) => c.decompress(raw, self.max_packet_len)?,
            _ => raw.to_vec(),
        };
        if payload.is_empty() {
            return Err(LatchError::Protocol("Empty packet payload".to_string()));
        }

        advance_sequence(&mut self.sequence_number, self.wrap_is_fatal, "Incoming")?;
        Ok(Some(Packet {
            sequence_number: seq,
            payload,
            wire_len,
        }))
    }

    /// Reads from `reader` into `buf` until one packet is decoded.
    pub async fn read_packet<R>(&mut self, reader: &mut R, buf: &mut BytesMut) -> LatchResult<Packet>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(packet) = self.decode(buf)? {
                return Ok(packet);
            }
            if reader.read_buf(buf).await? == 0 {
                return Err(LatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::compression::new_zlib;
    use crate::ssh::crypto::{
        new_aes128_ctr, new_aes128_gcm, new_chacha20_poly1305, new_hmac_sha256, CipherMode,
    };

    fn ctr_keys(mode: CipherMode, etm: bool) -> DirectionKeys {
        DirectionKeys {
            cipher: new_aes128_ctr(&[1u8; 16], &[2u8; 16], mode).unwrap(),
            mac: Some(new_hmac_sha256(&[3u8; 32]).unwrap()),
            etm,
            compression: CompressionState::None,
        }
    }

    fn pair(enc: DirectionKeys, dec: DirectionKeys) -> (PacketEncoder, PacketDecoder) {
        let mut encoder = PacketEncoder::new();
        encoder.install(enc, false);
        let mut decoder = PacketDecoder::new(DEFAULT_MAX_PACKET_LEN);
        decoder.install(dec, false);
        (encoder, decoder)
    }

    fn exchange(encoder: &mut PacketEncoder, decoder: &mut PacketDecoder, payload: &[u8]) -> Vec<u8> {
        let mut wire = BytesMut::from(&encoder.encode(payload).unwrap()[..]);
        let packet = decoder.decode(&mut wire).unwrap().unwrap();
        assert!(wire.is_empty());
        packet.payload
    }

    #[test]
    fn test_plaintext_alignment_and_padding() {
        let mut encoder = PacketEncoder::new();
        for len in [1usize, 2, 7, 8, 100, 1000] {
            let wire = encoder.encode(&vec![9u8; len]).unwrap();
            assert_eq!(wire.len() % 8, 0);
            assert!(wire.len() >= MIN_PACKET_SIZE);
            let padding = wire[4] as usize;
            assert!(padding >= MIN_PADDING_LEN);
            assert_eq!(u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize, wire.len() - 4);
        }
    }

    #[test]
    fn test_streaming_roundtrip() {
        for etm in [false, true] {
            let (mut encoder, mut decoder) =
                pair(ctr_keys(CipherMode::Encrypt, etm), ctr_keys(CipherMode::Decrypt, etm));
            for payload in [&b"\x5e"[..], &[0x5eu8; 4096][..], &b"\x02hello world"[..]] {
                assert_eq!(exchange(&mut encoder, &mut decoder, payload), payload);
            }
            assert_eq!(encoder.sequence_number(), 3);
            assert_eq!(decoder.sequence_number(), 3);
        }
    }

    #[test]
    fn test_aead_roundtrip() {
        let gcm = |mode| DirectionKeys {
            cipher: new_aes128_gcm(&[4u8; 16], &[5u8; 12], mode).unwrap(),
            mac: None,
            etm: false,
            compression: CompressionState::None,
        };
        let (mut encoder, mut decoder) = pair(gcm(CipherMode::Encrypt), gcm(CipherMode::Decrypt));
        assert_eq!(exchange(&mut encoder, &mut decoder, b"\x5egcm"), b"\x5egcm");

        let chacha = |mode| DirectionKeys {
            cipher: new_chacha20_poly1305(&[6u8; 64], &[], mode).unwrap(),
            mac: None,
            etm: false,
            compression: CompressionState::None,
        };
        let (mut encoder, mut decoder) = pair(chacha(CipherMode::Encrypt), chacha(CipherMode::Decrypt));
        for _ in 0..3 {
            assert_eq!(exchange(&mut encoder, &mut decoder, b"\x5echacha"), b"\x5echacha");
        }
    }

    #[test]
    fn test_incremental_decode() {
        let (mut encoder, mut decoder) =
            pair(ctr_keys(CipherMode::Encrypt, false), ctr_keys(CipherMode::Decrypt, false));
        let wire = encoder.encode(&[0x5e; 300]).unwrap();

        let mut buf = BytesMut::new();
        for chunk in wire.chunks(7) {
            buf.extend_from_slice(chunk);
            if let Some(packet) = decoder.decode(&mut buf).unwrap() {
                assert_eq!(packet.payload, vec![0x5e; 300]);
                assert_eq!(packet.wire_len, wire.len());
                return;
            }
        }
        panic!("packet never completed");
    }

    #[test]
    fn test_tampering_is_fatal() {
        for etm in [false, true] {
            let (mut encoder, mut decoder) =
                pair(ctr_keys(CipherMode::Encrypt, etm), ctr_keys(CipherMode::Decrypt, etm));
            let mut wire = encoder.encode(b"\x5etamper me").unwrap();
            let last = wire.len() - 1;
            wire[last] ^= 1;
            let err = decoder.decode(&mut BytesMut::from(&wire[..])).unwrap_err();
            assert!(matches!(err, LatchError::Security(msg) if msg.contains("MAC")));
        }
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut decoder = PacketDecoder::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u32(0x7fff_fff0);
        buf.put_bytes(0, 12);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_bad_padding_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(12);
        buf.put_u8(2);
        buf.put_bytes(0x5e, 11);
        let err = PacketDecoder::new(1024).decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("padding"));
    }

    #[test]
    fn test_sequence_wraps_after_rekey() {
        let (mut encoder, mut decoder) =
            pair(ctr_keys(CipherMode::Encrypt, false), ctr_keys(CipherMode::Decrypt, false));
        encoder.set_wrap_fatal(false);
        decoder.set_wrap_fatal(false);
        encoder.set_sequence_number(u32::MAX);
        decoder.set_sequence_number(u32::MAX);

        exchange(&mut encoder, &mut decoder, b"\x5ea");
        assert_eq!(encoder.sequence_number(), 0);
        assert_eq!(decoder.sequence_number(), 0);
        exchange(&mut encoder, &mut decoder, b"\x5eb");
        assert_eq!(encoder.sequence_number(), 1);
    }

    #[test]
    fn test_sequence_wrap_fatal_during_initial_exchange() {
        let mut encoder = PacketEncoder::new();
        encoder.set_sequence_number(u32::MAX);
        let err = encoder.encode(b"\x14").unwrap_err();
        assert!(err.to_string().contains("wrapped"));
    }

    #[test]
    fn test_strict_reset_on_install() {
        let (mut encoder, _) =
            pair(ctr_keys(CipherMode::Encrypt, false), ctr_keys(CipherMode::Decrypt, false));
        encoder.encode(b"\x14").unwrap();
        encoder.install(ctr_keys(CipherMode::Encrypt, false), true);
        assert_eq!(encoder.sequence_number(), 0);
    }

    #[test]
    fn test_delayed_compression() {
        let zlib = || CompressionState::Delayed(new_zlib().unwrap());
        let mut encoder = PacketEncoder::new();
        encoder.install(
            DirectionKeys {
                compression: zlib(),
                ..DirectionKeys::plaintext()
            },
            false,
        );
        let mut decoder = PacketDecoder::new(DEFAULT_MAX_PACKET_LEN);
        decoder.install(
            DirectionKeys {
                compression: zlib(),
                ..DirectionKeys::plaintext()
            },
            false,
        );

        let payload = vec![0x5e; 5000];
        let before = encoder.encode(&payload).unwrap();
        assert!(before.len() > 5000);
        let mut wire = BytesMut::from(&before[..]);
        assert_eq!(decoder.decode(&mut wire).unwrap().unwrap().payload, payload);

        encoder.enable_delayed_compression();
        decoder.enable_delayed_compression();
        assert!(encoder.compression_active());
        let after = encoder.encode(&payload).unwrap();
        assert!(after.len() < 1000);
        let mut wire = BytesMut::from(&after[..]);
        assert_eq!(decoder.decode(&mut wire).unwrap().unwrap().payload, payload);
    }

    #[tokio::test]
    async fn test_read_packet_from_stream() {
        let mut encoder = PacketEncoder::new();
        let mut wire = encoder.encode(b"\x02one").unwrap();
        wire.extend(encoder.encode(b"\x02two").unwrap());

        let mut decoder = PacketDecoder::new(DEFAULT_MAX_PACKET_LEN);
        let mut reader = &wire[..];
        let mut buf = BytesMut::new();
        let first = decoder.read_packet(&mut reader, &mut buf).await.unwrap();
        let second = decoder.read_packet(&mut reader, &mut buf).await.unwrap();
        assert_eq!(first.payload, b"\x02one");
        assert_eq!(second.sequence_number, 1);
        assert!(decoder.read_packet(&mut reader, &mut buf).await.is_err());
    }
}
