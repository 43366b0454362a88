//! SSH cipher, MAC and hash primitives.
//!
//! This module provides the built-in algorithm implementations the packet
//! codec drives:
//! - `chacha20-poly1305@openssh.com` (AEAD, length field encrypted separately)
//! - `aes128-gcm@openssh.com`, `aes256-gcm@openssh.com` (AEAD, length in clear)
//! - `aes128-ctr`, `aes192-ctr`, `aes256-ctr` (stream ciphers with separate MAC)
//! - `hmac-sha1`, `hmac-sha2-256`, `hmac-sha2-512` and their ETM variants
//!
//! Every algorithm is reached through the [`StreamingCipher`], [`AeadCipher`]
//! or [`Mac`] traits so that the codec never needs to know which one was
//! negotiated.
//!
//! # Security
//!
//! - **Constant-time MAC checks** via [`subtle`]
//! - **Nonce management** - AES-GCM uses the RFC 5647 invocation counter,
//!   ChaCha20-Poly1305 derives its nonce from the packet sequence number
//! - **Key hygiene** - key material handed to constructors is never retained
//!   outside the cipher objects

use aes::{Aes128, Aes192, Aes256};
use cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac as _};
use latch_platform::{LatchError, LatchResult};
use ring::aead::chacha20_poly1305_openssh;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Which way a cipher instance transforms data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Outbound packets
    Encrypt,
    /// Inbound packets
    Decrypt,
}

/// Non-AEAD cipher applied to the whole packet, length field included.
///
/// Implementations keep their keystream or chaining state between calls, so
/// successive packets must be fed in order.
pub trait StreamingCipher: Send {
    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Encrypts or decrypts `data` in place, continuing the running state.
    fn update(&mut self, data: &mut [u8]) -> LatchResult<()>;
}

/// AEAD cipher that seals a complete packet and produces a tag.
pub trait AeadCipher: Send {
    /// Alignment unit for padding.
    fn block_size(&self) -> usize;

    /// Authentication tag length in bytes.
    fn tag_len(&self) -> usize;

    /// Recovers the plaintext packet length from the first four wire bytes.
    fn packet_length(&self, _sequence_number: u32, header: [u8; 4]) -> [u8; 4] {
        header
    }

    /// Encrypts `frame[..len - tag_len]` in place and writes the tag into the last `tag_len` bytes.
    ///
    /// The first four bytes of the frame are the packet length.
    fn seal(&mut self, sequence_number: u32, frame: &mut [u8]) -> LatchResult<()>;

    /// Verifies the trailing tag and decrypts the packet body in place.
    ///
    /// On success `frame[4..len - tag_len]` holds the plaintext.
    fn open(&mut self, sequence_number: u32, frame: &mut [u8]) -> LatchResult<()>;
}

/// Active cipher for one direction.
pub enum CipherState {
    /// Stream or block cipher with a separate MAC
    Streaming(Box<dyn StreamingCipher>),
    /// Authenticated cipher
    Aead(Box<dyn AeadCipher>),
}

impl CipherState {
    /// Block size used for padding, never below 8.
    pub fn block_size(&self) -> usize {
        let size = match self {
            CipherState::Streaming(c) => c.block_size(),
            CipherState::Aead(c) => c.block_size(),
        };
        size.max(8)
    }

    /// True for AEAD ciphers.
    pub fn is_aead(&self) -> bool {
        matches!(self, CipherState::Aead(_))
    }

    /// The `none` cipher used before the first key exchange.
    pub fn none() -> Self {
        CipherState::Streaming(Box::new(NoneCipher))
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherState::Streaming(c) => f
                .debug_struct("Streaming")
                .field("block_size", &c.block_size())
                .finish_non_exhaustive(),
            CipherState::Aead(c) => f
                .debug_struct("Aead")
                .field("tag_len", &c.tag_len())
                .finish_non_exhaustive(),
        }
    }
}

/// Identity cipher.
#[derive(Debug)]
pub struct NoneCipher;

impl StreamingCipher for NoneCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn update(&mut self, _data: &mut [u8]) -> LatchResult<()> {
        Ok(())
    }
}

/// Constructor for the `none` cipher.
pub fn new_none(_key: &[u8], _iv: &[u8], _mode: CipherMode) -> LatchResult<CipherState> {
    Ok(CipherState::none())
}

struct CtrCipher<C> {
    inner: C,
}

impl<C: StreamCipher + Send> StreamingCipher for CtrCipher<C> {
    fn block_size(&self) -> usize {
        16
    }

    fn update(&mut self, data: &mut [u8]) -> LatchResult<()> {
        self.inner.apply_keystream(data);
        Ok(())
    }
}

fn new_ctr<C>(key: &[u8], iv: &[u8]) -> LatchResult<CipherState>
where
    C: KeyIvInit + StreamCipher + Send + 'static,
{
    let inner = C::new_from_slices(key, iv)
        .map_err(|_| LatchError::Security("Invalid AES-CTR key or IV length".to_string()))?;
    Ok(CipherState::Streaming(Box::new(CtrCipher { inner })))
}

/// Constructor for `aes128-ctr`.
pub fn new_aes128_ctr(key: &[u8], iv: &[u8], _mode: CipherMode) -> LatchResult<CipherState> {
    new_ctr::<Aes128Ctr>(key, iv)
}

/// Constructor for `aes192-ctr`.
pub fn new_aes192_ctr(key: &[u8], iv: &[u8], _mode: CipherMode) -> LatchResult<CipherState> {
    new_ctr::<Aes192Ctr>(key, iv)
}

/// Constructor for `aes256-ctr`.
pub fn new_aes256_ctr(key: &[u8], iv: &[u8], _mode: CipherMode) -> LatchResult<CipherState> {
    new_ctr::<Aes256Ctr>(key, iv)
}

/// AES-GCM as used by OpenSSH (RFC 5647).
///
/// The 12-byte nonce is a fixed 4-byte field followed by a 64-bit invocation
/// counter that is incremented after every packet.
struct AesGcm {
    key: LessSafeKey,
    nonce: [u8; 12],
}

impl AesGcm {
    fn next_nonce(&mut self) -> Nonce {
        let current = Nonce::assume_unique_for_key(self.nonce);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.nonce[4..]);
        let next = u64::from_be_bytes(counter).wrapping_add(1);
        self.nonce[4..].copy_from_slice(&next.to_be_bytes());
        current
    }
}

impl AeadCipher for AesGcm {
    fn block_size(&self) -> usize {
        16
    }

    fn tag_len(&self) -> usize {
        16
    }

    fn seal(&mut self, _sequence_number: u32, frame: &mut [u8]) -> LatchResult<()> {
        let nonce = self.next_nonce();
        let tag_start = frame.len() - 16;
        let (body, tag_out) = frame.split_at_mut(tag_start);
        let (length, plaintext) = body.split_at_mut(4);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(&length[..]), plaintext)
            .map_err(|_| LatchError::Security("AES-GCM encryption failed".to_string()))?;
        tag_out.copy_from_slice(tag.as_ref());
        Ok(())
    }

    fn open(&mut self, _sequence_number: u32, frame: &mut [u8]) -> LatchResult<()> {
        let nonce = self.next_nonce();
        let (length, ciphertext_and_tag) = frame.split_at_mut(4);
        self.key
            .open_in_place(nonce, Aad::from(&length[..]), ciphertext_and_tag)
            .map_err(|_| LatchError::Security("AES-GCM tag verification failed".to_string()))?;
        Ok(())
    }
}

fn new_gcm(
    algorithm: &'static ring::aead::Algorithm,
    key: &[u8],
    iv: &[u8],
) -> LatchResult<CipherState> {
    let unbound = UnboundKey::new(algorithm, key)
        .map_err(|_| LatchError::Security("Invalid AES-GCM key length".to_string()))?;
    let nonce: [u8; 12] = iv
        .get(..12)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| LatchError::Security("AES-GCM requires a 12-byte IV".to_string()))?;
    Ok(CipherState::Aead(Box::new(AesGcm {
        key: LessSafeKey::new(unbound),
        nonce,
    })))
}

/// Constructor for `aes128-gcm@openssh.com`.
pub fn new_aes128_gcm(key: &[u8], iv: &[u8], _mode: CipherMode) -> LatchResult<CipherState> {
    new_gcm(&AES_128_GCM, key, iv)
}

/// Constructor for `aes256-gcm@openssh.com`.
pub fn new_aes256_gcm(key: &[u8], iv: &[u8], _mode: CipherMode) -> LatchResult<CipherState> {
    new_gcm(&AES_256_GCM, key, iv)
}

enum ChaChaKey {
    Sealing(chacha20_poly1305_openssh::SealingKey),
    Opening(chacha20_poly1305_openssh::OpeningKey),
}

/// `chacha20-poly1305@openssh.com`.
///
/// The 64-byte key holds the payload key followed by the length-field key.
struct ChaCha20Poly1305 {
    key: ChaChaKey,
}

impl AeadCipher for ChaCha20Poly1305 {
    fn block_size(&self) -> usize {
        8
    }

    fn tag_len(&self) -> usize {
        chacha20_poly1305_openssh::TAG_LEN
    }

    fn packet_length(&self, sequence_number: u32, header: [u8; 4]) -> [u8; 4] {
        match &self.key {
            ChaChaKey::Opening(key) => key.decrypt_packet_length(sequence_number, header),
            ChaChaKey::Sealing(_) => header,
        }
    }

    fn seal(&mut self, sequence_number: u32, frame: &mut [u8]) -> LatchResult<()> {
        let ChaChaKey::Sealing(key) = &self.key else {
            return Err(LatchError::Security(
                "ChaCha20-Poly1305 key is not set up for sealing".to_string(),
            ));
        };
        let tag_start = frame.len() - chacha20_poly1305_openssh::TAG_LEN;
        let (packet, tag_out) = frame.split_at_mut(tag_start);
        let mut tag = [0u8; chacha20_poly1305_openssh::TAG_LEN];
        key.seal_in_place(sequence_number, packet, &mut tag);
        tag_out.copy_from_slice(&tag);
        Ok(())
    }

    fn open(&mut self, sequence_number: u32, frame: &mut [u8]) -> LatchResult<()> {
        let ChaChaKey::Opening(key) = &self.key else {
            return Err(LatchError::Security(
                "ChaCha20-Poly1305 key is not set up for opening".to_string(),
            ));
        };
        let tag_start = frame.len() - chacha20_poly1305_openssh::TAG_LEN;
        let (packet, tag_in) = frame.split_at_mut(tag_start);
        let mut tag = [0u8; chacha20_poly1305_openssh::TAG_LEN];
        tag.copy_from_slice(tag_in);
        key.open_in_place(sequence_number, packet, &tag).map_err(|_| {
            LatchError::Security("ChaCha20-Poly1305 tag verification failed".to_string())
        })?;
        Ok(())
    }
}

/// Constructor for `chacha20-poly1305@openssh.com`.
pub fn new_chacha20_poly1305(key: &[u8], _iv: &[u8], mode: CipherMode) -> LatchResult<CipherState> {
    let material: &[u8; chacha20_poly1305_openssh::KEY_LEN] = key
        .get(..chacha20_poly1305_openssh::KEY_LEN)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| {
            LatchError::Security("ChaCha20-Poly1305 requires a 64-byte key".to_string())
        })?;
    let key = match mode {
        CipherMode::Encrypt => {
            ChaChaKey::Sealing(chacha20_poly1305_openssh::SealingKey::new(material))
        }
        CipherMode::Decrypt => {
            ChaChaKey::Opening(chacha20_poly1305_openssh::OpeningKey::new(material))
        }
    };
    Ok(CipherState::Aead(Box::new(ChaCha20Poly1305 { key })))
}

/// Message authentication code over `sequence_number || data`.
pub trait Mac: Send {
    /// Tag length in bytes.
    fn mac_len(&self) -> usize;

    /// Computes the tag.
    fn compute(&self, sequence_number: u32, data: &[u8]) -> Vec<u8>;

    /// Checks a received tag in constant time.
    fn verify(&self, sequence_number: u32, data: &[u8], tag: &[u8]) -> bool {
        let expected = self.compute(sequence_number, data);
        expected.len() == tag.len() && bool::from(expected.ct_eq(tag))
    }
}

struct HmacMac<M> {
    mac: M,
    len: usize,
}

impl<M> Mac for HmacMac<M>
where
    M: hmac::Mac + Clone + Send,
{
    fn mac_len(&self) -> usize {
        self.len
    }

    fn compute(&self, sequence_number: u32, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(&sequence_number.to_be_bytes());
        mac.update(data);
        let out = mac.finalize().into_bytes();
        out[..self.len].to_vec()
    }
}

fn new_hmac<M>(key: &[u8], len: usize) -> LatchResult<Box<dyn Mac>>
where
    M: hmac::Mac + hmac::digest::KeyInit + Clone + Send + 'static,
{
    let mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .map_err(|_| LatchError::Security("Invalid HMAC key length".to_string()))?;
    Ok(Box::new(HmacMac { mac, len }))
}

/// Constructor for `hmac-sha1` and `hmac-sha1-etm@openssh.com`.
pub fn new_hmac_sha1(key: &[u8]) -> LatchResult<Box<dyn Mac>> {
    new_hmac::<Hmac<Sha1>>(key, 20)
}

/// Constructor for `hmac-sha2-256` and `hmac-sha2-256-etm@openssh.com`.
pub fn new_hmac_sha256(key: &[u8]) -> LatchResult<Box<dyn Mac>> {
    new_hmac::<Hmac<Sha256>>(key, 32)
}

/// Constructor for `hmac-sha2-512` and `hmac-sha2-512-etm@openssh.com`.
pub fn new_hmac_sha512(key: &[u8]) -> LatchResult<Box<dyn Mac>> {
    new_hmac::<Hmac<Sha512>>(key, 64)
}

/// Hash function used by a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            HashAlgorithm::Sha1 => run::<Sha1>(parts),
            HashAlgorithm::Sha256 => run::<Sha256>(parts),
            HashAlgorithm::Sha384 => run::<Sha384>(parts),
            HashAlgorithm::Sha512 => run::<Sha512>(parts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming(state: CipherState) -> Box<dyn StreamingCipher> {
        match state {
            CipherState::Streaming(c) => c,
            CipherState::Aead(_) => panic!("expected a streaming cipher"),
        }
    }

    fn aead(state: CipherState) -> Box<dyn AeadCipher> {
        match state {
            CipherState::Aead(c) => c,
            CipherState::Streaming(_) => panic!("expected an AEAD cipher"),
        }
    }

    #[test]
    fn test_aes_ctr_keystream_continues() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut enc = streaming(new_aes128_ctr(&key, &iv, CipherMode::Encrypt).unwrap());
        let mut dec = streaming(new_aes128_ctr(&key, &iv, CipherMode::Decrypt).unwrap());

        let mut first = b"first packet data".to_vec();
        let mut second = b"second packet".to_vec();
        enc.update(&mut first).unwrap();
        enc.update(&mut second).unwrap();
        assert_ne!(&first[..], b"first packet data");

        dec.update(&mut first).unwrap();
        dec.update(&mut second).unwrap();
        assert_eq!(&first[..], b"first packet data");
        assert_eq!(&second[..], b"second packet");
    }

    #[test]
    fn test_aes_ctr_rejects_bad_key() {
        assert!(new_aes256_ctr(&[0u8; 16], &[0u8; 16], CipherMode::Encrypt).is_err());
        assert!(new_aes192_ctr(&[0u8; 24], &[0u8; 16], CipherMode::Encrypt).is_ok());
    }

    #[test]
    fn test_aes_gcm_seal_open() {
        let key = [1u8; 32];
        let iv = [2u8; 12];
        let mut sealer = aead(new_aes256_gcm(&key, &iv, CipherMode::Encrypt).unwrap());
        let mut opener = aead(new_aes256_gcm(&key, &iv, CipherMode::Decrypt).unwrap());

        for round in 0..3u8 {
            let mut frame = vec![0, 0, 0, 16];
            frame.extend_from_slice(&[round; 16]);
            frame.extend_from_slice(&[0u8; 16]);
            sealer.seal(0, &mut frame).unwrap();
            assert_eq!(&frame[..4], &[0, 0, 0, 16]);
            assert_ne!(&frame[4..20], &[round; 16]);

            opener.open(0, &mut frame).unwrap();
            assert_eq!(&frame[4..20], &[round; 16]);
        }
    }

    #[test]
    fn test_aes_gcm_detects_tampering() {
        let key = [1u8; 16];
        let iv = [2u8; 12];
        let mut sealer = aead(new_aes128_gcm(&key, &iv, CipherMode::Encrypt).unwrap());
        let mut opener = aead(new_aes128_gcm(&key, &iv, CipherMode::Decrypt).unwrap());

        let mut frame = vec![0, 0, 0, 16];
        frame.extend_from_slice(&[5u8; 16]);
        frame.extend_from_slice(&[0u8; 16]);
        sealer.seal(0, &mut frame).unwrap();
        // The clear-text length is authenticated
        frame[3] ^= 1;
        assert!(opener.open(0, &mut frame).is_err());
    }

    #[test]
    fn test_chacha20_poly1305_roundtrip() {
        let key = [3u8; 64];
        let mut sealer = aead(new_chacha20_poly1305(&key, &[], CipherMode::Encrypt).unwrap());
        let mut opener = aead(new_chacha20_poly1305(&key, &[], CipherMode::Decrypt).unwrap());

        let mut frame = vec![0, 0, 0, 8];
        frame.extend_from_slice(b"abcdefgh");
        frame.extend_from_slice(&[0u8; 16]);
        sealer.seal(42, &mut frame).unwrap();
        assert_ne!(&frame[..4], &[0, 0, 0, 8]);

        let header = [frame[0], frame[1], frame[2], frame[3]];
        assert_eq!(opener.packet_length(42, header), [0, 0, 0, 8]);
        opener.open(42, &mut frame).unwrap();
        assert_eq!(&frame[4..12], b"abcdefgh");
    }

    #[test]
    fn test_chacha20_poly1305_wrong_sequence_fails() {
        let key = [3u8; 64];
        let mut sealer = aead(new_chacha20_poly1305(&key, &[], CipherMode::Encrypt).unwrap());
        let mut opener = aead(new_chacha20_poly1305(&key, &[], CipherMode::Decrypt).unwrap());

        let mut frame = vec![0, 0, 0, 8];
        frame.extend_from_slice(b"abcdefgh");
        frame.extend_from_slice(&[0u8; 16]);
        sealer.seal(1, &mut frame).unwrap();
        assert!(opener.open(2, &mut frame).is_err());
    }

    #[test]
    fn test_hmac_lengths_and_verify() {
        let sha1 = new_hmac_sha1(&[0u8; 20]).unwrap();
        let sha256 = new_hmac_sha256(&[0u8; 32]).unwrap();
        let sha512 = new_hmac_sha512(&[0u8; 64]).unwrap();
        assert_eq!(sha1.mac_len(), 20);
        assert_eq!(sha256.mac_len(), 32);
        assert_eq!(sha512.mac_len(), 64);

        let tag = sha256.compute(5, b"payload");
        assert_eq!(tag.len(), 32);
        assert!(sha256.verify(5, b"payload", &tag));
        // Sequence number is part of the input
        assert!(!sha256.verify(6, b"payload", &tag));
        assert!(!sha256.verify(5, b"payload", &tag[..31]));
    }

    #[test]
    fn test_hash_algorithm() {
        let joined = HashAlgorithm::Sha256.digest(&[b"ab", b"c"]);
        assert_eq!(joined, HashAlgorithm::Sha256.digest(&[b"abc"]));
        assert_eq!(joined.len(), HashAlgorithm::Sha256.output_len());
        assert_eq!(HashAlgorithm::Sha1.digest(&[b""]).len(), 20);
        assert_eq!(HashAlgorithm::Sha512.digest(&[b""]).len(), 64);
    }

    #[test]
    fn test_none_cipher() {
        let state = CipherState::none();
        assert_eq!(state.block_size(), 8);
        assert!(!state.is_aead());
    }
}
