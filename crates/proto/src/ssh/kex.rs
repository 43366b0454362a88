//! SSH key exchange messages and algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT with its ten name-list slots
//! - SSH_MSG_NEWKEYS
//! - Algorithm negotiation (first client preference the server also lists)
//! - The extension markers carried in the KEX list (`ext-info-*`, strict KEX)
//!
//! The exchange itself lives in [`kex_driver`](super::kex_driver).
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::kex::{AlgorithmProposal, KexInit, NewKeys, Slot};
//!
//! let proposal = AlgorithmProposal::new()
//!     .with(Slot::Kex, ["curve25519-sha256"])
//!     .with(Slot::EncryptionC2s, ["aes128-ctr"]);
//! let kexinit = KexInit::new(proposal);
//! let bytes = kexinit.to_bytes();
//! assert_eq!(bytes[0], 20);
//!
//! let parsed = KexInit::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.kex_algorithms(), ["curve25519-sha256"]);
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::message::{expect_message, MessageType};
use crate::ssh::session::Role;
use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use latch_platform::{AlgorithmNegotiationFailure, LatchError, LatchResult};
use rand::RngCore;
use std::fmt;

/// Client marker announcing support for SSH_MSG_EXT_INFO (RFC 8308).
pub const EXT_INFO_CLIENT: &str = "ext-info-c";
/// Server marker announcing support for SSH_MSG_EXT_INFO (RFC 8308).
pub const EXT_INFO_SERVER: &str = "ext-info-s";
/// Client marker for strict key exchange.
pub const STRICT_KEX_CLIENT: &str = "kex-strict-c-v00@openssh.com";
/// Server marker for strict key exchange.
pub const STRICT_KEX_SERVER: &str = "kex-strict-s-v00@openssh.com";

/// True for names that only signal extensions and never select a KEX method.
pub fn is_kex_marker(name: &str) -> bool {
    matches!(
        name,
        EXT_INFO_CLIENT | EXT_INFO_SERVER | STRICT_KEX_CLIENT | STRICT_KEX_SERVER
    )
}

/// One of the ten KEXINIT negotiation slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    /// Key exchange method
    Kex,
    /// Server host key algorithm
    ServerHostKey,
    /// Cipher, client to server
    EncryptionC2s,
    /// Cipher, server to client
    EncryptionS2c,
    /// MAC, client to server
    MacC2s,
    /// MAC, server to client
    MacS2c,
    /// Compression, client to server
    CompressionC2s,
    /// Compression, server to client
    CompressionS2c,
    /// Language tag, client to server
    LanguageC2s,
    /// Language tag, server to client
    LanguageS2c,
}

impl Slot {
    /// All slots in KEXINIT order.
    pub const ALL: [Slot; 10] = [
        Slot::Kex,
        Slot::ServerHostKey,
        Slot::EncryptionC2s,
        Slot::EncryptionS2c,
        Slot::MacC2s,
        Slot::MacS2c,
        Slot::CompressionC2s,
        Slot::CompressionS2c,
        Slot::LanguageC2s,
        Slot::LanguageS2c,
    ];

    /// Diagnostic name, e.g. `encryption.c2s`.
    pub fn name(&self) -> &'static str {
        match self {
            Slot::Kex => "kex",
            Slot::ServerHostKey => "server_host_key",
            Slot::EncryptionC2s => "encryption.c2s",
            Slot::EncryptionS2c => "encryption.s2c",
            Slot::MacC2s => "mac.c2s",
            Slot::MacS2c => "mac.s2c",
            Slot::CompressionC2s => "compression.c2s",
            Slot::CompressionS2c => "compression.s2c",
            Slot::LanguageC2s => "language.c2s",
            Slot::LanguageS2c => "language.s2c",
        }
    }

    /// Looks a slot up by its diagnostic name.
    pub fn from_name(name: &str) -> Option<Slot> {
        Slot::ALL.iter().copied().find(|slot| slot.name() == name)
    }

    /// True for the two language slots.
    pub fn is_language(&self) -> bool {
        matches!(self, Slot::LanguageC2s | Slot::LanguageS2c)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered candidate names for every slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlgorithmProposal {
    lists: [Vec<String>; 10],
}

impl AlgorithmProposal {
    /// Empty proposal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one slot, builder style.
    pub fn with<I, S>(mut self, slot: Slot, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(slot, names.into_iter().map(Into::into).collect());
        self
    }

    /// Candidates for a slot, most preferred first.
    pub fn get(&self, slot: Slot) -> &[String] {
        &self.lists[slot.index()]
    }

    /// Replaces a slot's candidates.
    pub fn set(&mut self, slot: Slot, names: Vec<String>) {
        self.lists[slot.index()] = names;
    }

    /// Appends a name to a slot unless it is already there.
    pub fn append(&mut self, slot: Slot, name: &str) {
        let list = &mut self.lists[slot.index()];
        if !list.iter().any(|n| n == name) {
            list.push(name.to_string());
        }
    }

    /// True if a slot lists `name`.
    pub fn contains(&self, slot: Slot, name: &str) -> bool {
        self.get(slot).iter().any(|n| n == name)
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Name-lists for every slot
    proposal: AlgorithmProposal,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a fresh random cookie.
    pub fn new(proposal: AlgorithmProposal) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self {
            cookie,
            proposal,
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the proposal.
    pub fn proposal(&self) -> &AlgorithmProposal {
        &self.proposal
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        self.proposal.get(Slot::Kex)
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        self.proposal.get(Slot::ServerHostKey)
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Sets the first_kex_packet_follows flag.
    pub fn set_first_kex_packet_follows(&mut self, follows: bool) {
        self.first_kex_packet_follows = follows;
    }

    /// Serializes the KEXINIT message to bytes (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        for slot in Slot::ALL {
            buf.put_name_list(self.proposal.get(slot));
        }
        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::Protocol`] if the message type is wrong or any
    /// field is truncated.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut reader = WireReader::new(data);
        expect_message(&mut reader, MessageType::KexInit)?;

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(reader.read_bytes(16)?);

        let mut proposal = AlgorithmProposal::new();
        for slot in Slot::ALL {
            proposal.set(slot, reader.read_name_list()?);
        }
        let first_kex_packet_follows = reader.read_bool()?;
        // Reserved field; its value is ignored
        reader.read_u32()?;

        Ok(Self {
            cookie,
            proposal,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// After sending NEWKEYS the sender's outbound direction uses the new keys;
/// after receiving it the receiver's inbound direction does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        match data {
            [21] => Ok(Self),
            [] => Err(LatchError::Protocol("NEWKEYS message is empty".to_string())),
            [21, ..] => Err(LatchError::Protocol(format!(
                "NEWKEYS message has trailing data: {} bytes",
                data.len()
            ))),
            [other, ..] => Err(LatchError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                other
            ))),
        }
    }
}

/// Algorithms agreed on for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub server_host_key: String,
    /// Cipher, client to server
    pub encryption_c2s: String,
    /// Cipher, server to client
    pub encryption_s2c: String,
    /// MAC, client to server; `None` when the cipher is AEAD
    pub mac_c2s: Option<String>,
    /// MAC, server to client; `None` when the cipher is AEAD
    pub mac_s2c: Option<String>,
    /// Compression, client to server
    pub compression_c2s: String,
    /// Compression, server to client
    pub compression_s2c: String,
    /// Language, client to server
    pub language_c2s: Option<String>,
    /// Language, server to client
    pub language_s2c: Option<String>,
}

/// Picks the first client algorithm that the server also supports.
///
/// # Example
///
/// ```rust
/// use latch_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
/// assert_eq!(negotiate_algorithm(&client, &server).as_deref(), Some("aes256-ctr"));
/// ```
pub fn negotiate_algorithm(client: &[String], server: &[String]) -> Option<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
}

/// Negotiates one slot from our point of view.
///
/// The client's list decides preference regardless of which side we are.
fn negotiate_slot(
    role: Role,
    slot: Slot,
    local: &AlgorithmProposal,
    peer: &AlgorithmProposal,
) -> Result<String, AlgorithmNegotiationFailure> {
    let (client, server) = match role {
        Role::Client => (local.get(slot), peer.get(slot)),
        Role::Server => (peer.get(slot), local.get(slot)),
    };
    negotiate_algorithm(client, server).ok_or_else(|| AlgorithmNegotiationFailure {
        slot: slot.name().to_string(),
        local: local.get(slot).to_vec(),
        peer: peer.get(slot).to_vec(),
    })
}

fn negotiate_language(role: Role, slot: Slot, local: &AlgorithmProposal, peer: &AlgorithmProposal) -> Option<String> {
    let (client, server) = match role {
        Role::Client => (local.get(slot), peer.get(slot)),
        Role::Server => (peer.get(slot), local.get(slot)),
    };
    negotiate_algorithm(client, server)
}

/// Reduces two proposals to one set of algorithms.
///
/// `is_aead` reports whether a negotiated cipher carries its own
/// authentication; MAC negotiation is skipped for such directions.
///
/// # Errors
///
/// Returns [`LatchError::AlgorithmNegotiation`] naming the first slot without
/// a common entry, and [`LatchError::Protocol`] if the KEX slot agrees on an
/// extension marker.
pub fn negotiate(
    role: Role,
    local: &AlgorithmProposal,
    peer: &AlgorithmProposal,
    is_aead: impl Fn(&str) -> bool,
) -> LatchResult<NegotiatedAlgorithms> {
    let kex = negotiate_slot(role, Slot::Kex, local, peer)?;
    if is_kex_marker(&kex) {
        return Err(LatchError::Protocol(format!(
            "Negotiated key exchange is an extension marker: {}",
            kex
        )));
    }
    let server_host_key = negotiate_slot(role, Slot::ServerHostKey, local, peer)?;
    let encryption_c2s = negotiate_slot(role, Slot::EncryptionC2s, local, peer)?;
    let encryption_s2c = negotiate_slot(role, Slot::EncryptionS2c, local, peer)?;

    let mac_c2s = if is_aead(&encryption_c2s) {
        None
    } else {
        Some(negotiate_slot(role, Slot::MacC2s, local, peer)?)
    };
    let mac_s2c = if is_aead(&encryption_s2c) {
        None
    } else {
        Some(negotiate_slot(role, Slot::MacS2c, local, peer)?)
    };

    let compression_c2s = negotiate_slot(role, Slot::CompressionC2s, local, peer)?;
    let compression_s2c = negotiate_slot(role, Slot::CompressionS2c, local, peer)?;

    Ok(NegotiatedAlgorithms {
        kex,
        server_host_key,
        encryption_c2s,
        encryption_s2c,
        mac_c2s,
        mac_s2c,
        compression_c2s,
        compression_s2c,
        language_c2s: negotiate_language(role, Slot::LanguageC2s, local, peer),
        language_s2c: negotiate_language(role, Slot::LanguageS2c, local, peer),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn full(cipher: &str) -> AlgorithmProposal {
        AlgorithmProposal::new()
            .with(Slot::Kex, ["testkex"])
            .with(Slot::ServerHostKey, ["testhostkey"])
            .with(Slot::EncryptionC2s, [cipher])
            .with(Slot::EncryptionS2c, [cipher])
            .with(Slot::MacC2s, ["hmac-sha2-256"])
            .with(Slot::MacS2c, ["hmac-sha2-256"])
            .with(Slot::CompressionC2s, ["none"])
            .with(Slot::CompressionS2c, ["none"])
    }

    #[test]
    fn test_kexinit_roundtrip_preserves_every_slot() {
        let mut proposal = full("aes128-ctr");
        proposal.set(Slot::LanguageS2c, names(&["en-US"]));
        let mut kexinit = KexInit::new(proposal.clone());
        kexinit.set_first_kex_packet_follows(true);

        let parsed = KexInit::from_bytes(&kexinit.to_bytes()).unwrap();
        assert_eq!(parsed, kexinit);
        assert_eq!(parsed.proposal(), &proposal);
        assert!(parsed.first_kex_packet_follows());
    }

    #[test]
    fn test_kexinit_truncated() {
        let bytes = KexInit::new(full("aes128-ctr")).to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 2]).is_err());
        assert!(KexInit::from_bytes(&bytes[..10]).is_err());
        assert!(KexInit::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_kexinit_wrong_type() {
        let mut bytes = KexInit::new(full("aes128-ctr")).to_bytes();
        bytes[0] = 21;
        let err = KexInit::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("expected 20"));
    }

    #[test]
    fn test_newkeys() {
        assert_eq!(NewKeys::from_bytes(&[21]).unwrap(), NewKeys::new());
        assert!(NewKeys::from_bytes(&[]).is_err());
        assert!(NewKeys::from_bytes(&[20]).is_err());
        assert!(NewKeys::from_bytes(&[21, 0]).is_err());
    }

    #[test]
    fn test_negotiation_follows_client_order() {
        let client = names(&["b", "a", "c"]);
        let server = names(&["c", "a", "b"]);
        assert_eq!(negotiate_algorithm(&client, &server).as_deref(), Some("b"));
        assert_eq!(negotiate_algorithm(&client, &names(&["x"])), None);
        assert_eq!(negotiate_algorithm(&[], &server), None);
    }

    #[test]
    fn test_negotiate_by_role() {
        let local = full("aes128-ctr").with(Slot::EncryptionC2s, ["aes256-ctr", "aes128-ctr"]);
        let peer = full("aes128-ctr").with(Slot::EncryptionC2s, ["aes128-ctr", "aes256-ctr"]);

        let as_client = negotiate(Role::Client, &local, &peer, |_| false).unwrap();
        assert_eq!(as_client.encryption_c2s, "aes256-ctr");

        let as_server = negotiate(Role::Server, &local, &peer, |_| false).unwrap();
        assert_eq!(as_server.encryption_c2s, "aes128-ctr");
    }

    #[test]
    fn test_negotiation_failure_names_slot_and_lists() {
        let err = negotiate(Role::Client, &full("onlyA"), &full("onlyB"), |_| false).unwrap_err();
        match err {
            LatchError::AlgorithmNegotiation(failure) => {
                assert_eq!(failure.slot, "encryption.c2s");
                assert_eq!(failure.local, names(&["onlyA"]));
                assert_eq!(failure.peer, names(&["onlyB"]));
            }
            other => panic!("unexpected error: {}", other),
        }

        let err = negotiate(Role::Server, &full("onlyB"), &full("onlyA"), |_| false).unwrap_err();
        match err {
            LatchError::AlgorithmNegotiation(failure) => {
                assert_eq!(failure.slot, "encryption.c2s");
                assert_eq!(failure.local, names(&["onlyB"]));
                assert_eq!(failure.peer, names(&["onlyA"]));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_aead_skips_mac() {
        let local = full("aes128-gcm@openssh.com").with(Slot::MacC2s, ["hmac-sha1"]);
        let peer = full("aes128-gcm@openssh.com").with(Slot::MacC2s, ["hmac-sha2-512"]);
        let negotiated = negotiate(Role::Client, &local, &peer, |name| name.contains("gcm")).unwrap();
        assert_eq!(negotiated.mac_c2s, None);
        assert_eq!(negotiated.mac_s2c, None);
    }

    #[test]
    fn test_language_is_pass_through() {
        let local = full("aes128-ctr");
        let peer = full("aes128-ctr").with(Slot::LanguageC2s, ["fr"]);
        let negotiated = negotiate(Role::Client, &local, &peer, |_| false).unwrap();
        assert_eq!(negotiated.language_c2s, None);
    }

    #[test]
    fn test_marker_cannot_be_negotiated() {
        let local = full("aes128-ctr").with(Slot::Kex, [STRICT_KEX_CLIENT, "testkex"]);
        let peer = full("aes128-ctr").with(Slot::Kex, [STRICT_KEX_CLIENT, "testkex"]);
        assert!(matches!(
            negotiate(Role::Client, &local, &peer, |_| false),
            Err(LatchError::Protocol(_))
        ));
    }

    #[test]
    fn test_slot_names() {
        for slot in Slot::ALL {
            assert_eq!(Slot::from_name(slot.name()), Some(slot));
        }
        assert_eq!(Slot::from_name("cipher"), None);
        assert!(Slot::LanguageC2s.is_language());
    }
}
