//! Key exchange driver (RFC 4253 Sections 7 to 9).
//!
//! Runs one complete exchange over a [`KexTransport`]: KEXINIT swap,
//! negotiation, the method-specific messages, host key verification, key
//! derivation and NEWKEYS. The same code drives the initial exchange and
//! every rekey, for both roles.
//!
//! Method-specific messages are produced by a [`KexMethod`], which only sees
//! the narrow [`KexContext`] and never the transport itself.

use crate::ssh::crypto::{CipherMode, HashAlgorithm};
use crate::ssh::hostkey::{HostKeyCheck, HostKeyDecision, HostKeySigner};
use crate::ssh::kex::{
    negotiate, KexInit, NegotiatedAlgorithms, Slot, EXT_INFO_CLIENT, STRICT_KEX_CLIENT,
    STRICT_KEX_SERVER,
};
use crate::ssh::config::TransportConfig;
use crate::ssh::packet::{CompressionState, DirectionKeys};
use crate::ssh::registry::AlgorithmRegistry;
use crate::ssh::session::Role;
use crate::ssh::wire::WireWrite;
use async_trait::async_trait;
use latch_platform::{LatchError, LatchResult};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Message exchange available to a KEX method.
#[async_trait]
pub trait KexChannel: Send {
    /// Sends one method-specific message (numbers 30 to 49).
    async fn send_kex(&mut self, payload: Vec<u8>) -> LatchResult<()>;

    /// Receives the next method-specific message.
    async fn recv_kex(&mut self) -> LatchResult<Vec<u8>>;
}

/// Transport operations the driver needs around the method messages.
#[async_trait]
pub trait KexTransport: KexChannel {
    /// Sends our KEXINIT and holds back non-KEX traffic until NEWKEYS.
    async fn send_kexinit(&mut self, payload: Vec<u8>) -> LatchResult<()>;

    /// Receives the peer's KEXINIT with its sequence number.
    async fn recv_kexinit(&mut self) -> LatchResult<(Vec<u8>, u32)>;

    /// While set, any non-KEX message from the peer is fatal.
    fn set_strict(&mut self, strict: bool);

    /// Sends NEWKEYS and switches outbound keys.
    async fn send_newkeys(&mut self, keys: DirectionKeys, reset_sequence: bool) -> LatchResult<()>;

    /// Waits for the peer's NEWKEYS.
    async fn recv_newkeys(&mut self) -> LatchResult<()>;

    /// Switches inbound keys, right after the peer's NEWKEYS.
    fn install_inbound(&mut self, keys: DirectionKeys, reset_sequence: bool);
}

/// One key exchange method.
///
/// A fresh instance is built from the registry for every exchange.
#[async_trait]
pub trait KexMethod: Send {
    /// Hash used for the exchange hash and key derivation.
    fn hash(&self) -> HashAlgorithm;

    /// Runs the method messages and returns the shared secret and exchange hash.
    async fn run(&mut self, ctx: &mut KexContext<'_>) -> LatchResult<KexOutput>;
}

/// What a [`KexMethod`] produces.
pub struct KexOutput {
    /// Shared secret K as a big-endian magnitude
    pub shared_secret: Zeroizing<Vec<u8>>,
    /// Exchange hash H
    pub exchange_hash: Vec<u8>,
    /// Server host key blob K_S
    pub host_key_blob: Vec<u8>,
    /// Signature over H sent by the server
    pub signature: Vec<u8>,
}

impl std::fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutput")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .field("host_key_blob_len", &self.host_key_blob.len())
            .finish_non_exhaustive()
    }
}

/// Inputs to the exchange hash that precede the method-specific part.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTranscript<'a> {
    /// V_C without CR LF
    pub client_version: &'a [u8],
    /// V_S without CR LF
    pub server_version: &'a [u8],
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: &'a [u8],
}

impl HandshakeTranscript<'_> {
    /// H = HASH(V_C || V_S || I_C || I_S || K_S || method inputs || K).
    ///
    /// `method_inputs` is already encoded, e.g. `string Q_C || string Q_S`
    /// for ECDH or `mpint e || mpint f` for finite-field DH.
    pub fn exchange_hash(
        &self,
        hash: HashAlgorithm,
        host_key_blob: &[u8],
        method_inputs: &[u8],
        shared_secret: &[u8],
    ) -> Vec<u8> {
        let mut buf = Zeroizing::new(Vec::with_capacity(
            self.client_kexinit.len() + self.server_kexinit.len() + 1024,
        ));
        buf.put_string(self.client_version);
        buf.put_string(self.server_version);
        buf.put_string(self.client_kexinit);
        buf.put_string(self.server_kexinit);
        buf.put_string(host_key_blob);
        buf.extend_from_slice(method_inputs);
        buf.put_mpint(shared_secret);
        hash.digest(&[buf.as_slice()])
    }
}

/// Narrow view of the exchange handed to a [`KexMethod`].
pub struct KexContext<'a> {
    role: Role,
    channel: &'a mut (dyn KexChannel + Send),
    transcript: HandshakeTranscript<'a>,
    signer: Option<&'a dyn HostKeySigner>,
    host_key_algorithm: &'a str,
}

impl<'a> KexContext<'a> {
    /// Creates a context over `channel`.
    pub fn new(
        role: Role,
        channel: &'a mut (dyn KexChannel + Send),
        transcript: HandshakeTranscript<'a>,
        signer: Option<&'a dyn HostKeySigner>,
        host_key_algorithm: &'a str,
    ) -> Self {
        Self {
            role,
            channel,
            transcript,
            signer,
            host_key_algorithm,
        }
    }

    /// Our role in the exchange.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated host key algorithm.
    pub fn host_key_algorithm(&self) -> &str {
        self.host_key_algorithm
    }

    /// Sends one method message.
    pub async fn send(&mut self, payload: Vec<u8>) -> LatchResult<()> {
        self.channel.send_kex(payload).await
    }

    /// Receives one method message.
    pub async fn recv(&mut self) -> LatchResult<Vec<u8>> {
        self.channel.recv_kex().await
    }

    /// Computes H over the handshake transcript and the method inputs.
    pub fn exchange_hash(
        &self,
        hash: HashAlgorithm,
        host_key_blob: &[u8],
        method_inputs: &[u8],
        shared_secret: &[u8],
    ) -> Vec<u8> {
        self.transcript
            .exchange_hash(hash, host_key_blob, method_inputs, shared_secret)
    }

    /// Host key for signing H (server role only).
    pub fn signer(&self) -> LatchResult<&'a dyn HostKeySigner> {
        match (self.role, self.signer) {
            (Role::Server, Some(signer)) => Ok(signer),
            _ => Err(LatchError::Protocol(
                "No host key available for signing".to_string(),
            )),
        }
    }
}

/// Parameters of one exchange.
pub struct KexSetup<'a> {
    /// Our role
    pub role: Role,
    /// First exchange on this connection
    pub initial: bool,
    /// User authentication already succeeded
    pub authenticated: bool,
    /// Strict mode agreed on by an earlier exchange
    pub strict: bool,
    /// Session settings
    pub config: &'a TransportConfig,
    /// Our identification line
    pub local_version: &'a str,
    /// Peer identification line
    pub peer_version: &'a str,
    /// Session identifier from the first exchange; `None` on the first
    pub session_id: Option<&'a [u8]>,
    /// Server host key accepted by the first exchange
    pub previous_host_key: Option<&'a [u8]>,
    /// Peer KEXINIT that arrived before the exchange started
    pub peer_kexinit: Option<(Vec<u8>, u32)>,
}

/// Result of one completed exchange.
#[derive(Debug, Clone)]
pub struct KexOutcome {
    /// Algorithms now in use
    pub negotiated: NegotiatedAlgorithms,
    /// Exchange hash of this exchange
    pub exchange_hash: Vec<u8>,
    /// Session identifier (H of the first exchange)
    pub session_id: Vec<u8>,
    /// Server host key blob
    pub host_key: Vec<u8>,
    /// Strict key exchange in effect
    pub strict: bool,
    /// Peer asked for SSH_MSG_EXT_INFO (server role, first exchange)
    pub send_ext_info: bool,
}

/// Encryption keys A to F (RFC 4253 Section 7.2).
pub struct SessionKeys {
    /// Initial IV client to server
    pub iv_c2s: Zeroizing<Vec<u8>>,
    /// Initial IV server to client
    pub iv_s2c: Zeroizing<Vec<u8>>,
    /// Encryption key client to server
    pub enc_c2s: Zeroizing<Vec<u8>>,
    /// Encryption key server to client
    pub enc_s2c: Zeroizing<Vec<u8>>,
    /// Integrity key client to server
    pub mac_c2s: Zeroizing<Vec<u8>>,
    /// Integrity key server to client
    pub mac_s2c: Zeroizing<Vec<u8>>,
}

/// Lengths of keys A to F, in that order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyLengths {
    /// IV length, client to server
    pub iv_c2s: usize,
    /// IV length, server to client
    pub iv_s2c: usize,
    /// Cipher key length, client to server
    pub enc_c2s: usize,
    /// Cipher key length, server to client
    pub enc_s2c: usize,
    /// MAC key length, client to server
    pub mac_c2s: usize,
    /// MAC key length, server to client
    pub mac_s2c: usize,
}

impl SessionKeys {
    /// Derives all six keys.
    ///
    /// `shared_secret` is the magnitude of K; it is hashed as an mpint.
    pub fn derive(
        hash: HashAlgorithm,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        lengths: KeyLengths,
    ) -> Self {
        let mut k = Zeroizing::new(Vec::with_capacity(shared_secret.len() + 5));
        k.put_mpint(shared_secret);
        let key = |letter: u8, len: usize| {
            derive_key(hash, k.as_slice(), exchange_hash, letter, session_id, len)
        };
        Self {
            iv_c2s: key(b'A', lengths.iv_c2s),
            iv_s2c: key(b'B', lengths.iv_s2c),
            enc_c2s: key(b'C', lengths.enc_c2s),
            enc_s2c: key(b'D', lengths.enc_s2c),
            mac_c2s: key(b'E', lengths.mac_c2s),
            mac_s2c: key(b'F', lengths.mac_s2c),
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys([REDACTED])")
    }
}

/// K1 = HASH(K || H || letter || session_id), Kn+1 = HASH(K || H || K1 || ... || Kn).
///
/// `k_encoded` is K already encoded as an mpint.
fn derive_key(
    hash: HashAlgorithm,
    k_encoded: &[u8],
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    len: usize,
) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(hash.digest(&[k_encoded, exchange_hash, &[letter], session_id]));
    while key.len() < len {
        let next = hash.digest(&[k_encoded, exchange_hash, key.as_slice()]);
        key.extend_from_slice(&next);
    }
    key.truncate(len);
    key
}

/// Builds the cipher, MAC and compression for one direction.
#[allow(clippy::too_many_arguments)]
fn direction_keys(
    registry: &AlgorithmRegistry,
    cipher: &str,
    mac: Option<&str>,
    compression: &str,
    iv: &[u8],
    key: &[u8],
    mac_key: &[u8],
    mode: CipherMode,
    authenticated: bool,
) -> LatchResult<DirectionKeys> {
    let cipher_spec = registry
        .cipher(cipher)
        .ok_or_else(|| LatchError::Protocol(format!("No constructor for cipher {}", cipher)))?;
    let cipher_state = (cipher_spec.construct)(key, iv, mode)?;

    let (mac, etm) = match mac {
        Some(name) => {
            let spec = registry
                .mac(name)
                .ok_or_else(|| LatchError::Protocol(format!("No constructor for MAC {}", name)))?;
            (Some((spec.construct)(mac_key)?), spec.etm)
        }
        None => (None, false),
    };

    let compression_spec = registry.compression(compression).ok_or_else(|| {
        LatchError::Protocol(format!("No constructor for compression {}", compression))
    })?;
    let compression = match compression_spec.construct {
        None => CompressionState::None,
        Some(construct) if compression_spec.delayed && !authenticated => {
            CompressionState::Delayed(construct()?)
        }
        Some(construct) => CompressionState::Active(construct()?),
    };

    Ok(DirectionKeys {
        cipher: cipher_state,
        mac,
        etm,
        compression,
    })
}

fn key_lengths(registry: &AlgorithmRegistry, negotiated: &NegotiatedAlgorithms) -> LatchResult<KeyLengths> {
    let cipher = |name: &str| {
        registry
            .cipher(name)
            .ok_or_else(|| LatchError::Protocol(format!("No constructor for cipher {}", name)))
    };
    let mac_len = |name: Option<&String>| -> LatchResult<usize> {
        match name {
            Some(name) => registry
                .mac(name)
                .map(|spec| spec.key_len)
                .ok_or_else(|| LatchError::Protocol(format!("No constructor for MAC {}", name))),
            None => Ok(0),
        }
    };
    let c2s = cipher(&negotiated.encryption_c2s)?;
    let s2c = cipher(&negotiated.encryption_s2c)?;
    Ok(KeyLengths {
        iv_c2s: c2s.iv_len,
        iv_s2c: s2c.iv_len,
        enc_c2s: c2s.key_len,
        enc_s2c: s2c.key_len,
        mac_c2s: mac_len(negotiated.mac_c2s.as_ref())?,
        mac_s2c: mac_len(negotiated.mac_s2c.as_ref())?,
    })
}

/// Runs one key exchange to completion.
///
/// On success both directions use the new keys and the transport is back in
/// normal operation. Any error is fatal for the connection.
pub async fn run_key_exchange<T: KexTransport>(
    transport: &mut T,
    setup: KexSetup<'_>,
) -> LatchResult<KexOutcome> {
    let config = setup.config;
    let registry = config.registry();
    let role = setup.role;

    let mut proposal = config.proposal().clone();
    if setup.initial {
        match role {
            Role::Client => {
                if config.ext_info() {
                    proposal.append(Slot::Kex, EXT_INFO_CLIENT);
                }
                if config.strict_kex() {
                    proposal.append(Slot::Kex, STRICT_KEX_CLIENT);
                }
            }
            Role::Server => {
                if config.strict_kex() {
                    proposal.append(Slot::Kex, STRICT_KEX_SERVER);
                }
            }
        }
    }
    let local_kexinit = KexInit::new(proposal).to_bytes();
    transport.send_kexinit(local_kexinit.clone()).await?;

    let (peer_payload, peer_seq) = match setup.peer_kexinit {
        Some(received) => received,
        None => transport.recv_kexinit().await?,
    };
    let peer_kexinit = KexInit::from_bytes(&peer_payload)?;
    let local = KexInit::from_bytes(&local_kexinit)?;

    let peer_strict_marker = match role {
        Role::Client => STRICT_KEX_SERVER,
        Role::Server => STRICT_KEX_CLIENT,
    };
    let peer_offers_strict = peer_kexinit.proposal().contains(Slot::Kex, peer_strict_marker);
    if setup.initial && config.require_strict_kex() && !peer_offers_strict {
        return Err(LatchError::StrictKex(
            "Peer does not support strict key exchange".to_string(),
        ));
    }
    let strict = setup.strict || (setup.initial && config.strict_kex() && peer_offers_strict);
    if strict && setup.initial && peer_seq != 0 {
        return Err(LatchError::StrictKex(format!(
            "Peer KEXINIT had sequence number {} instead of 0",
            peer_seq
        )));
    }
    // Message ordering is only enforced on the first exchange; sequence
    // numbers still reset at every NEWKEYS.
    transport.set_strict(strict && setup.initial);

    let negotiated = negotiate(role, local.proposal(), peer_kexinit.proposal(), |name| {
        registry.is_aead(name)
    })?;
    debug!(
        kex = %negotiated.kex,
        host_key = %negotiated.server_host_key,
        cipher_c2s = %negotiated.encryption_c2s,
        cipher_s2c = %negotiated.encryption_s2c,
        strict,
        "Algorithms negotiated"
    );

    if !setup.authenticated
        && (negotiated.encryption_c2s == "none" || negotiated.encryption_s2c == "none")
    {
        return Err(LatchError::Security(
            "Cipher \"none\" negotiated before user authentication".to_string(),
        ));
    }

    if peer_kexinit.first_kex_packet_follows() {
        let guess_kex = peer_kexinit.kex_algorithms().first();
        let guess_host_key = peer_kexinit.server_host_key_algorithms().first();
        if guess_kex != Some(&negotiated.kex) || guess_host_key != Some(&negotiated.server_host_key) {
            debug!("Discarding peer's wrongly guessed key exchange packet");
            transport.recv_kex().await?;
        }
    }

    let (client_version, server_version, client_kexinit, server_kexinit) = match role {
        Role::Client => (
            setup.local_version,
            setup.peer_version,
            local_kexinit.as_slice(),
            peer_payload.as_slice(),
        ),
        Role::Server => (
            setup.peer_version,
            setup.local_version,
            peer_payload.as_slice(),
            local_kexinit.as_slice(),
        ),
    };
    let transcript = HandshakeTranscript {
        client_version: client_version.as_bytes(),
        server_version: server_version.as_bytes(),
        client_kexinit,
        server_kexinit,
    };

    let factory = registry.kex(&negotiated.kex).ok_or_else(|| {
        LatchError::Protocol(format!("No constructor for key exchange {}", negotiated.kex))
    })?;
    let mut method = factory();
    let hash = method.hash();
    let signer = match role {
        Role::Server => config.host_key_signer().map(|s| s.as_ref()),
        Role::Client => None,
    };

    let output = {
        let mut ctx = KexContext::new(role, transport, transcript, signer, &negotiated.server_host_key);
        method.run(&mut ctx).await?
    };

    if role == Role::Client {
        verify_host_key(config, &negotiated.server_host_key, &output)?;
        if let Some(previous) = setup.previous_host_key {
            if previous != output.host_key_blob.as_slice() {
                return Err(LatchError::Security(
                    "Server host key changed during rekey".to_string(),
                ));
            }
        }
    }

    let session_id = match setup.session_id {
        Some(id) => id.to_vec(),
        None => output.exchange_hash.clone(),
    };

    let lengths = key_lengths(registry, &negotiated)?;
    let keys = SessionKeys::derive(
        hash,
        &output.shared_secret,
        &output.exchange_hash,
        &session_id,
        lengths,
    );

    let c2s = direction_keys(
        registry,
        &negotiated.encryption_c2s,
        negotiated.mac_c2s.as_deref(),
        &negotiated.compression_c2s,
        &keys.iv_c2s,
        &keys.enc_c2s,
        &keys.mac_c2s,
        if role == Role::Client {
            CipherMode::Encrypt
        } else {
            CipherMode::Decrypt
        },
        setup.authenticated,
    )?;
    let s2c = direction_keys(
        registry,
        &negotiated.encryption_s2c,
        negotiated.mac_s2c.as_deref(),
        &negotiated.compression_s2c,
        &keys.iv_s2c,
        &keys.enc_s2c,
        &keys.mac_s2c,
        if role == Role::Client {
            CipherMode::Decrypt
        } else {
            CipherMode::Encrypt
        },
        setup.authenticated,
    )?;
    let (outbound, inbound) = match role {
        Role::Client => (c2s, s2c),
        Role::Server => (s2c, c2s),
    };

    transport.send_newkeys(outbound, strict).await?;
    transport.recv_newkeys().await?;
    transport.install_inbound(inbound, strict);
    transport.set_strict(false);

    let send_ext_info = role == Role::Server
        && setup.initial
        && config.ext_info()
        && peer_kexinit.proposal().contains(Slot::Kex, EXT_INFO_CLIENT);

    info!(
        kex = %negotiated.kex,
        initial = setup.initial,
        exchange_hash = %hex::encode(&output.exchange_hash),
        "Key exchange complete"
    );

    Ok(KexOutcome {
        negotiated,
        exchange_hash: output.exchange_hash,
        session_id,
        host_key: output.host_key_blob,
        strict,
        send_ext_info,
    })
}

/// Checks the server's signature over H, then asks the configured verifier.
fn verify_host_key(config: &TransportConfig, algorithm: &str, output: &KexOutput) -> LatchResult<()> {
    let host_key = config.registry().host_key(algorithm).ok_or_else(|| {
        LatchError::Security(format!("No verifier for host key algorithm {}", algorithm))
    })?;
    if !host_key.verify(&output.host_key_blob, &output.signature, &output.exchange_hash)? {
        return Err(LatchError::Security(
            "Invalid host key signature".to_string(),
        ));
    }

    let verifier = config.host_key_verifier().ok_or_else(|| {
        LatchError::Security("No host key verifier configured".to_string())
    })?;
    let check = HostKeyCheck {
        host: config.host(),
        port: config.port(),
        algorithm,
        key_blob: &output.host_key_blob,
        signature_blob: &output.signature,
        exchange_hash: &output.exchange_hash,
    };
    match verifier.check(&check) {
        HostKeyDecision::Accept => Ok(()),
        HostKeyDecision::Reject => Err(LatchError::Security(
            "Server host key rejected by verifier".to_string(),
        )),
    }
}
