//! Transport configuration.
//!
//! A [`TransportConfig`] is immutable once built. Every algorithm override is
//! resolved against the [`AlgorithmRegistry`] in
//! [`TransportConfigBuilder::build`], so a session never starts with a name it
//! cannot instantiate.
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::config::TransportConfig;
//! use latch_proto::ssh::hostkey::AcceptAnyHostKey;
//! use latch_proto::ssh::kex::Slot;
//! use std::sync::Arc;
//!
//! let config = TransportConfig::builder()
//!     .with_host("example.com")
//!     .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
//!     .with_algorithms(Slot::EncryptionC2s, "^aes128-ctr")
//!     .build()
//!     .unwrap();
//! assert_eq!(config.proposal().get(Slot::EncryptionC2s)[0], "aes128-ctr");
//! ```

use crate::ssh::hostkey::{HostKeySigner, HostKeyVerifier};
use crate::ssh::kex::{AlgorithmProposal, Slot};
use crate::ssh::packet::DEFAULT_MAX_PACKET_LEN;
use crate::ssh::registry::AlgorithmRegistry;
use crate::ssh::session::Role;
use crate::ssh::transport::RekeyLimits;
use crate::ssh::version::Version;
use latch_platform::{LatchError, LatchResult};
use std::sync::Arc;
use std::time::Duration;

/// Smallest packet size every implementation must accept (RFC 4253 Section 6.1).
pub const MIN_MAX_PACKET_LEN: usize = 35000;

/// Room reserved around channel data for headers, padding and MAC.
pub const CHANNEL_PACKET_OVERHEAD: usize = 512;

/// Default channel receive window.
pub const DEFAULT_CHANNEL_WINDOW: u32 = 2 * 1024 * 1024;

/// Default maximum channel data packet.
pub const DEFAULT_CHANNEL_MAX_PACKET: u32 = 32 * 1024;

/// Keepalive probe settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before a probe is sent
    pub interval: Duration,
    /// Unanswered probes tolerated before the session is torn down
    pub count_max: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            count_max: 3,
        }
    }
}

/// Immutable session settings.
#[derive(Clone)]
pub struct TransportConfig {
    role: Role,
    software_version: String,
    comments: Option<String>,
    host: String,
    port: u16,
    registry: Arc<AlgorithmRegistry>,
    overrides: Vec<(Slot, String)>,
    proposal: AlgorithmProposal,
    rekey: RekeyLimits,
    max_packet_len: usize,
    connect_timeout: Duration,
    channel_open_timeout: Duration,
    keepalive: Option<KeepaliveConfig>,
    strict_kex: bool,
    require_strict_kex: bool,
    ext_info: bool,
    channel_window: u32,
    channel_max_packet: u32,
    verifier: Option<Arc<dyn HostKeyVerifier>>,
    signer: Option<Arc<dyn HostKeySigner>>,
}

impl TransportConfig {
    /// Starts a builder with default settings for the client role.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    /// Returns a builder holding these settings.
    pub fn to_builder(&self) -> TransportConfigBuilder {
        TransportConfigBuilder {
            role: self.role,
            software_version: self.software_version.clone(),
            comments: self.comments.clone(),
            host: self.host.clone(),
            port: self.port,
            registry: Arc::clone(&self.registry),
            overrides: self.overrides.clone(),
            rekey: self.rekey,
            max_packet_len: self.max_packet_len,
            connect_timeout: self.connect_timeout,
            channel_open_timeout: self.channel_open_timeout,
            keepalive: self.keepalive,
            strict_kex: self.strict_kex,
            require_strict_kex: self.require_strict_kex,
            ext_info: self.ext_info,
            channel_window: self.channel_window,
            channel_max_packet: self.channel_max_packet,
            verifier: self.verifier.clone(),
            signer: self.signer.clone(),
        }
    }

    /// Which end of the connection this session is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Local identification string.
    pub fn version(&self) -> Version {
        Version::new(&self.software_version, self.comments.as_deref())
    }

    /// Host name used for host key checks and logging.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port used for host key checks and logging.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Algorithm constructors.
    pub fn registry(&self) -> &AlgorithmRegistry {
        &self.registry
    }

    /// Resolved local preference lists.
    pub fn proposal(&self) -> &AlgorithmProposal {
        &self.proposal
    }

    /// Rekey thresholds.
    pub fn rekey_limits(&self) -> &RekeyLimits {
        &self.rekey
    }

    /// Largest inbound packet accepted.
    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }

    /// Bound on banner exchange plus initial key exchange.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Bound on waiting for a channel open confirmation.
    pub fn channel_open_timeout(&self) -> Duration {
        self.channel_open_timeout
    }

    /// Keepalive settings, if enabled.
    pub fn keepalive(&self) -> Option<&KeepaliveConfig> {
        self.keepalive.as_ref()
    }

    /// Offer strict key exchange on the initial exchange.
    pub fn strict_kex(&self) -> bool {
        self.strict_kex
    }

    /// Abort the initial exchange if the peer does not offer strict key exchange.
    pub fn require_strict_kex(&self) -> bool {
        self.require_strict_kex
    }

    /// Offer and accept RFC 8308 extension negotiation.
    pub fn ext_info(&self) -> bool {
        self.ext_info
    }

    /// Initial receive window for new channels.
    pub fn channel_window(&self) -> u32 {
        self.channel_window
    }

    /// Largest channel data packet we accept.
    pub fn channel_max_packet(&self) -> u32 {
        self.channel_max_packet
    }

    /// Host key trust decision (client role).
    pub fn host_key_verifier(&self) -> Option<&Arc<dyn HostKeyVerifier>> {
        self.verifier.as_ref()
    }

    /// Host key used to sign exchange hashes (server role).
    pub fn host_key_signer(&self) -> Option<&Arc<dyn HostKeySigner>> {
        self.signer.as_ref()
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("role", &self.role)
            .field("software_version", &self.software_version)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("proposal", &self.proposal)
            .field("rekey", &self.rekey)
            .field("max_packet_len", &self.max_packet_len)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive", &self.keepalive)
            .field("strict_kex", &self.strict_kex)
            .field("require_strict_kex", &self.require_strict_kex)
            .field("ext_info", &self.ext_info)
            .field("channel_window", &self.channel_window)
            .field("channel_max_packet", &self.channel_max_packet)
            .field("verifier", &self.verifier.is_some())
            .field("signer", &self.signer.as_ref().map(|s| s.algorithm().to_string()))
            .finish()
    }
}

/// Builder for [`TransportConfig`].
#[derive(Clone)]
pub struct TransportConfigBuilder {
    role: Role,
    software_version: String,
    comments: Option<String>,
    host: String,
    port: u16,
    registry: Arc<AlgorithmRegistry>,
    overrides: Vec<(Slot, String)>,
    rekey: RekeyLimits,
    max_packet_len: usize,
    connect_timeout: Duration,
    channel_open_timeout: Duration,
    keepalive: Option<KeepaliveConfig>,
    strict_kex: bool,
    require_strict_kex: bool,
    ext_info: bool,
    channel_window: u32,
    channel_max_packet: u32,
    verifier: Option<Arc<dyn HostKeyVerifier>>,
    signer: Option<Arc<dyn HostKeySigner>>,
}

impl TransportConfigBuilder {
    /// Default settings for the client role.
    pub fn new() -> Self {
        Self {
            role: Role::Client,
            software_version: format!("latch_{}", env!("CARGO_PKG_VERSION")),
            comments: None,
            host: String::new(),
            port: 22,
            registry: Arc::new(AlgorithmRegistry::with_defaults()),
            overrides: Vec::new(),
            rekey: RekeyLimits::default(),
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            connect_timeout: Duration::from_secs(30),
            channel_open_timeout: Duration::from_secs(30),
            keepalive: None,
            strict_kex: true,
            require_strict_kex: false,
            ext_info: true,
            channel_window: DEFAULT_CHANNEL_WINDOW,
            channel_max_packet: DEFAULT_CHANNEL_MAX_PACKET,
            verifier: None,
            signer: None,
        }
    }

    /// Sets the role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Sets the software version field of the identification string.
    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = version.into();
        self
    }

    /// Sets the comments field of the identification string.
    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    /// Sets the peer host name.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the peer port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replaces the algorithm registry.
    pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Adds an override for one slot, e.g. `"+zlib"` or `"-aes128-ctr"`.
    ///
    /// A later override for the same slot replaces the earlier one.
    pub fn with_algorithms(mut self, slot: Slot, spec: impl Into<String>) -> Self {
        self.overrides.retain(|(s, _)| *s != slot);
        self.overrides.push((slot, spec.into()));
        self
    }

    /// Sets the rekey thresholds.
    pub fn with_rekey_limits(mut self, limits: RekeyLimits) -> Self {
        self.rekey = limits;
        self
    }

    /// Sets the largest inbound packet accepted.
    pub fn with_max_packet_len(mut self, len: usize) -> Self {
        self.max_packet_len = len;
        self
    }

    /// Sets the bound on banner exchange plus initial key exchange.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the bound on waiting for a channel open confirmation.
    pub fn with_channel_open_timeout(mut self, timeout: Duration) -> Self {
        self.channel_open_timeout = timeout;
        self
    }

    /// Enables keepalive probes.
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Enables or disables strict key exchange.
    pub fn with_strict_kex(mut self, enabled: bool) -> Self {
        self.strict_kex = enabled;
        self
    }

    /// Requires the peer to support strict key exchange.
    pub fn with_require_strict_kex(mut self, required: bool) -> Self {
        self.require_strict_kex = required;
        self
    }

    /// Enables or disables extension negotiation.
    pub fn with_ext_info(mut self, enabled: bool) -> Self {
        self.ext_info = enabled;
        self
    }

    /// Sets the initial receive window for new channels.
    pub fn with_channel_window(mut self, window: u32) -> Self {
        self.channel_window = window;
        self
    }

    /// Sets the largest channel data packet we accept.
    pub fn with_channel_max_packet(mut self, max_packet: u32) -> Self {
        self.channel_max_packet = max_packet;
        self
    }

    /// Sets the host key trust decision (required for the client role).
    pub fn with_host_key_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Sets the host key (required for the server role).
    pub fn with_host_key_signer(mut self, signer: Arc<dyn HostKeySigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Validates the settings and resolves algorithm overrides.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::Config`] on the first invalid setting.
    pub fn build(self) -> LatchResult<TransportConfig> {
        if self.software_version.is_empty()
            || self
                .software_version
                .chars()
                .any(|c| c.is_whitespace() || c == '-' || c.is_control())
        {
            return Err(LatchError::Config(format!(
                "Invalid software version: {:?}",
                self.software_version
            )));
        }
        if self.max_packet_len < MIN_MAX_PACKET_LEN {
            return Err(LatchError::Config(format!(
                "max_packet_len must be at least {}",
                MIN_MAX_PACKET_LEN
            )));
        }
        if self.channel_window == 0 || self.channel_max_packet == 0 {
            return Err(LatchError::Config(
                "Channel window and maximum packet must be non-zero".to_string(),
            ));
        }
        if self.channel_max_packet as usize + CHANNEL_PACKET_OVERHEAD > self.max_packet_len {
            return Err(LatchError::Config(format!(
                "channel_max_packet {} does not fit in max_packet_len {}",
                self.channel_max_packet, self.max_packet_len
            )));
        }
        if self.rekey.max_bytes == 0
            || self.rekey.max_packets == 0
            || self.rekey.max_interval.is_zero()
        {
            return Err(LatchError::Config(
                "Rekey limits must be non-zero".to_string(),
            ));
        }
        if self.require_strict_kex && !self.strict_kex {
            return Err(LatchError::Config(
                "require_strict_kex needs strict key exchange enabled".to_string(),
            ));
        }
        if let Some(keepalive) = &self.keepalive {
            if keepalive.interval.is_zero() {
                return Err(LatchError::Config(
                    "Keepalive interval must be non-zero".to_string(),
                ));
            }
        }

        match self.role {
            Role::Client if self.verifier.is_none() => {
                return Err(LatchError::Config(
                    "A host key verifier is required for the client role".to_string(),
                ));
            }
            Role::Server if self.signer.is_none() => {
                return Err(LatchError::Config(
                    "A host key is required for the server role".to_string(),
                ));
            }
            _ => {}
        }

        let mut proposal = self.registry.default_proposal().clone();
        if let Some(signer) = &self.signer {
            if self.role == Role::Server {
                if !self.registry.is_known(Slot::ServerHostKey, signer.algorithm()) {
                    return Err(LatchError::Config(format!(
                        "Unsupported server_host_key algorithm: {}",
                        signer.algorithm()
                    )));
                }
                proposal.set(Slot::ServerHostKey, vec![signer.algorithm().to_string()]);
            }
        }
        for (slot, spec) in &self.overrides {
            proposal.set(*slot, self.registry.resolve(*slot, spec)?);
        }

        Ok(TransportConfig {
            role: self.role,
            software_version: self.software_version,
            comments: self.comments,
            host: self.host,
            port: self.port,
            registry: self.registry,
            overrides: self.overrides,
            proposal,
            rekey: self.rekey,
            max_packet_len: self.max_packet_len,
            connect_timeout: self.connect_timeout,
            channel_open_timeout: self.channel_open_timeout,
            keepalive: self.keepalive,
            strict_kex: self.strict_kex,
            require_strict_kex: self.require_strict_kex,
            ext_info: self.ext_info,
            channel_window: self.channel_window,
            channel_max_packet: self.channel_max_packet,
            verifier: self.verifier,
            signer: self.signer,
        })
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
