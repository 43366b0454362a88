//! SSH2 transport and channel multiplexing (RFC 4251-4254).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire and Packet Layer** ([`wire`], [`packet`]) - Binary packet protocol (RFC 4253 Section 6)
//! 2. **Algorithms** ([`registry`], [`crypto`], [`compression`], [`hostkey`], [`kex_dh`]) - Pluggable
//!    ciphers, MACs, compression, host keys and key exchange methods
//! 3. **Key Exchange** ([`kex`], [`kex_driver`]) - Negotiation, exchange hash and key derivation
//!    (RFC 4253 Sections 7 to 9)
//! 4. **Transport Session** ([`session`]) - Reader task, serialized writer, rekeying, keepalive
//! 5. **Connection Layer** ([`connection`], [`channel`]) - Multiplexed channels with flow control
//!    (RFC 4254)
//! 6. **Authentication** ([`auth`], [`credential`]) - Minimal user authentication (RFC 4252, RFC 4256)
//!
//! # Security Considerations
//!
//! - **Input Validation**: Inbound packets are bounded by the configured maximum length
//! - **Strict Key Exchange**: `kex-strict-*-v00@openssh.com` is negotiated by default
//! - **Constant-Time Operations**: MAC verification uses constant-time comparisons
//! - **Memory Safety**: Keys and secrets are zeroized on drop using [`zeroize`]
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust,no_run
//! use latch_proto::ssh::{client, AcceptAnyHostKey, TransportConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> latch_platform::LatchResult<()> {
//! let config = TransportConfig::builder()
//!     .with_host("example.org")
//!     .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
//!     .build()?;
//! let session = client::connect(config).await?;
//! println!("negotiated {:?}", session.negotiated());
//! session.disconnect("bye").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 8308](https://datatracker.ietf.org/doc/html/rfc8308) - Extension Negotiation

pub mod auth;
pub mod channel;
pub mod client;
pub mod compression;
pub mod config;
pub mod connection;
pub mod credential;
pub mod crypto;
mod dispatcher;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod kex_driver;
pub mod logging;
pub mod message;
pub mod packet;
pub mod registry;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export commonly used types
pub use auth::{authenticate, AuthOutcome};
pub use channel::{Channel, ChannelEvent, ChannelListener, ChannelSnapshot, ChannelState};
pub use config::{KeepaliveConfig, TransportConfig, TransportConfigBuilder};
pub use credential::{CredentialProvider, CredentialRequest, CredentialResponse, StaticCredentials};
pub use hostkey::{
    AcceptAnyHostKey, EcdsaP256HostKey, Ed25519HostKey, HostKeySigner, HostKeyVerifier,
    PinnedHostKeys, PromptingHostKeyVerifier,
};
pub use kex::{AlgorithmProposal, NegotiatedAlgorithms, Slot};
pub use message::{DisconnectReason, GlobalReply, MessageType};
pub use packet::{Packet, PacketDecoder, PacketEncoder};
pub use registry::AlgorithmRegistry;
pub use session::{Role, Session, SessionStatus};
pub use transport::{RekeyLimits, State};
pub use version::Version;
