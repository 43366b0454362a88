//! SSH2 client transport and channel multiplexing engine.
//!
//! This crate establishes an encrypted, integrity-protected, multiplexed
//! connection to an SSH server without any external SSH binary:
//!
//! - **Transport** - Banner exchange, key exchange, rekeying, strict KEX (RFC 4253)
//! - **Channels** - Multiplexed channels with windowed flow control (RFC 4254)
//! - **Authentication** - `none`, `password` and `keyboard-interactive` (RFC 4252, RFC 4256)
//!
//! Algorithms are plugins held by an [`ssh::registry::AlgorithmRegistry`];
//! the built-in set covers Curve25519, ECDH P-256 and group14 key exchange,
//! ChaCha20-Poly1305, AES-GCM and AES-CTR ciphers, HMAC-SHA1/SHA2 MACs and
//! zlib compression.
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support
//!
//! # Example
//!
//! ```rust,no_run
//! use latch_proto::ssh::{client, PinnedHostKeys, TransportConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> latch_platform::LatchResult<()> {
//! let config = TransportConfig::builder()
//!     .with_host("example.org")
//!     .with_host_key_verifier(Arc::new(PinnedHostKeys::new([
//!         "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU",
//!     ])))
//!     .build()?;
//! let session = client::connect(config).await?;
//! let channel = session.open_session_channel().await?;
//! channel.exec("true").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`, RustCrypto)
//! - Constant-time MAC verification
//! - Secure memory handling with `zeroize`
//! - Fuzz testing of the packet decoder
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
