//! SSH Host Key Algorithms
//!
//! Host key handling is split in three:
//!
//! - [`HostKeyAlgorithm`] checks the server's signature over the exchange
//!   hash (RFC 4253 Section 8). Built in: `ssh-ed25519`, `ecdsa-sha2-nistp256`.
//! - [`HostKeyVerifier`] decides whether the key itself is trusted
//!   (pinned fingerprints, known_hosts lookups, asking the user).
//! - [`HostKeySigner`] signs the exchange hash when the engine runs in the
//!   loopback server role.
//!
//! Both checks must pass; a failure of either aborts the key exchange.
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::hostkey::{Ed25519HostKey, Ed25519Verify, HostKeyAlgorithm, HostKeySigner};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate();
//! let blob = hostkey.public_key_blob();
//! let signature = hostkey.sign(b"exchange hash")?;
//!
//! assert!(Ed25519Verify.verify(&blob, &signature, b"exchange hash")?);
//! # Ok(())
//! # }
//! ```

use crate::ssh::credential::{CredentialProvider, CredentialRequest, CredentialResponse};
use crate::ssh::wire::{WireReader, WireWrite};
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use latch_platform::{LatchError, LatchResult};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Signature check for one host key algorithm.
pub trait HostKeyAlgorithm: Send + Sync {
    /// Checks `signature_blob` over `message` with the key in `key_blob`.
    ///
    /// Returns `Ok(false)` for a well-formed but wrong signature and an error
    /// for malformed input.
    fn verify(&self, key_blob: &[u8], signature_blob: &[u8], message: &[u8]) -> LatchResult<bool>;
}

/// Signs exchange hashes on the responder side.
pub trait HostKeySigner: Send + Sync {
    /// Algorithm name, e.g. `ssh-ed25519`.
    fn algorithm(&self) -> &str;

    /// Public key in SSH wire format.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data` and returns the signature in SSH wire format.
    fn sign(&self, data: &[u8]) -> LatchResult<Vec<u8>>;
}

/// Reads `string algorithm` and checks it.
fn expect_algorithm(reader: &mut WireReader<'_>, expected: &str) -> LatchResult<()> {
    let name = reader.read_utf8()?;
    if name != expected {
        return Err(LatchError::Security(format!(
            "Host key algorithm mismatch: expected {}, got {}",
            expected, name
        )));
    }
    Ok(())
}

/// `ssh-ed25519` signature check.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verify;

impl HostKeyAlgorithm for Ed25519Verify {
    fn verify(&self, key_blob: &[u8], signature_blob: &[u8], message: &[u8]) -> LatchResult<bool> {
        let mut key = WireReader::new(key_blob);
        expect_algorithm(&mut key, "ssh-ed25519")?;
        let public_key: [u8; 32] = key
            .read_string()?
            .try_into()
            .map_err(|_| LatchError::Security("Ed25519 public key must be 32 bytes".to_string()))?;

        let mut sig = WireReader::new(signature_blob);
        expect_algorithm(&mut sig, "ssh-ed25519")?;
        let sig_bytes: [u8; 64] = sig
            .read_string()?
            .try_into()
            .map_err(|_| LatchError::Security("Ed25519 signature must be 64 bytes".to_string()))?;

        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| LatchError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
        let signature = Signature::from_bytes(&sig_bytes);
        Ok(verifying_key.verify(message, &signature).is_ok())
    }
}

/// `ecdsa-sha2-nistp256` signature check (RFC 5656).
#[derive(Debug, Clone, Copy, Default)]
pub struct EcdsaP256Verify;

/// Left-pads an mpint magnitude to a 32-byte scalar.
fn scalar_bytes(magnitude: &[u8]) -> LatchResult<[u8; 32]> {
    if magnitude.len() > 32 {
        return Err(LatchError::Security(
            "ECDSA signature component too large".to_string(),
        ));
    }
    let mut out = [0u8; 32];
    out[32 - magnitude.len()..].copy_from_slice(magnitude);
    Ok(out)
}

impl HostKeyAlgorithm for EcdsaP256Verify {
    fn verify(&self, key_blob: &[u8], signature_blob: &[u8], message: &[u8]) -> LatchResult<bool> {
        use signature::Verifier as _;

        let mut key = WireReader::new(key_blob);
        expect_algorithm(&mut key, "ecdsa-sha2-nistp256")?;
        let curve = key.read_utf8()?;
        if curve != "nistp256" {
            return Err(LatchError::Security(format!("Unexpected curve: {}", curve)));
        }
        let point = key.read_string()?;
        let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .map_err(|e| LatchError::Security(format!("Invalid P-256 public key: {}", e)))?;

        let mut sig = WireReader::new(signature_blob);
        expect_algorithm(&mut sig, "ecdsa-sha2-nistp256")?;
        let mut rs = WireReader::new(sig.read_string()?);
        let r = scalar_bytes(&rs.read_mpint()?)?;
        let s = scalar_bytes(&rs.read_mpint()?)?;
        let signature = match p256::ecdsa::Signature::from_scalars(
            p256::FieldBytes::clone_from_slice(&r),
            p256::FieldBytes::clone_from_slice(&s),
        ) {
            Ok(signature) => signature,
            Err(_) => return Ok(false),
        };
        Ok(verifying_key.verify(message, &signature).is_ok())
    }
}

/// Ed25519 host key pair.
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
}

impl Ed25519HostKey {
    /// Generates a new key pair.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let secret_bytes: [u8; SECRET_KEY_LENGTH] = rand::Rng::gen(&mut csprng);
        Self {
            signing_key: SigningKey::from_bytes(&secret_bytes),
        }
    }

    /// Creates a key pair from a 32-byte secret.
    pub fn from_bytes(secret_bytes: &[u8]) -> LatchResult<Self> {
        let key_bytes: [u8; 32] = secret_bytes.try_into().map_err(|_| {
            LatchError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }
}

impl HostKeySigner for Ed25519HostKey {
    fn algorithm(&self) -> &str {
        "ssh-ed25519"
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_str("ssh-ed25519");
        buf.put_string(self.signing_key.verifying_key().as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> LatchResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut buf = BytesMut::new();
        buf.put_str("ssh-ed25519");
        buf.put_string(&signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("fingerprint", &fingerprint_sha256(&self.public_key_blob()))
            .finish_non_exhaustive()
    }
}

/// ECDSA P-256 host key pair.
#[derive(Clone)]
pub struct EcdsaP256HostKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl EcdsaP256HostKey {
    /// Generates a new key pair.
    pub fn generate() -> Self {
        Self {
            signing_key: p256::ecdsa::SigningKey::random(&mut rand::thread_rng()),
        }
    }
}

impl HostKeySigner for EcdsaP256HostKey {
    fn algorithm(&self) -> &str {
        "ecdsa-sha2-nistp256"
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut buf = BytesMut::new();
        buf.put_str("ecdsa-sha2-nistp256");
        buf.put_str("nistp256");
        buf.put_string(point.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> LatchResult<Vec<u8>> {
        use signature::Signer as _;

        let signature: p256::ecdsa::Signature = self.signing_key.sign(data);
        let (r, s) = signature.split_bytes();
        let mut inner = BytesMut::new();
        inner.put_mpint(&r);
        inner.put_mpint(&s);

        let mut buf = BytesMut::new();
        buf.put_str("ecdsa-sha2-nistp256");
        buf.put_string(&inner);
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for EcdsaP256HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaP256HostKey")
            .field("fingerprint", &fingerprint_sha256(&self.public_key_blob()))
            .finish_non_exhaustive()
    }
}

/// OpenSSH-style fingerprint: `SHA256:` followed by unpadded base64.
pub fn fingerprint_sha256(key_blob: &[u8]) -> String {
    let hash = Sha256::digest(key_blob);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}

/// Everything a trust decision may look at.
#[derive(Debug, Clone, Copy)]
pub struct HostKeyCheck<'a> {
    /// Host name or address as given by the caller
    pub host: &'a str,
    /// Port
    pub port: u16,
    /// Negotiated host key algorithm
    pub algorithm: &'a str,
    /// Server host key blob
    pub key_blob: &'a [u8],
    /// Signature blob sent by the server
    pub signature_blob: &'a [u8],
    /// Exchange hash the signature covers
    pub exchange_hash: &'a [u8],
}

/// Trust decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// Continue the key exchange
    Accept,
    /// Abort the key exchange
    Reject,
}

/// Decides whether a server host key is trusted.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns the trust decision for one key.
    fn check(&self, check: &HostKeyCheck<'_>) -> HostKeyDecision;
}

/// Trusts every key. Only suitable for tests and throwaway tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn check(&self, check: &HostKeyCheck<'_>) -> HostKeyDecision {
        warn!(
            host = check.host,
            fingerprint = %fingerprint_sha256(check.key_blob),
            "Accepting unverified host key"
        );
        HostKeyDecision::Accept
    }
}

/// Trusts keys whose SHA-256 fingerprint is in a fixed set.
#[derive(Debug, Clone, Default)]
pub struct PinnedHostKeys {
    fingerprints: Vec<String>,
}

impl PinnedHostKeys {
    /// Creates a verifier from `SHA256:...` fingerprints.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }

    /// True if the key blob matches a pinned fingerprint.
    pub fn contains(&self, key_blob: &[u8]) -> bool {
        let fingerprint = fingerprint_sha256(key_blob);
        self.fingerprints.iter().any(|f| *f == fingerprint)
    }
}

impl HostKeyVerifier for PinnedHostKeys {
    fn check(&self, check: &HostKeyCheck<'_>) -> HostKeyDecision {
        if self.contains(check.key_blob) {
            HostKeyDecision::Accept
        } else {
            warn!(
                host = check.host,
                fingerprint = %fingerprint_sha256(check.key_blob),
                "Host key does not match any pinned fingerprint"
            );
            HostKeyDecision::Reject
        }
    }
}

/// Accepts pinned keys silently and asks the user about anything else.
pub struct PromptingHostKeyVerifier {
    pinned: PinnedHostKeys,
    provider: Arc<dyn CredentialProvider>,
}

impl PromptingHostKeyVerifier {
    /// Creates a verifier that falls back to `provider` for unknown keys.
    pub fn new(pinned: PinnedHostKeys, provider: Arc<dyn CredentialProvider>) -> Self {
        Self { pinned, provider }
    }
}

impl std::fmt::Debug for PromptingHostKeyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptingHostKeyVerifier")
            .field("pinned", &self.pinned)
            .finish_non_exhaustive()
    }
}

impl HostKeyVerifier for PromptingHostKeyVerifier {
    fn check(&self, check: &HostKeyCheck<'_>) -> HostKeyDecision {
        if self.pinned.contains(check.key_blob) {
            return HostKeyDecision::Accept;
        }
        let fingerprint = fingerprint_sha256(check.key_blob);
        let request = CredentialRequest::Confirm {
            message: format!(
                "The authenticity of host '{}:{}' can't be established.\n{} key fingerprint is {}.\nAre you sure you want to continue connecting?",
                check.host, check.port, check.algorithm, fingerprint
            ),
        };
        match self.provider.provide(&request) {
            CredentialResponse::Confirmed(true) => {
                info!(host = check.host, fingerprint = %fingerprint, "Host key accepted by user");
                HostKeyDecision::Accept
            }
            _ => HostKeyDecision::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::credential::StaticCredentials;

    fn check<'a>(blob: &'a [u8]) -> HostKeyCheck<'a> {
        HostKeyCheck {
            host: "example.com",
            port: 22,
            algorithm: "ssh-ed25519",
            key_blob: blob,
            signature_blob: &[],
            exchange_hash: &[],
        }
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate();
        let blob = key.public_key_blob();
        let sig = key.sign(b"hash").unwrap();

        assert!(Ed25519Verify.verify(&blob, &sig, b"hash").unwrap());
        assert!(!Ed25519Verify.verify(&blob, &sig, b"other").unwrap());
    }

    #[test]
    fn test_ed25519_from_bytes_is_deterministic() {
        let a = Ed25519HostKey::from_bytes(&[7u8; 32]).unwrap();
        let b = Ed25519HostKey::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(a.public_key_blob(), b.public_key_blob());
        assert!(Ed25519HostKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_ecdsa_sign_verify() {
        let key = EcdsaP256HostKey::generate();
        let blob = key.public_key_blob();
        let sig = key.sign(b"exchange hash").unwrap();

        assert!(EcdsaP256Verify.verify(&blob, &sig, b"exchange hash").unwrap());
        assert!(!EcdsaP256Verify.verify(&blob, &sig, b"tampered").unwrap());
    }

    #[test]
    fn test_algorithm_mismatch_is_error() {
        let ed = Ed25519HostKey::generate();
        let ec = EcdsaP256HostKey::generate();
        let sig = ed.sign(b"x").unwrap();
        assert!(EcdsaP256Verify
            .verify(&ec.public_key_blob(), &sig, b"x")
            .is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_sha256(b"blob");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_pinned_verifier() {
        let key = Ed25519HostKey::generate();
        let blob = key.public_key_blob();
        let pinned = PinnedHostKeys::new([fingerprint_sha256(&blob)]);
        assert_eq!(pinned.check(&check(&blob)), HostKeyDecision::Accept);

        let other = Ed25519HostKey::generate().public_key_blob();
        assert_eq!(pinned.check(&check(&other)), HostKeyDecision::Reject);
    }

    #[test]
    fn test_prompting_verifier() {
        let blob = Ed25519HostKey::generate().public_key_blob();

        let yes = PromptingHostKeyVerifier::new(
            PinnedHostKeys::default(),
            Arc::new(StaticCredentials::new().with_confirm(true)),
        );
        assert_eq!(yes.check(&check(&blob)), HostKeyDecision::Accept);

        let no = PromptingHostKeyVerifier::new(
            PinnedHostKeys::default(),
            Arc::new(StaticCredentials::new()),
        );
        assert_eq!(no.check(&check(&blob)), HostKeyDecision::Reject);
    }
}
