//! Algorithm registry.
//!
//! Maps every negotiable algorithm name to a constructor and keeps the
//! default preference list for each KEXINIT slot. Configuration overrides are
//! resolved against the registry before a connection exists, so a name the
//! engine cannot instantiate is rejected up front.
//!
//! # Override syntax
//!
//! | Form           | Effect                                        |
//! |----------------|-----------------------------------------------|
//! | `a,b`          | replace the default list                      |
//! | `+a,b`         | append to the defaults (existing names stay)  |
//! | `^a,b`         | prepend to the defaults                       |
//! | `-a,b`         | remove from the defaults                      |
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::kex::Slot;
//! use latch_proto::ssh::registry::AlgorithmRegistry;
//!
//! let registry = AlgorithmRegistry::with_defaults();
//! let ciphers = registry.resolve(Slot::EncryptionC2s, "^aes128-ctr").unwrap();
//! assert_eq!(ciphers[0], "aes128-ctr");
//! assert!(registry.resolve(Slot::EncryptionC2s, "rot13").is_err());
//! ```

use crate::ssh::compression::{new_zlib, Compressor};
use crate::ssh::crypto::{
    new_aes128_ctr, new_aes128_gcm, new_aes192_ctr, new_aes256_ctr, new_aes256_gcm,
    new_chacha20_poly1305, new_hmac_sha1, new_hmac_sha256, new_hmac_sha512, new_none, CipherMode,
    CipherState, Mac,
};
use crate::ssh::hostkey::{EcdsaP256Verify, Ed25519Verify, HostKeyAlgorithm};
use crate::ssh::kex::{AlgorithmProposal, Slot};
use crate::ssh::kex_dh::{DhGroup14Sha256, EcdhKex};
use crate::ssh::kex_driver::KexMethod;
use latch_platform::{LatchError, LatchResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a fresh KEX method instance for one exchange.
pub type KexFactory = Arc<dyn Fn() -> Box<dyn KexMethod> + Send + Sync>;

/// Cipher parameters and constructor.
#[derive(Clone, Copy)]
pub struct CipherSpec {
    /// Key length in bytes
    pub key_len: usize,
    /// IV length in bytes
    pub iv_len: usize,
    /// Carries its own authentication tag
    pub aead: bool,
    /// Constructor taking key, IV and direction
    pub construct: CipherConstructor,
}

/// MAC parameters and constructor.
#[derive(Clone, Copy)]
pub struct MacSpec {
    /// Key length in bytes
    pub key_len: usize,
    /// Tag length in bytes
    pub mac_len: usize,
    /// Encrypt-then-MAC variant
    pub etm: bool,
    /// Constructor taking the key
    pub construct: MacConstructor,
}

/// Compression parameters and constructor.
#[derive(Clone, Copy)]
pub struct CompressionSpec {
    /// Activated only after user authentication succeeds
    pub delayed: bool,
    /// Constructor; `None` for the identity method
    pub construct: Option<fn() -> LatchResult<Box<dyn Compressor>>>,
}

/// Cipher constructor taking key, IV and direction.
pub type CipherConstructor = fn(&[u8], &[u8], CipherMode) -> LatchResult<CipherState>;
/// MAC constructor taking the key.
pub type MacConstructor = fn(&[u8]) -> LatchResult<Box<dyn Mac>>;

impl CipherSpec {
    fn aead(key_len: usize, iv_len: usize, construct: CipherConstructor) -> Self {
        Self {
            key_len,
            iv_len,
            aead: true,
            construct,
        }
    }

    fn ctr(key_len: usize, construct: CipherConstructor) -> Self {
        Self {
            key_len,
            iv_len: 16,
            aead: false,
            construct,
        }
    }
}

impl std::fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSpec")
            .field("key_len", &self.key_len)
            .field("iv_len", &self.iv_len)
            .field("aead", &self.aead)
            .finish_non_exhaustive()
    }
}

impl MacSpec {
    fn hmac(len: usize, etm: bool, construct: MacConstructor) -> Self {
        Self {
            key_len: len,
            mac_len: len,
            etm,
            construct,
        }
    }
}

impl std::fmt::Debug for MacSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacSpec")
            .field("key_len", &self.key_len)
            .field("mac_len", &self.mac_len)
            .field("etm", &self.etm)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for CompressionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionSpec")
            .field("delayed", &self.delayed)
            .field("identity", &self.construct.is_none())
            .finish()
    }
}

/// Name-to-constructor tables plus default preference lists.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    kex: HashMap<String, KexFactory>,
    host_keys: HashMap<String, Arc<dyn HostKeyAlgorithm>>,
    ciphers: HashMap<String, CipherSpec>,
    macs: HashMap<String, MacSpec>,
    compression: HashMap<String, CompressionSpec>,
    defaults: AlgorithmProposal,
}

impl AlgorithmRegistry {
    /// Empty registry with no defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in algorithm.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_kex("curve25519-sha256", || Box::new(EcdhKex::curve25519()));
        registry.register_kex("curve25519-sha256@libssh.org", || {
            Box::new(EcdhKex::curve25519())
        });
        registry.register_kex("ecdh-sha2-nistp256", || Box::new(EcdhKex::nistp256()));
        registry.register_kex("diffie-hellman-group14-sha256", || {
            Box::new(DhGroup14Sha256::new())
        });

        registry.register_host_key("ssh-ed25519", Arc::new(Ed25519Verify));
        registry.register_host_key("ecdsa-sha2-nistp256", Arc::new(EcdsaP256Verify));

        registry.register_cipher(
            "chacha20-poly1305@openssh.com",
            CipherSpec::aead(64, 0, new_chacha20_poly1305),
        );
        registry.register_cipher("aes256-gcm@openssh.com", CipherSpec::aead(32, 12, new_aes256_gcm));
        registry.register_cipher("aes128-gcm@openssh.com", CipherSpec::aead(16, 12, new_aes128_gcm));
        registry.register_cipher("aes256-ctr", CipherSpec::ctr(32, new_aes256_ctr));
        registry.register_cipher("aes192-ctr", CipherSpec::ctr(24, new_aes192_ctr));
        registry.register_cipher("aes128-ctr", CipherSpec::ctr(16, new_aes128_ctr));
        registry.register_cipher(
            "none",
            CipherSpec {
                key_len: 0,
                iv_len: 0,
                aead: false,
                construct: new_none,
            },
        );

        registry.register_mac("hmac-sha2-256-etm@openssh.com", MacSpec::hmac(32, true, new_hmac_sha256));
        registry.register_mac("hmac-sha2-512-etm@openssh.com", MacSpec::hmac(64, true, new_hmac_sha512));
        registry.register_mac("hmac-sha1-etm@openssh.com", MacSpec::hmac(20, true, new_hmac_sha1));
        registry.register_mac("hmac-sha2-256", MacSpec::hmac(32, false, new_hmac_sha256));
        registry.register_mac("hmac-sha2-512", MacSpec::hmac(64, false, new_hmac_sha512));
        registry.register_mac("hmac-sha1", MacSpec::hmac(20, false, new_hmac_sha1));

        registry.register_compression(
            "none",
            CompressionSpec {
                delayed: false,
                construct: None,
            },
        );
        registry.register_compression(
            "zlib@openssh.com",
            CompressionSpec {
                delayed: true,
                construct: Some(new_zlib),
            },
        );
        registry.register_compression(
            "zlib",
            CompressionSpec {
                delayed: false,
                construct: Some(new_zlib),
            },
        );

        let ciphers = [
            "chacha20-poly1305@openssh.com",
            "aes256-gcm@openssh.com",
            "aes128-gcm@openssh.com",
            "aes256-ctr",
            "aes192-ctr",
            "aes128-ctr",
        ];
        let macs = [
            "hmac-sha2-256-etm@openssh.com",
            "hmac-sha2-512-etm@openssh.com",
            "hmac-sha2-256",
            "hmac-sha2-512",
            "hmac-sha1",
        ];
        let compression = ["none", "zlib@openssh.com", "zlib"];
        registry.defaults = AlgorithmProposal::new()
            .with(
                Slot::Kex,
                [
                    "curve25519-sha256",
                    "curve25519-sha256@libssh.org",
                    "ecdh-sha2-nistp256",
                    "diffie-hellman-group14-sha256",
                ],
            )
            .with(Slot::ServerHostKey, ["ssh-ed25519", "ecdsa-sha2-nistp256"])
            .with(Slot::EncryptionC2s, ciphers)
            .with(Slot::EncryptionS2c, ciphers)
            .with(Slot::MacC2s, macs)
            .with(Slot::MacS2c, macs)
            .with(Slot::CompressionC2s, compression)
            .with(Slot::CompressionS2c, compression);

        registry
    }

    /// Registers a KEX method.
    pub fn register_kex<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn KexMethod> + Send + Sync + 'static,
    {
        self.kex.insert(name.to_string(), Arc::new(factory));
    }

    /// Registers a host key signature algorithm.
    pub fn register_host_key(&mut self, name: &str, algorithm: Arc<dyn HostKeyAlgorithm>) {
        self.host_keys.insert(name.to_string(), algorithm);
    }

    /// Registers a cipher.
    pub fn register_cipher(&mut self, name: &str, spec: CipherSpec) {
        self.ciphers.insert(name.to_string(), spec);
    }

    /// Registers a MAC.
    pub fn register_mac(&mut self, name: &str, spec: MacSpec) {
        self.macs.insert(name.to_string(), spec);
    }

    /// Registers a compression method.
    pub fn register_compression(&mut self, name: &str, spec: CompressionSpec) {
        self.compression.insert(name.to_string(), spec);
    }

    /// Replaces the default list of one slot.
    ///
    /// # Errors
    ///
    /// Fails if a name has no registered constructor.
    pub fn set_default(&mut self, slot: Slot, names: &[&str]) -> LatchResult<()> {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        self.check_names(slot, &names)?;
        self.defaults.set(slot, names);
        Ok(())
    }

    /// Default preference lists for all slots.
    pub fn default_proposal(&self) -> &AlgorithmProposal {
        &self.defaults
    }

    /// KEX factory by name.
    pub fn kex(&self, name: &str) -> Option<&KexFactory> {
        self.kex.get(name)
    }

    /// Host key algorithm by name.
    pub fn host_key(&self, name: &str) -> Option<&Arc<dyn HostKeyAlgorithm>> {
        self.host_keys.get(name)
    }

    /// Cipher by name.
    pub fn cipher(&self, name: &str) -> Option<&CipherSpec> {
        self.ciphers.get(name)
    }

    /// MAC by name.
    pub fn mac(&self, name: &str) -> Option<&MacSpec> {
        self.macs.get(name)
    }

    /// Compression method by name.
    pub fn compression(&self, name: &str) -> Option<&CompressionSpec> {
        self.compression.get(name)
    }

    /// True if `name` is an AEAD cipher.
    pub fn is_aead(&self, name: &str) -> bool {
        self.cipher(name).is_some_and(|c| c.aead)
    }

    /// True if a constructor exists for `name` in `slot`.
    ///
    /// Language slots accept any name.
    pub fn is_known(&self, slot: Slot, name: &str) -> bool {
        match slot {
            Slot::Kex => self.kex.contains_key(name),
            Slot::ServerHostKey => self.host_keys.contains_key(name),
            Slot::EncryptionC2s | Slot::EncryptionS2c => self.ciphers.contains_key(name),
            Slot::MacC2s | Slot::MacS2c => self.macs.contains_key(name),
            Slot::CompressionC2s | Slot::CompressionS2c => self.compression.contains_key(name),
            Slot::LanguageC2s | Slot::LanguageS2c => true,
        }
    }

    fn check_names(&self, slot: Slot, names: &[String]) -> LatchResult<()> {
        match names.iter().find(|name| !self.is_known(slot, name)) {
            Some(unknown) => Err(LatchError::Config(format!(
                "Unsupported {} algorithm: {}",
                slot, unknown
            ))),
            None => Ok(()),
        }
    }

    /// Applies an override to the default list of `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::Config`] for unknown names or an empty result.
    pub fn resolve(&self, slot: Slot, spec: &str) -> LatchResult<Vec<String>> {
        let spec = spec.trim();
        let (op, rest) = match spec.chars().next() {
            Some(c @ ('+' | '^' | '-')) => (Some(c), &spec[1..]),
            _ => (None, spec),
        };
        let names: Vec<String> = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.check_names(slot, &names)?;

        let defaults = self.defaults.get(slot);
        let resolved: Vec<String> = match op {
            None => names,
            Some('+') => {
                let mut list = defaults.to_vec();
                for name in names {
                    if !list.contains(&name) {
                        list.push(name);
                    }
                }
                list
            }
            Some('^') => {
                let mut list = names.clone();
                list.extend(defaults.iter().filter(|d| !names.contains(d)).cloned());
                list
            }
            _ => defaults
                .iter()
                .filter(|d| !names.contains(d))
                .cloned()
                .collect(),
        };

        if resolved.is_empty() && !slot.is_language() {
            return Err(LatchError::Config(format!(
                "Algorithm list for {} is empty after applying \"{}\"",
                slot, spec
            )));
        }
        Ok(resolved)
    }
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kex: Vec<_> = self.kex.keys().collect();
        kex.sort();
        let mut ciphers: Vec<_> = self.ciphers.keys().collect();
        ciphers.sort();
        f.debug_struct("AlgorithmRegistry")
            .field("kex", &kex)
            .field("ciphers", &ciphers)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_registered() {
        let registry = AlgorithmRegistry::with_defaults();
        for slot in Slot::ALL {
            for name in registry.default_proposal().get(slot) {
                assert!(registry.is_known(slot, name), "{} {}", slot, name);
            }
        }
        assert!(registry.default_proposal().get(Slot::LanguageC2s).is_empty());
        assert!(!registry
            .default_proposal()
            .contains(Slot::EncryptionC2s, "none"));
        assert!(registry.cipher("none").is_some());
    }

    #[test]
    fn test_resolve_replace() {
        let registry = AlgorithmRegistry::with_defaults();
        assert_eq!(
            registry.resolve(Slot::MacC2s, "hmac-sha1, hmac-sha2-256").unwrap(),
            vec!["hmac-sha1", "hmac-sha2-256"]
        );
    }

    #[test]
    fn test_resolve_append_prepend_remove() {
        let registry = AlgorithmRegistry::with_defaults();
        let defaults = registry.default_proposal().get(Slot::CompressionC2s).to_vec();

        let appended = registry.resolve(Slot::CompressionC2s, "+zlib").unwrap();
        assert_eq!(appended, defaults);

        let prepended = registry.resolve(Slot::CompressionC2s, "^zlib").unwrap();
        assert_eq!(prepended, vec!["zlib", "none", "zlib@openssh.com"]);

        let removed = registry.resolve(Slot::CompressionC2s, "-zlib,zlib@openssh.com").unwrap();
        assert_eq!(removed, vec!["none"]);

        let with_none = registry.resolve(Slot::EncryptionC2s, "+none").unwrap();
        assert_eq!(with_none.last().map(String::as_str), Some("none"));
    }

    #[test]
    fn test_resolve_rejects_unknown_and_empty() {
        let registry = AlgorithmRegistry::with_defaults();
        let err = registry.resolve(Slot::Kex, "+sntrup761x25519-sha512").unwrap_err();
        assert!(matches!(err, LatchError::Config(msg) if msg.contains("sntrup761x25519-sha512")));
        assert!(registry.resolve(Slot::ServerHostKey, "-ssh-ed25519,ecdsa-sha2-nistp256").is_err());
        assert!(registry.resolve(Slot::MacC2s, "").is_err());
    }

    #[test]
    fn test_language_slots_pass_through() {
        let registry = AlgorithmRegistry::with_defaults();
        assert_eq!(registry.resolve(Slot::LanguageC2s, "en-US").unwrap(), vec!["en-US"]);
        assert!(registry.resolve(Slot::LanguageS2c, "").unwrap().is_empty());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = AlgorithmRegistry::with_defaults();
        let spec = *registry.cipher("aes128-ctr").unwrap();
        registry.register_cipher("onlyA", spec);
        assert_eq!(registry.resolve(Slot::EncryptionS2c, "onlyA").unwrap(), vec!["onlyA"]);
        registry.set_default(Slot::EncryptionS2c, &["onlyA"]).unwrap();
        assert!(registry.set_default(Slot::EncryptionS2c, &["onlyB"]).is_err());
    }

    #[test]
    fn test_aead_lookup() {
        let registry = AlgorithmRegistry::with_defaults();
        assert!(registry.is_aead("chacha20-poly1305@openssh.com"));
        assert!(registry.is_aead("aes128-gcm@openssh.com"));
        assert!(!registry.is_aead("aes128-ctr"));
        assert!(!registry.is_aead("unknown"));
    }
}
