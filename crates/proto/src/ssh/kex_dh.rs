//! Diffie-Hellman key exchange methods (RFC 5656, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.org
//! - ecdh-sha2-nistp256
//! - diffie-hellman-group14-sha256
//!
//! All three use message numbers 30 (client public value) and 31 (server
//! host key, public value and signature).
//!
//! # Security
//!
//! - Ephemeral keys are generated per exchange and consumed by the agreement
//! - Peer public values are validated before use
//! - Shared secrets are zeroized on drop

use crate::ssh::crypto::HashAlgorithm;
use crate::ssh::kex_driver::{KexContext, KexMethod, KexOutput};
use crate::ssh::message::{expect_message, MessageType};
use crate::ssh::session::Role;
use crate::ssh::wire::{WireReader, WireWrite};
use async_trait::async_trait;
use latch_platform::{LatchError, LatchResult};
use num_bigint::{BigUint, RandBigInt};
use ring::agreement::{self, agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey};
use ring::rand::SystemRandom;
use zeroize::Zeroizing;

/// Diffie-Hellman Group 14 parameters (RFC 3526).
///
/// This is a 2048-bit MODP group.
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    /// DH Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
             15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .expect("group 14 prime is valid hex"),
        )
    });

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Private exponent size in bits.
const DH_EXPONENT_BITS: u64 = 512;

/// Curve used by [`EcdhKex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    X25519,
    NistP256,
}

impl Curve {
    fn algorithm(&self) -> &'static agreement::Algorithm {
        match self {
            Curve::X25519 => &agreement::X25519,
            Curve::NistP256 => &agreement::ECDH_P256,
        }
    }

    fn public_len(&self) -> usize {
        match self {
            Curve::X25519 => 32,
            Curve::NistP256 => 65,
        }
    }
}

/// Elliptic-curve Diffie-Hellman over Curve25519 or NIST P-256.
#[derive(Debug)]
pub struct EcdhKex {
    curve: Curve,
}

impl EcdhKex {
    /// curve25519-sha256 (RFC 8731).
    pub fn curve25519() -> Self {
        Self {
            curve: Curve::X25519,
        }
    }

    /// ecdh-sha2-nistp256 (RFC 5656).
    pub fn nistp256() -> Self {
        Self {
            curve: Curve::NistP256,
        }
    }

    fn generate(&self) -> LatchResult<(EphemeralPrivateKey, Vec<u8>)> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(self.curve.algorithm(), &rng)
            .map_err(|_| LatchError::Security("Failed to generate ECDH key".to_string()))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| LatchError::Security("Failed to compute ECDH public key".to_string()))?;
        Ok((private_key, public_key.as_ref().to_vec()))
    }

    fn agree(&self, private_key: EphemeralPrivateKey, peer_public: &[u8]) -> LatchResult<Zeroizing<Vec<u8>>> {
        if peer_public.len() != self.curve.public_len() {
            return Err(LatchError::Protocol(format!(
                "Invalid ECDH public key length: {}",
                peer_public.len()
            )));
        }
        let peer = UnparsedPublicKey::new(self.curve.algorithm(), peer_public);
        agree_ephemeral(private_key, &peer, |secret| Zeroizing::new(secret.to_vec()))
            .map_err(|_| LatchError::Security("ECDH key agreement failed".to_string()))
    }

    async fn run_client(&self, ctx: &mut KexContext<'_>) -> LatchResult<KexOutput> {
        let (private_key, q_c) = self.generate()?;

        let mut init = Vec::with_capacity(5 + q_c.len());
        init.push(MessageType::KexdhInit as u8);
        init.put_string(&q_c);
        ctx.send(init).await?;

        let reply = ctx.recv().await?;
        let mut reader = WireReader::new(&reply);
        expect_message(&mut reader, MessageType::KexdhReply)?;
        let host_key_blob = reader.read_string()?.to_vec();
        let q_s = reader.read_string()?.to_vec();
        let signature = reader.read_string()?.to_vec();

        let shared_secret = self.agree(private_key, &q_s)?;
        let inputs = ecdh_inputs(&q_c, &q_s);
        let exchange_hash = ctx.exchange_hash(self.hash(), &host_key_blob, &inputs, &shared_secret);

        Ok(KexOutput {
            shared_secret,
            exchange_hash,
            host_key_blob,
            signature,
        })
    }

    async fn run_server(&self, ctx: &mut KexContext<'_>) -> LatchResult<KexOutput> {
        let init = ctx.recv().await?;
        let mut reader = WireReader::new(&init);
        expect_message(&mut reader, MessageType::KexdhInit)?;
        let q_c = reader.read_string()?.to_vec();

        let (private_key, q_s) = self.generate()?;
        let shared_secret = self.agree(private_key, &q_c)?;

        let signer = checked_signer(ctx)?;
        let host_key_blob = signer.public_key_blob();
        let inputs = ecdh_inputs(&q_c, &q_s);
        let exchange_hash = ctx.exchange_hash(self.hash(), &host_key_blob, &inputs, &shared_secret);
        let signature = signer.sign(&exchange_hash)?;

        ctx.send(kex_reply(&host_key_blob, |buf| buf.put_string(&q_s), &signature))
            .await?;

        Ok(KexOutput {
            shared_secret,
            exchange_hash,
            host_key_blob,
            signature,
        })
    }
}

#[async_trait]
impl KexMethod for EcdhKex {
    fn hash(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    async fn run(&mut self, ctx: &mut KexContext<'_>) -> LatchResult<KexOutput> {
        match ctx.role() {
            Role::Client => self.run_client(ctx).await,
            Role::Server => self.run_server(ctx).await,
        }
    }
}

/// diffie-hellman-group14-sha256 (RFC 8268).
#[derive(Debug, Default)]
pub struct DhGroup14Sha256;

impl DhGroup14Sha256 {
    /// Creates the method.
    pub fn new() -> Self {
        Self
    }

    /// Returns the private exponent x and the public value g^x mod p.
    fn generate() -> (Zeroizing<Vec<u8>>, BigUint) {
        let mut rng = rand::thread_rng();
        let low = BigUint::from(2u32);
        let high = BigUint::from(1u32) << DH_EXPONENT_BITS;
        let x = rng.gen_biguint_range(&low, &high);
        let public = dh_group14::G.modpow(&x, &dh_group14::P);
        (Zeroizing::new(x.to_bytes_be()), public)
    }

    /// Rejects peer values outside 1 < y < p - 1.
    fn check_public(y: &BigUint) -> LatchResult<()> {
        let one = BigUint::from(1u32);
        let p_minus_one = &*dh_group14::P - &one;
        if *y <= one || *y >= p_minus_one {
            return Err(LatchError::Protocol(
                "Invalid peer public key: out of range".to_string(),
            ));
        }
        Ok(())
    }

    fn shared_secret(x: &[u8], peer: &BigUint) -> LatchResult<Zeroizing<Vec<u8>>> {
        Self::check_public(peer)?;
        let x = BigUint::from_bytes_be(x);
        let k = peer.modpow(&x, &dh_group14::P);
        Ok(Zeroizing::new(k.to_bytes_be()))
    }

    async fn run_client(&self, ctx: &mut KexContext<'_>) -> LatchResult<KexOutput> {
        let (x, e) = Self::generate();
        let e_bytes = e.to_bytes_be();

        let mut init = Vec::with_capacity(8 + e_bytes.len());
        init.push(MessageType::KexdhInit as u8);
        init.put_mpint(&e_bytes);
        ctx.send(init).await?;

        let reply = ctx.recv().await?;
        let mut reader = WireReader::new(&reply);
        expect_message(&mut reader, MessageType::KexdhReply)?;
        let host_key_blob = reader.read_string()?.to_vec();
        let f_bytes = reader.read_mpint()?;
        let signature = reader.read_string()?.to_vec();

        let shared_secret = Self::shared_secret(&x, &BigUint::from_bytes_be(&f_bytes))?;
        let inputs = dh_inputs(&e_bytes, &f_bytes);
        let exchange_hash = ctx.exchange_hash(self.hash(), &host_key_blob, &inputs, &shared_secret);

        Ok(KexOutput {
            shared_secret,
            exchange_hash,
            host_key_blob,
            signature,
        })
    }

    async fn run_server(&self, ctx: &mut KexContext<'_>) -> LatchResult<KexOutput> {
        let init = ctx.recv().await?;
        let mut reader = WireReader::new(&init);
        expect_message(&mut reader, MessageType::KexdhInit)?;
        let e_bytes = reader.read_mpint()?;

        let (y, f) = Self::generate();
        let f_bytes = f.to_bytes_be();
        let shared_secret = Self::shared_secret(&y, &BigUint::from_bytes_be(&e_bytes))?;

        let signer = checked_signer(ctx)?;
        let host_key_blob = signer.public_key_blob();
        let inputs = dh_inputs(&e_bytes, &f_bytes);
        let exchange_hash = ctx.exchange_hash(self.hash(), &host_key_blob, &inputs, &shared_secret);
        let signature = signer.sign(&exchange_hash)?;

        ctx.send(kex_reply(&host_key_blob, |buf| buf.put_mpint(&f_bytes), &signature))
            .await?;

        Ok(KexOutput {
            shared_secret,
            exchange_hash,
            host_key_blob,
            signature,
        })
    }
}

#[async_trait]
impl KexMethod for DhGroup14Sha256 {
    fn hash(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    async fn run(&mut self, ctx: &mut KexContext<'_>) -> LatchResult<KexOutput> {
        match ctx.role() {
            Role::Client => self.run_client(ctx).await,
            Role::Server => self.run_server(ctx).await,
        }
    }
}

/// Host key signer whose algorithm matches the negotiated one.
fn checked_signer<'a>(
    ctx: &KexContext<'a>,
) -> LatchResult<&'a dyn crate::ssh::hostkey::HostKeySigner> {
    let signer = ctx.signer()?;
    if signer.algorithm() != ctx.host_key_algorithm() {
        return Err(LatchError::Protocol(format!(
            "Host key is {} but {} was negotiated",
            signer.algorithm(),
            ctx.host_key_algorithm()
        )));
    }
    Ok(signer)
}

/// `string Q_C || string Q_S`
fn ecdh_inputs(q_c: &[u8], q_s: &[u8]) -> Vec<u8> {
    let mut inputs = Vec::with_capacity(8 + q_c.len() + q_s.len());
    inputs.put_string(q_c);
    inputs.put_string(q_s);
    inputs
}

/// `mpint e || mpint f`
fn dh_inputs(e: &[u8], f: &[u8]) -> Vec<u8> {
    let mut inputs = Vec::with_capacity(10 + e.len() + f.len());
    inputs.put_mpint(e);
    inputs.put_mpint(f);
    inputs
}

/// Message 31: `string K_S`, server public value, `string signature`.
fn kex_reply(host_key_blob: &[u8], put_public: impl FnOnce(&mut Vec<u8>), signature: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(host_key_blob.len() + signature.len() + 300);
    reply.push(MessageType::KexdhReply as u8);
    reply.put_string(host_key_blob);
    put_public(&mut reply);
    reply.put_string(signature);
    reply
}
