//! Shared helpers for the integration tests.
//!
//! Provides the `testkex` and `testhostkey` plugins, loopback session pairs
//! over `tokio::io::duplex`, and a stream wrapper that can go silent.

#![allow(dead_code)]

use async_trait::async_trait;
use latch_platform::{LatchError, LatchResult};
use latch_proto::ssh::channel::{Channel, ChannelEvent};
use latch_proto::ssh::config::{TransportConfig, TransportConfigBuilder};
use latch_proto::ssh::crypto::HashAlgorithm;
use latch_proto::ssh::hostkey::{AcceptAnyHostKey, Ed25519HostKey, HostKeyAlgorithm, HostKeySigner};
use latch_proto::ssh::kex_driver::{KexContext, KexMethod, KexOutput};
use latch_proto::ssh::registry::AlgorithmRegistry;
use latch_proto::ssh::session::{Role, Session};
use latch_proto::ssh::wire::{WireReader, WireWrite};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

pub const TEST_KEX: &str = "testkex";
pub const TEST_HOST_KEY: &str = "testhostkey";

const TEST_KEX_INIT: u8 = 30;
const TEST_KEX_REPLY: u8 = 31;

/// Key exchange where both sides send 32 random bytes and K = SHA-256(e || f).
///
/// Not secure; only exercises the method plugin seam.
#[derive(Debug, Default)]
pub struct TestKex;

impl TestKex {
    fn secret(e: &[u8], f: &[u8]) -> Zeroizing<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(e);
        hasher.update(f);
        Zeroizing::new(hasher.finalize().to_vec())
    }

    fn inputs(e: &[u8], f: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_string(e);
        buf.put_string(f);
        buf
    }
}

fn random_bytes() -> Vec<u8> {
    let mut bytes = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn protocol(err: impl std::fmt::Display) -> LatchError {
    LatchError::Protocol(err.to_string())
}

#[async_trait]
impl KexMethod for TestKex {
    fn hash(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    async fn run(&mut self, ctx: &mut KexContext<'_>) -> LatchResult<KexOutput> {
        match ctx.role() {
            Role::Client => {
                let e = random_bytes();
                let mut init = vec![TEST_KEX_INIT];
                init.put_string(&e);
                ctx.send(init).await?;

                let reply = ctx.recv().await?;
                let mut r = WireReader::new(&reply);
                if r.read_u8().map_err(protocol)? != TEST_KEX_REPLY {
                    return Err(protocol("expected testkex reply"));
                }
                let host_key_blob = r.read_string().map_err(protocol)?.to_vec();
                let f = r.read_string().map_err(protocol)?.to_vec();
                let signature = r.read_string().map_err(protocol)?.to_vec();

                let shared_secret = Self::secret(&e, &f);
                let exchange_hash = ctx.exchange_hash(
                    self.hash(),
                    &host_key_blob,
                    &Self::inputs(&e, &f),
                    &shared_secret,
                );
                Ok(KexOutput {
                    shared_secret,
                    exchange_hash,
                    host_key_blob,
                    signature,
                })
            }
            Role::Server => {
                let init = ctx.recv().await?;
                let mut r = WireReader::new(&init);
                if r.read_u8().map_err(protocol)? != TEST_KEX_INIT {
                    return Err(protocol("expected testkex init"));
                }
                let e = r.read_string().map_err(protocol)?.to_vec();
                let f = random_bytes();

                let signer = ctx.signer()?;
                let host_key_blob = signer.public_key_blob();
                let shared_secret = Self::secret(&e, &f);
                let exchange_hash = ctx.exchange_hash(
                    self.hash(),
                    &host_key_blob,
                    &Self::inputs(&e, &f),
                    &shared_secret,
                );
                let signature = signer.sign(&exchange_hash)?;

                let mut reply = vec![TEST_KEX_REPLY];
                reply.put_string(&host_key_blob);
                reply.put_string(&f);
                reply.put_string(&signature);
                ctx.send(reply).await?;

                Ok(KexOutput {
                    shared_secret,
                    exchange_hash,
                    host_key_blob,
                    signature,
                })
            }
        }
    }
}

/// Host key whose "signature" is SHA-256(key || message).
#[derive(Debug, Clone)]
pub struct TestHostKey {
    key: Vec<u8>,
}

impl TestHostKey {
    pub fn generate() -> Self {
        Self { key: random_bytes() }
    }

    fn tag(key: &[u8], message: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(message);
        hasher.finalize().to_vec()
    }
}

impl HostKeySigner for TestHostKey {
    fn algorithm(&self) -> &str {
        TEST_HOST_KEY
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_str(TEST_HOST_KEY);
        buf.put_string(&self.key);
        buf
    }

    fn sign(&self, data: &[u8]) -> LatchResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.put_str(TEST_HOST_KEY);
        buf.put_string(&Self::tag(&self.key, data));
        Ok(buf)
    }
}

/// Verifier half of [`TestHostKey`].
#[derive(Debug, Clone, Copy)]
pub struct TestHostKeyVerify;

impl HostKeyAlgorithm for TestHostKeyVerify {
    fn verify(&self, key_blob: &[u8], signature_blob: &[u8], message: &[u8]) -> LatchResult<bool> {
        let mut key_reader = WireReader::new(key_blob);
        let mut sig_reader = WireReader::new(signature_blob);
        if key_reader.read_utf8()? != TEST_HOST_KEY || sig_reader.read_utf8()? != TEST_HOST_KEY {
            return Err(LatchError::Security("not a testhostkey blob".to_string()));
        }
        let key = key_reader.read_string()?;
        let tag = sig_reader.read_string()?;
        Ok(tag == TestHostKey::tag(key, message).as_slice())
    }
}

/// Default registry plus the test plugins.
pub fn registry() -> AlgorithmRegistry {
    let mut registry = AlgorithmRegistry::with_defaults();
    registry.register_kex(TEST_KEX, || Box::new(TestKex));
    registry.register_host_key(TEST_HOST_KEY, Arc::new(TestHostKeyVerify));
    registry
}

pub fn client_builder() -> TransportConfigBuilder {
    TransportConfig::builder()
        .with_registry(registry())
        .with_host("loopback")
        .with_connect_timeout(Duration::from_secs(10))
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
}

pub fn server_builder() -> TransportConfigBuilder {
    TransportConfig::builder()
        .with_role(Role::Server)
        .with_registry(registry())
        .with_connect_timeout(Duration::from_secs(10))
        .with_host_key_signer(Arc::new(Ed25519HostKey::generate()))
}

/// Routes engine logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Establishes both ends over an in-memory pipe.
pub async fn establish_pair<A, B>(
    client_io: A,
    server_io: B,
    client: TransportConfig,
    server: TransportConfig,
) -> (LatchResult<Session>, LatchResult<Session>)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    init_tracing();
    tokio::join!(
        Session::establish(client_io, Arc::new(client)),
        Session::establish(server_io, Arc::new(server)),
    )
}

/// Connected client and loopback server with the given configurations.
pub async fn pair_with(client: TransportConfig, server: TransportConfig) -> (Session, Session) {
    let (a, b) = tokio::io::duplex(1 << 16);
    let (client, server) = establish_pair(a, b, client, server).await;
    (client.expect("client establish"), server.expect("server establish"))
}

/// Connected client and loopback server with default settings.
pub async fn pair() -> (Session, Session) {
    pair_with(
        client_builder().build().unwrap(),
        server_builder().build().unwrap(),
    )
    .await
}

/// Accepts `session` channels on `server` and echoes data until EOF, then
/// sends EOF and CLOSE back.
pub fn spawn_echo(server: &Session) -> tokio::task::JoinHandle<()> {
    let mut listener = server.accept_channels("session").unwrap();
    tokio::spawn(async move {
        while let Ok(channel) = listener.accept().await {
            tokio::spawn(echo(channel));
        }
    })
}

async fn echo(channel: Channel) {
    while let Ok(Some(event)) = channel.recv().await {
        match event {
            ChannelEvent::Data(data) => {
                if channel.write(&data).await.is_err() {
                    return;
                }
            }
            ChannelEvent::Eof => {
                let _ = channel.eof().await;
                let _ = channel.close().await;
            }
            ChannelEvent::Closed => return,
            _ => {}
        }
    }
}

/// Reads data events until `len` bytes arrived.
pub async fn read_exact(channel: &Channel, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        match channel.recv().await.unwrap() {
            Some(ChannelEvent::Data(data)) => out.extend_from_slice(&data),
            Some(_) => {}
            None => break,
        }
    }
    out
}

/// Waits until `predicate` holds, polling every 10 ms for up to 5 s.
pub async fn eventually<F: Fn() -> bool>(predicate: F) -> bool {
    for _ in 0..500 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

/// Stream wrapper that can be switched to drop all traffic: reads never
/// complete and writes are discarded.
pub struct Muted {
    inner: DuplexStream,
    muted: Arc<AtomicBool>,
}

impl Muted {
    pub fn new(inner: DuplexStream) -> (Self, Arc<AtomicBool>) {
        let muted = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                muted: Arc::clone(&muted),
            },
            muted,
        )
    }
}

impl AsyncRead for Muted {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.muted.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Muted {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.muted.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(buf.len()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.muted.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
