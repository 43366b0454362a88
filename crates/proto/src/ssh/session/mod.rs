//! SSH transport session runtime.
//!
//! A [`Session`] owns one connection. A background reader task decodes every
//! inbound packet and dispatches it: transport messages are handled in place,
//! channel messages go to the multiplexer, and authentication messages are
//! queued for [`Session::recv_message`]. Outbound packets from any task go
//! through a single serialized writer.
//!
//! The first fatal error on either path becomes the session's termination
//! cause. Every blocked or later caller then gets
//! [`LatchError::Terminated`] carrying that cause.
//!
//! # Example
//!
//! ```rust,no_run
//! use latch_proto::ssh::config::TransportConfig;
//! use latch_proto::ssh::hostkey::AcceptAnyHostKey;
//! use latch_proto::ssh::session::Session;
//! use std::sync::Arc;
//!
//! # async fn run() -> latch_platform::LatchResult<()> {
//! let config = TransportConfig::builder()
//!     .with_host("example.org")
//!     .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
//!     .build()?;
//! let stream = tokio::net::TcpStream::connect("example.org:22").await?;
//! let session = Session::establish(stream, Arc::new(config)).await?;
//! println!("session id {}", hex::encode(session.session_id()));
//! # Ok(())
//! # }
//! ```

mod keepalive;
mod reader;
mod writer;

pub use keepalive::KEEPALIVE_REQUEST;

use crate::ssh::channel::{Channel, ChannelListener};
use crate::ssh::config::TransportConfig;
use crate::ssh::connection::{ChannelOpen, SESSION_CHANNEL};
use crate::ssh::dispatcher::Multiplexer;
use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::logging;
use crate::ssh::message::{
    parse_service, service_payload, Disconnect, DisconnectReason, GlobalReply, GlobalRequest,
    MessageType,
};
use crate::ssh::transport::{RekeyCounters, State, TransportState};
use crate::ssh::version::{read_version, write_version, Version};
use async_trait::async_trait;
use keepalive::{KeepaliveProbe, KeepaliveTask};
use latch_platform::{LatchError, LatchResult};
use reader::{BoxedRead, Reader};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use writer::{BoxedWrite, PacketWriter};

/// Upper bound on sending the final DISCONNECT.
const FINAL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which side of the connection this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator; verifies the server's host key
    Client,
    /// Responder; signs the exchange hash. Used for loopback testing
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Client => "client",
            Role::Server => "server",
        })
    }
}

/// Observable lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Transport state
    pub state: State,
    /// Completed key exchanges, the initial one included
    pub kex_count: u64,
}

/// Results of the latest key exchange.
#[derive(Debug, Default)]
struct KexRecord {
    negotiated: Option<NegotiatedAlgorithms>,
    exchange_hash: Vec<u8>,
    host_key: Vec<u8>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the session handle, its reader task and its channels.
pub(crate) struct Shared {
    config: Arc<TransportConfig>,
    local_version: Version,
    peer_version: Version,
    writer: PacketWriter,
    counters: Arc<RekeyCounters>,
    mux: Multiplexer,
    state: Mutex<TransportState>,
    status: watch::Sender<SessionStatus>,
    cause: OnceLock<Arc<LatchError>>,
    shutdown: Notify,
    rekey: Notify,
    rekey_requested: AtomicBool,
    authenticated: AtomicBool,
    strict: AtomicBool,
    packets_received: AtomicU64,
    session_id: OnceLock<Vec<u8>>,
    kex: Mutex<KexRecord>,
    server_sig_algs: Mutex<Option<Vec<String>>>,
    inbox_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    global_replies: Mutex<VecDeque<oneshot::Sender<GlobalReply>>>,
    /// Keeps reply slots in the same order as requests on the wire
    global_order: tokio::sync::Mutex<()>,
}

impl Shared {
    fn new(
        config: Arc<TransportConfig>,
        local_version: Version,
        peer_version: Version,
        io: BoxedWrite,
        state: TransportState,
    ) -> Self {
        let counters = Arc::new(RekeyCounters::new());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SessionStatus {
            state: state.current(),
            kex_count: state.kex_count(),
        });
        Self {
            mux: Multiplexer::new(config.channel_window(), config.channel_max_packet()),
            writer: PacketWriter::new(io, Arc::clone(&counters)),
            counters,
            config,
            local_version,
            peer_version,
            state: Mutex::new(state),
            status,
            cause: OnceLock::new(),
            shutdown: Notify::new(),
            rekey: Notify::new(),
            rekey_requested: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            strict: AtomicBool::new(false),
            packets_received: AtomicU64::new(0),
            session_id: OnceLock::new(),
            kex: Mutex::new(KexRecord::default()),
            server_sig_algs: Mutex::new(None),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            global_replies: Mutex::new(VecDeque::new()),
            global_order: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    fn role(&self) -> Role {
        self.config.role()
    }

    fn session_id(&self) -> &[u8] {
        self.session_id.get().map_or(&[], Vec::as_slice)
    }

    fn state(&self) -> State {
        lock(&self.state).current()
    }

    /// Moves the lifecycle forward and publishes the new status.
    fn set_state(&self, next: State) {
        let mut state = lock(&self.state);
        let previous = state.current();
        if let Err(e) = state.transition(next) {
            debug!("Ignoring state change: {}", e);
            return;
        }
        if previous != next {
            logging::log_state_transition(self.session_id(), &previous.to_string(), &next.to_string());
        }
        self.status.send_replace(SessionStatus {
            state: state.current(),
            kex_count: state.kex_count(),
        });
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn cause(&self) -> Option<&Arc<LatchError>> {
        self.cause.get()
    }

    /// Error to hand to callers once the session is gone.
    pub(crate) fn terminated_error(&self) -> LatchError {
        match self.cause.get() {
            Some(cause) => LatchError::Terminated(Arc::clone(cause)),
            None => LatchError::Closed("Session is closed".to_string()),
        }
    }

    /// Records the termination cause and wakes everything that waits on the
    /// session. Only the first call has any effect.
    pub(crate) fn fail(&self, err: LatchError) -> bool {
        let local = !matches!(err, LatchError::Disconnected { .. });
        let reason = match &err {
            LatchError::Disconnected { reason, .. } => Some(*reason),
            _ => None,
        };
        let description = err.to_string();
        if self.cause.set(Arc::new(err)).is_err() {
            return false;
        }
        logging::log_disconnect(reason, &description, local);
        let Some(cause) = self.cause.get().cloned() else {
            return false;
        };
        self.set_state(State::Closing);
        self.mux.shutdown(cause);
        lock(&self.global_replies).clear();
        self.shutdown.notify_one();
        true
    }

    /// Waits until the session starts tearing down.
    async fn wait_closing(&self) {
        let mut status = self.status.subscribe();
        let _ = status
            .wait_for(|s| matches!(s.state, State::Closing | State::Disconnected))
            .await;
    }

    /// Sends a non-transport message. A write failure terminates the session.
    pub(crate) async fn send(&self, payload: Vec<u8>) -> LatchResult<()> {
        if self.cause.get().is_some() {
            return Err(self.terminated_error());
        }
        match self.writer.send(payload).await {
            Ok(()) => {
                if self.counters.exceeds(self.config.rekey_limits()) {
                    self.rekey.notify_one();
                }
                Ok(())
            }
            Err(e) => {
                self.fail(e);
                Err(self.terminated_error())
            }
        }
    }

    /// Sends a global request; with `want_reply` returns the reply slot.
    async fn send_global_request(
        &self,
        request: GlobalRequest,
    ) -> LatchResult<Option<oneshot::Receiver<GlobalReply>>> {
        let _order = self.global_order.lock().await;
        let reply = if request.want_reply {
            let (tx, rx) = oneshot::channel();
            lock(&self.global_replies).push_back(tx);
            Some(rx)
        } else {
            None
        };
        self.send(request.to_bytes()).await?;
        Ok(reply)
    }

    /// Completes the oldest outstanding global request.
    fn complete_global_request(&self, reply: GlobalReply) {
        match lock(&self.global_replies).pop_front() {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("Global request reply without a pending request"),
        }
    }

    /// Final teardown once the reader has stopped.
    async fn finish(&self) {
        let last = self.cause.get().and_then(|cause| disconnect_payload(cause));
        if tokio::time::timeout(FINAL_WRITE_TIMEOUT, self.writer.shutdown(last.as_deref()))
            .await
            .is_err()
        {
            debug!("Timed out sending final DISCONNECT");
        }
        self.set_state(State::Disconnected);
    }
}

/// DISCONNECT to send for a local fatal error; none when the peer already
/// disconnected or the stream is gone.
fn disconnect_payload(err: &LatchError) -> Option<Vec<u8>> {
    let root = err.root_cause();
    let description = match root {
        LatchError::Disconnected { .. } | LatchError::Io(_) => return None,
        LatchError::Closed(msg) => msg.clone(),
        other => other.to_string(),
    };
    Some(Disconnect::new(DisconnectReason::for_error(root), description).to_bytes())
}

struct SessionProbe(Arc<Shared>);

#[async_trait]
impl KeepaliveProbe for SessionProbe {
    fn activity(&self) -> u64 {
        self.0.packets_received.load(Ordering::Relaxed)
    }

    async fn probe(&self) -> LatchResult<()> {
        let request = GlobalRequest {
            name: KEEPALIVE_REQUEST.to_string(),
            want_reply: true,
            data: Vec::new(),
        };
        // The reply only needs to show up as inbound activity
        self.0.send_global_request(request).await.map(drop)
    }

    fn expire(&self, missed: u32) {
        self.0.fail(LatchError::Timeout(format!(
            "No response from peer after {} keepalive intervals",
            missed
        )));
    }
}

/// An established SSH transport session.
///
/// Dropping the session terminates it; channels still held fail with
/// [`LatchError::Terminated`].
pub struct Session {
    shared: Arc<Shared>,
    session_id: Vec<u8>,
    reader: Option<JoinHandle<()>>,
    keepalive: Option<KeepaliveTask>,
}

impl Session {
    /// Runs the banner exchange and the initial key exchange over `stream`,
    /// then starts the reader task.
    ///
    /// Both steps together must finish within the configured connect
    /// timeout. On failure a best-effort DISCONNECT is sent and the original
    /// error is returned.
    pub async fn establish<S>(stream: S, config: Arc<TransportConfig>) -> LatchResult<Session>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let started = Instant::now();
        let limit = config.connect_timeout();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut read: BoxedRead = Box::new(read_half);
        let mut write: BoxedWrite = Box::new(write_half);

        let mut state = TransportState::new();
        state.transition(State::BannerExchange)?;
        let local_version = config.version();
        let banner = async {
            write_version(&mut write, &local_version).await?;
            read_version(&mut read).await
        };
        let peer_version = match tokio::time::timeout(limit, banner).await {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                logging::log_handshake_failed(&e.to_string());
                return Err(e);
            }
            Err(_) => {
                return Err(LatchError::Timeout(
                    "Timed out waiting for the peer identification".to_string(),
                ))
            }
        };
        logging::log_handshake_start(peer_version.as_str(), &config.role().to_string());

        let shared = Arc::new(Shared::new(
            Arc::clone(&config),
            local_version,
            peer_version,
            write,
            state,
        ));
        shared.set_state(State::InitialKex);

        let mut reader = Reader::new(read, Arc::clone(&shared));
        let remaining = limit.saturating_sub(started.elapsed());
        let result = match tokio::time::timeout(remaining, reader.initial_exchange()).await {
            Ok(result) => result,
            Err(_) => Err(LatchError::Timeout(
                "Timed out during the initial key exchange".to_string(),
            )),
        };
        if let Err(e) = result {
            logging::log_handshake_failed(&e.to_string());
            let last = disconnect_payload(&e);
            let _ = tokio::time::timeout(FINAL_WRITE_TIMEOUT, shared.writer.shutdown(last.as_deref()))
                .await;
            return Err(e);
        }

        let session_id = shared.session_id().to_vec();
        logging::log_handshake_complete(&session_id, started.elapsed().as_millis() as u64);

        let reader = {
            let shared = Arc::clone(&shared);
            let task = tokio::spawn(reader.run());
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    warn!(error = %e, "Reader task ended abnormally");
                    shared.fail(LatchError::Closed(format!("Reader task failed: {}", e)));
                    shared.finish().await;
                }
            })
        };
        let keepalive = config.keepalive().map(|settings| {
            let mut task = KeepaliveTask::new(*settings);
            task.start(SessionProbe(Arc::clone(&shared)));
            task
        });

        Ok(Session {
            shared,
            session_id,
            reader: Some(reader),
            keepalive,
        })
    }

    /// Configuration the session was established with.
    pub fn config(&self) -> &TransportConfig {
        self.shared.config()
    }

    /// Role this side plays.
    pub fn role(&self) -> Role {
        self.shared.role()
    }

    /// Current transport state.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// State and exchange count, updated as they change.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Session identifier: the exchange hash of the first key exchange.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// Exchange hash of the most recent key exchange.
    pub fn exchange_hash(&self) -> Vec<u8> {
        lock(&self.shared.kex).exchange_hash.clone()
    }

    /// Server host key blob from the most recent key exchange.
    pub fn host_key(&self) -> Vec<u8> {
        lock(&self.shared.kex).host_key.clone()
    }

    /// Algorithms of the most recent key exchange.
    pub fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        lock(&self.shared.kex).negotiated.clone()
    }

    /// Completed key exchanges, the initial one included.
    pub fn kex_count(&self) -> u64 {
        self.shared.status.borrow().kex_count
    }

    /// Whether strict key exchange was negotiated.
    pub fn is_strict_kex(&self) -> bool {
        self.shared.strict.load(Ordering::Relaxed)
    }

    /// Signature algorithms the server accepts for user authentication, from
    /// its EXT_INFO.
    pub fn server_sig_algs(&self) -> Option<Vec<String>> {
        lock(&self.shared.server_sig_algs).clone()
    }

    /// Whether user authentication has succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.shared.is_authenticated()
    }

    /// Local identification line.
    pub fn local_version(&self) -> &Version {
        &self.shared.local_version
    }

    /// Peer identification line.
    pub fn peer_version(&self) -> &Version {
        &self.shared.peer_version
    }

    /// Number of channels that are not yet torn down.
    pub fn channel_count(&self) -> usize {
        self.shared.mux.channel_count()
    }

    /// Starts a key exchange and waits for it to complete.
    pub async fn rekey(&self) -> LatchResult<()> {
        let mut status = self.shared.status.subscribe();
        let before = status.borrow().kex_count;
        self.shared.rekey_requested.store(true, Ordering::Release);
        self.shared.rekey.notify_one();

        let done = match status
            .wait_for(|s| {
                s.kex_count > before || matches!(s.state, State::Closing | State::Disconnected)
            })
            .await
        {
            Ok(status) => status.kex_count > before,
            Err(_) => false,
        };
        if done {
            Ok(())
        } else {
            Err(self.shared.terminated_error())
        }
    }

    /// Opens a channel of `channel_type` with type-specific `type_data`.
    ///
    /// Fails with [`LatchError::ChannelOpenFailed`] if the peer refuses and
    /// [`LatchError::Timeout`] if no answer arrives within the configured
    /// open timeout; neither affects the session.
    pub async fn open_channel(&self, channel_type: &str, type_data: &[u8]) -> LatchResult<Channel> {
        let (channel, reply) = self.shared.mux.begin_open()?;
        let (window, max_packet) = self.shared.mux.local_limits();
        let open = ChannelOpen::new(channel_type, channel.local_id, window, max_packet)
            .with_type_data(type_data.to_vec());
        self.shared.send(open.to_bytes()).await?;

        let limit = self.shared.config.channel_open_timeout();
        match tokio::time::timeout(limit, reply).await {
            Ok(Ok(Ok(()))) => {
                logging::log_channel_open(channel.local_id, channel.lock().remote_id, channel_type);
                Ok(Channel::new(Arc::clone(&self.shared), channel))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(self.shared.terminated_error()),
            Err(_) => {
                if let Some(close) = self.shared.mux.abandon_open(&channel) {
                    self.shared.send(close).await?;
                }
                Err(LatchError::Timeout(format!(
                    "Channel open timed out after {:?}",
                    limit
                )))
            }
        }
    }

    /// Opens a `session` channel.
    pub async fn open_session_channel(&self) -> LatchResult<Channel> {
        self.open_channel(SESSION_CHANNEL, &[]).await
    }

    /// Accepts peer-initiated channels of `channel_type`.
    ///
    /// Without a listener such opens are refused. Registering again for the
    /// same type replaces the earlier listener.
    pub fn accept_channels(&self, channel_type: &str) -> LatchResult<ChannelListener> {
        let rx = self.shared.mux.listen(channel_type)?;
        Ok(ChannelListener::new(Arc::clone(&self.shared), channel_type, rx))
    }

    /// Sends a global request.
    ///
    /// With `want_reply` this waits for the peer's answer; replies are
    /// matched to requests in order. Otherwise returns `None` once sent.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> LatchResult<Option<GlobalReply>> {
        let request = GlobalRequest {
            name: name.to_string(),
            want_reply,
            data: data.to_vec(),
        };
        match self.shared.send_global_request(request).await? {
            Some(rx) => match rx.await {
                Ok(reply) => Ok(Some(reply)),
                Err(_) => Err(self.shared.terminated_error()),
            },
            None => Ok(None),
        }
    }

    /// Requests a service (e.g. `ssh-userauth`) and waits for it to be accepted.
    pub async fn request_service(&self, name: &str) -> LatchResult<()> {
        self.shared
            .send(service_payload(MessageType::ServiceRequest, name))
            .await?;
        let reply = self.recv_message().await?;
        let accepted = parse_service(&reply, MessageType::ServiceAccept)?;
        if accepted != name {
            return Err(LatchError::Protocol(format!(
                "Requested service {} but peer accepted {}",
                name, accepted
            )));
        }
        debug!(service = name, "Service accepted");
        Ok(())
    }

    /// Sends an upper-layer message: service or authentication messages
    /// (5, 6, 50-79) or local extensions (128-255).
    ///
    /// Key exchange, channel and other transport messages are managed by the
    /// session and are rejected here.
    pub async fn send_message(&self, payload: Vec<u8>) -> LatchResult<()> {
        let msg = payload.first().copied().ok_or_else(|| {
            LatchError::Protocol("Cannot send an empty message".to_string())
        })?;
        if !matches!(msg, 5 | 6 | 50..=79 | 128..=255) {
            return Err(LatchError::Protocol(format!(
                "Message {} is managed by the session",
                msg
            )));
        }
        self.shared.send(payload).await?;
        if msg == MessageType::UserauthSuccess as u8 && self.role() == Role::Server {
            self.shared.authenticated.store(true, Ordering::Release);
            self.shared.writer.enable_delayed_compression().await;
        }
        Ok(())
    }

    /// Waits for the next upper-layer message (service accept, 50-79).
    pub async fn recv_message(&self) -> LatchResult<Vec<u8>> {
        let mut inbox = self.shared.inbox_rx.lock().await;
        if let Ok(payload) = inbox.try_recv() {
            return Ok(payload);
        }
        tokio::select! {
            biased;
            payload = inbox.recv() => payload.ok_or_else(|| self.shared.terminated_error()),
            _ = self.shared.wait_closing() => match inbox.try_recv() {
                Ok(payload) => Ok(payload),
                Err(_) => Err(self.shared.terminated_error()),
            },
        }
    }

    /// Sends DISCONNECT (by application) and waits for teardown.
    pub async fn disconnect(&self, description: &str) -> LatchResult<()> {
        self.shared.fail(LatchError::Closed(description.to_string()));
        self.closed().await;
        Ok(())
    }

    /// Waits until the session is fully torn down and returns the cause.
    pub async fn closed(&self) -> Arc<LatchError> {
        let mut status = self.shared.status.subscribe();
        let _ = status
            .wait_for(|s| s.state == State::Disconnected)
            .await;
        self.termination_cause()
            .unwrap_or_else(|| Arc::new(LatchError::Closed("Session is closed".to_string())))
    }

    /// Termination cause, once the session started tearing down.
    pub fn termination_cause(&self) -> Option<Arc<LatchError>> {
        self.shared.cause().cloned()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role())
            .field("state", &self.state())
            .field("session_id", &hex::encode(&self.session_id))
            .field("peer_version", &self.shared.peer_version.as_str())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        self.shared
            .fail(LatchError::Closed("Session dropped".to_string()));
        // The reader sends DISCONNECT and exits on its own
        drop(self.reader.take());
        info!(session_id = %hex::encode(&self.session_id), "Session handle dropped");
    }
}
