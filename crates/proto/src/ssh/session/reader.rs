//! Inbound half of a session.
//!
//! The reader task owns the read half of the stream and the packet decoder.
//! It runs key exchanges in place, so no inbound packet is ever decrypted
//! with the wrong keys.

use super::{lock, Role, Shared};
use crate::ssh::kex::Slot;
use crate::ssh::kex_driver::{run_key_exchange, KexChannel, KexSetup, KexTransport};
use crate::ssh::logging;
use crate::ssh::message::{
    is_channel_message, is_kex_message, parse_unimplemented, unimplemented_payload, DebugMessage,
    Disconnect, ExtInfo, GlobalReply, GlobalRequest, MessageType,
};
use crate::ssh::packet::{DirectionKeys, Packet, PacketDecoder};
use crate::ssh::transport::{rekey_deadline, State};
use async_trait::async_trait;
use bytes::BytesMut;
use latch_platform::{LatchError, LatchResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Boxed read half of the underlying stream.
pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

const READ_BUFFER: usize = 32 * 1024;

/// What started a key exchange.
enum Trigger {
    Shutdown,
    Rekey(&'static str),
    Packet(Packet),
}

pub(crate) struct Reader {
    io: BoxedRead,
    buf: BytesMut,
    decoder: PacketDecoder,
    shared: Arc<Shared>,
    compression_enabled: bool,
    last_kex: Instant,
}

impl Reader {
    pub(crate) fn new(io: BoxedRead, shared: Arc<Shared>) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_BUFFER),
            decoder: PacketDecoder::new(shared.config.max_packet_len()),
            shared,
            compression_enabled: false,
            last_kex: Instant::now(),
        }
    }

    /// Reads and decodes the next packet.
    async fn next_packet(&mut self) -> LatchResult<Packet> {
        loop {
            if !self.compression_enabled && self.shared.is_authenticated() {
                self.decoder.enable_delayed_compression();
                self.compression_enabled = true;
            }
            if let Some(packet) = self.decoder.decode(&mut self.buf)? {
                if packet.payload.is_empty() {
                    return Err(LatchError::Protocol("Packet with empty payload".to_string()));
                }
                self.shared.counters.add_inbound(packet.wire_len);
                self.shared.packets_received.fetch_add(1, Ordering::Relaxed);
                trace!(
                    msg = packet.payload[0],
                    seq = packet.sequence_number,
                    len = packet.wire_len,
                    "Received packet"
                );
                return Ok(packet);
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(LatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }

    /// Runs the first key exchange of the connection.
    pub(crate) async fn initial_exchange(&mut self) -> LatchResult<()> {
        self.key_exchange(true, None).await?;
        self.shared.writer.set_wrap_fatal(false).await;
        self.decoder.set_wrap_fatal(false);
        self.shared.set_state(State::Ready);
        Ok(())
    }

    /// Runs a rekey, started locally or by the peer's KEXINIT.
    async fn rekey(&mut self, peer_kexinit: Option<(Vec<u8>, u32)>, reason: &str) -> LatchResult<()> {
        let shared = Arc::clone(&self.shared);
        shared.set_state(State::Rekeying);
        logging::log_rekey_start(shared.session_id(), reason);
        self.key_exchange(false, peer_kexinit).await?;
        shared.set_state(State::Ready);
        let exchange_hash = lock(&shared.kex).exchange_hash.clone();
        logging::log_rekey_complete(shared.session_id(), &exchange_hash, shared.status.borrow().kex_count);
        Ok(())
    }

    async fn key_exchange(&mut self, initial: bool, peer_kexinit: Option<(Vec<u8>, u32)>) -> LatchResult<()> {
        let shared = Arc::clone(&self.shared);
        let previous_host_key = if initial {
            None
        } else {
            Some(lock(&shared.kex).host_key.clone())
        };
        let setup = KexSetup {
            role: shared.role(),
            initial,
            authenticated: shared.is_authenticated(),
            strict: shared.strict.load(Ordering::Relaxed),
            config: shared.config(),
            local_version: shared.local_version.as_str(),
            peer_version: shared.peer_version.as_str(),
            session_id: shared.session_id.get().map(Vec::as_slice),
            previous_host_key: previous_host_key.as_deref(),
            peer_kexinit,
        };
        let mut io = KexIo {
            reader: self,
            strict: false,
        };
        let outcome = run_key_exchange(&mut io, setup).await?;

        let _ = shared.session_id.set(outcome.session_id.clone());
        {
            let mut record = lock(&shared.kex);
            record.negotiated = Some(outcome.negotiated);
            record.exchange_hash = outcome.exchange_hash;
            record.host_key = outcome.host_key;
        }
        shared.strict.store(outcome.strict, Ordering::Relaxed);
        shared.counters.reset();
        shared.rekey_requested.store(false, Ordering::Release);
        self.last_kex = Instant::now();

        if outcome.send_ext_info {
            let algorithms = shared.config.proposal().get(Slot::ServerHostKey).join(",");
            let ext_info = ExtInfo {
                extensions: vec![("server-sig-algs".to_string(), algorithms.into_bytes())],
            };
            shared.send(ext_info.to_bytes()).await?;
        }
        Ok(())
    }

    /// Reader task body. Runs until the connection fails or is closed, then
    /// tears the session down.
    pub(crate) async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        if let Err(e) = self.serve().await {
            shared.fail(e);
        }
        shared.finish().await;
    }

    async fn serve(&mut self) -> LatchResult<()> {
        let shared = Arc::clone(&self.shared);
        loop {
            let deadline = rekey_deadline(self.last_kex.into_std(), shared.config.rekey_limits())
                .map(Instant::from_std);
            let interval_elapsed = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            let trigger = tokio::select! {
                biased;
                _ = shared.shutdown.notified() => Trigger::Shutdown,
                _ = shared.rekey.notified() => {
                    if shared.rekey_requested.load(Ordering::Acquire) {
                        Trigger::Rekey("requested")
                    } else if shared.counters.exceeds(shared.config.rekey_limits()) {
                        Trigger::Rekey("limits")
                    } else {
                        continue;
                    }
                }
                _ = interval_elapsed => Trigger::Rekey("interval"),
                packet = self.next_packet() => Trigger::Packet(packet?),
            };

            let exchange = match trigger {
                Trigger::Shutdown => return Ok(()),
                Trigger::Rekey(reason) => self.rekey(None, reason),
                Trigger::Packet(packet) if packet.payload[0] == MessageType::KexInit as u8 => {
                    self.rekey(Some((packet.payload, packet.sequence_number)), "peer")
                }
                Trigger::Packet(packet) => {
                    self.dispatch(packet).await?;
                    if shared.counters.exceeds(shared.config.rekey_limits()) {
                        shared.rekey.notify_one();
                    }
                    continue;
                }
            };
            tokio::select! {
                biased;
                _ = shared.shutdown.notified() => return Ok(()),
                result = exchange => result?,
            }
        }
    }

    /// Handles one message outside a key exchange, or one that arrived
    /// during a non-strict exchange.
    async fn dispatch(&mut self, packet: Packet) -> LatchResult<()> {
        let shared = Arc::clone(&self.shared);
        let payload = packet.payload;
        let msg = payload[0];

        match MessageType::from_u8(msg) {
            Some(MessageType::Disconnect) => {
                let disconnect = Disconnect::from_bytes(&payload)?;
                Err(LatchError::Disconnected {
                    reason: disconnect.reason,
                    description: disconnect.description,
                })
            }
            Some(MessageType::Ignore) => Ok(()),
            Some(MessageType::Debug) => {
                let debug_msg = DebugMessage::from_bytes(&payload)?;
                if debug_msg.always_display {
                    warn!(message = %debug_msg.message, "Peer debug message");
                } else {
                    debug!(message = %debug_msg.message, "Peer debug message");
                }
                Ok(())
            }
            Some(MessageType::Unimplemented) => {
                let seq = parse_unimplemented(&payload)?;
                warn!(seq, "Peer could not handle one of our packets");
                Ok(())
            }
            Some(MessageType::ExtInfo) => {
                if shared.role() != Role::Client
                    || !shared.config.ext_info()
                    || shared.is_authenticated()
                {
                    debug!("Ignoring unexpected EXT_INFO");
                    return Ok(());
                }
                let ext_info = ExtInfo::from_bytes(&payload)?;
                if let Some(algorithms) = ext_info.server_sig_algs() {
                    debug!(server_sig_algs = %algorithms.join(","), "Received EXT_INFO");
                    *lock(&shared.server_sig_algs) = Some(algorithms);
                }
                Ok(())
            }
            Some(MessageType::UserauthSuccess) if shared.role() == Role::Client => {
                shared.authenticated.store(true, Ordering::Release);
                shared.writer.enable_delayed_compression().await;
                self.deliver(payload)
            }
            Some(MessageType::GlobalRequest) => {
                let request = GlobalRequest::from_bytes(&payload)?;
                debug!(name = %request.name, "Refusing global request");
                if request.want_reply {
                    shared.send(vec![MessageType::RequestFailure as u8]).await?;
                }
                Ok(())
            }
            Some(MessageType::RequestSuccess) => {
                shared.complete_global_request(GlobalReply::Success(payload[1..].to_vec()));
                Ok(())
            }
            Some(MessageType::RequestFailure) => {
                shared.complete_global_request(GlobalReply::Failure);
                Ok(())
            }
            _ if matches!(msg, 5 | 6 | 50..=79) => self.deliver(payload),
            _ if is_channel_message(msg) => {
                let actions = shared.mux.handle(&payload)?;
                for reply in actions.replies {
                    shared.send(reply).await?;
                }
                if let Some((listener, channel)) = actions.accepted {
                    if let Err(refused) = listener.send(channel) {
                        if let Some(close) = shared.mux.refuse_accepted(&refused.0) {
                            shared.send(close).await?;
                        }
                    }
                }
                Ok(())
            }
            _ if is_kex_message(msg) => Err(LatchError::Protocol(format!(
                "Unexpected key exchange message {} outside a key exchange",
                msg
            ))),
            _ => {
                debug!(msg, seq = packet.sequence_number, "Unimplemented message");
                shared.send(unimplemented_payload(packet.sequence_number)).await
            }
        }
    }

    /// Queues an upper-layer message for [`super::Session::recv_message`].
    fn deliver(&self, payload: Vec<u8>) -> LatchResult<()> {
        if self.shared.inbox_tx.send(payload).is_err() {
            debug!("Dropping upper-layer message, nobody is receiving");
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Expect {
    KexInit,
    Method,
    NewKeys,
}

/// The reader seen by the key exchange driver.
struct KexIo<'a> {
    reader: &'a mut Reader,
    strict: bool,
}

impl KexIo<'_> {
    async fn recv_expected(&mut self, expect: Expect) -> LatchResult<Packet> {
        loop {
            let packet = self.reader.next_packet().await?;
            let msg = packet.payload[0];
            let found = match msg {
                20 => Expect::KexInit,
                21 => Expect::NewKeys,
                30..=49 => Expect::Method,
                _ => {
                    self.pass_through(packet).await?;
                    continue;
                }
            };
            if found != expect {
                return Err(LatchError::Protocol(format!(
                    "Unexpected {} during key exchange",
                    MessageType::from_u8(msg)
                        .map_or_else(|| format!("message {}", msg), |m| m.name().to_string())
                )));
            }
            return Ok(packet);
        }
    }

    async fn pass_through(&mut self, packet: Packet) -> LatchResult<()> {
        let msg = packet.payload[0];
        if self.strict && msg != MessageType::Disconnect as u8 {
            return Err(LatchError::StrictKex(format!(
                "Unexpected message {} during strict key exchange",
                msg
            )));
        }
        self.reader.dispatch(packet).await
    }
}

#[async_trait]
impl KexChannel for KexIo<'_> {
    async fn send_kex(&mut self, payload: Vec<u8>) -> LatchResult<()> {
        self.reader.shared.writer.send_transport(&payload).await
    }

    async fn recv_kex(&mut self) -> LatchResult<Vec<u8>> {
        Ok(self.recv_expected(Expect::Method).await?.payload)
    }
}

#[async_trait]
impl KexTransport for KexIo<'_> {
    async fn send_kexinit(&mut self, payload: Vec<u8>) -> LatchResult<()> {
        self.reader.shared.writer.begin_kex(&payload).await
    }

    async fn recv_kexinit(&mut self) -> LatchResult<(Vec<u8>, u32)> {
        let packet = self.recv_expected(Expect::KexInit).await?;
        Ok((packet.payload, packet.sequence_number))
    }

    fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    async fn send_newkeys(&mut self, keys: DirectionKeys, reset_sequence: bool) -> LatchResult<()> {
        self.reader.shared.writer.finish_kex(keys, reset_sequence).await
    }

    async fn recv_newkeys(&mut self) -> LatchResult<()> {
        self.recv_expected(Expect::NewKeys).await.map(drop)
    }

    fn install_inbound(&mut self, keys: DirectionKeys, reset_sequence: bool) {
        self.reader.decoder.install(keys, reset_sequence);
        self.reader.compression_enabled = false;
    }
}
