//! Outbound half of a session.
//!
//! All sends are serialized through one lock so that sequence numbers match
//! the order packets hit the wire. While a key exchange is in flight, only
//! transport messages go out; everything else waits in a queue and is
//! flushed, in order, under the new keys.

use crate::ssh::message::MessageType;
use crate::ssh::packet::{DirectionKeys, PacketEncoder};
use crate::ssh::transport::RekeyCounters;
use latch_platform::{LatchError, LatchResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Boxed write half of the underlying stream.
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

struct WriterInner {
    io: BoxedWrite,
    encoder: PacketEncoder,
    kex_pending: bool,
    deferred: VecDeque<Vec<u8>>,
    shut_down: bool,
}

impl WriterInner {
    async fn write_packet(&mut self, payload: &[u8], counters: &RekeyCounters) -> LatchResult<()> {
        if self.shut_down {
            return Err(LatchError::Closed("Transport is shut down".to_string()));
        }
        let frame = self.encoder.encode(payload)?;
        self.io.write_all(&frame).await?;
        counters.add_outbound(frame.len());
        trace!(
            msg = payload.first().copied().unwrap_or_default(),
            len = frame.len(),
            "Sent packet"
        );
        Ok(())
    }

    async fn flush(&mut self) -> LatchResult<()> {
        self.io.flush().await?;
        Ok(())
    }
}

/// Serializing packet writer.
pub(crate) struct PacketWriter {
    inner: Mutex<WriterInner>,
    counters: Arc<RekeyCounters>,
}

impl PacketWriter {
    pub(crate) fn new(io: BoxedWrite, counters: Arc<RekeyCounters>) -> Self {
        Self {
            inner: Mutex::new(WriterInner {
                io,
                encoder: PacketEncoder::new(),
                kex_pending: false,
                deferred: VecDeque::new(),
                shut_down: false,
            }),
            counters,
        }
    }

    /// Sends a non-transport message, queueing it while keys are changing.
    pub(crate) async fn send(&self, payload: Vec<u8>) -> LatchResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.kex_pending {
            if inner.shut_down {
                return Err(LatchError::Closed("Transport is shut down".to_string()));
            }
            inner.deferred.push_back(payload);
            return Ok(());
        }
        inner.write_packet(&payload, &self.counters).await?;
        inner.flush().await
    }

    /// Sends a transport message, bypassing the queue.
    pub(crate) async fn send_transport(&self, payload: &[u8]) -> LatchResult<()> {
        let mut inner = self.inner.lock().await;
        inner.write_packet(payload, &self.counters).await?;
        inner.flush().await
    }

    /// Sends KEXINIT and starts holding back other messages.
    pub(crate) async fn begin_kex(&self, kexinit: &[u8]) -> LatchResult<()> {
        let mut inner = self.inner.lock().await;
        inner.kex_pending = true;
        inner.write_packet(kexinit, &self.counters).await?;
        inner.flush().await
    }

    /// Sends NEWKEYS, switches to `keys` and flushes held-back messages.
    pub(crate) async fn finish_kex(&self, keys: DirectionKeys, reset_sequence: bool) -> LatchResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .write_packet(&[MessageType::NewKeys as u8], &self.counters)
            .await?;
        inner.encoder.install(keys, reset_sequence);
        inner.kex_pending = false;
        let deferred = std::mem::take(&mut inner.deferred);
        if !deferred.is_empty() {
            debug!(count = deferred.len(), "Flushing messages held during key exchange");
        }
        for payload in deferred {
            inner.write_packet(&payload, &self.counters).await?;
        }
        inner.flush().await
    }

    /// Sequence number wraps stop being fatal once the initial exchange is done.
    pub(crate) async fn set_wrap_fatal(&self, fatal: bool) {
        self.inner.lock().await.encoder.set_wrap_fatal(fatal);
    }

    pub(crate) async fn enable_delayed_compression(&self) {
        self.inner.lock().await.encoder.enable_delayed_compression();
    }

    /// Sends a final message if possible and closes the stream.
    pub(crate) async fn shutdown(&self, last: Option<&[u8]>) {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return;
        }
        if let Some(payload) = last {
            if let Err(e) = inner.write_packet(payload, &self.counters).await {
                debug!("Could not send final message: {}", e);
            }
        }
        inner.shut_down = true;
        inner.deferred.clear();
        if let Err(e) = inner.io.shutdown().await {
            debug!("Stream shutdown failed: {}", e);
        }
    }
}
