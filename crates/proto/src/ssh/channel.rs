//! SSH channel handles (RFC 4254 Section 5).
//!
//! A [`Channel`] is one logical stream multiplexed over a session. Writes
//! respect the peer's window and maximum packet size; reads yield
//! [`ChannelEvent`]s in arrival order and return window credit as data is
//! consumed.
//!
//! # Channel Lifecycle
//!
//! ```text
//! Opening -> Open -> Closing -> Closed
//!               \________________/
//! ```
//!
//! EOF in either direction is tracked separately from the state; a channel
//! may be half-closed and still `Open`. Both sides must send CLOSE before the
//! local id is released.

use crate::ssh::config::CHANNEL_PACKET_OVERHEAD;
use crate::ssh::connection::{
    encode_data, string_request_data, ChannelEof, ChannelExtendedData, ChannelRequest, ExitSignal,
};
use crate::ssh::dispatcher::ChannelShared;
use crate::ssh::session::Shared;
use bytes::Bytes;
use latch_platform::{LatchError, LatchResult};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Decides whether to grant an inbound channel request that wants a reply.
///
/// Called with the request type and its raw data. Runs on the session's
/// reader task, so it must not block.
pub type RequestHandler = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open sent, waiting for confirmation
    Opening,
    /// Channel is open and usable
    Open,
    /// Local CLOSE sent, waiting for the peer's CLOSE
    Closing,
    /// Both sides closed, or the session terminated
    Closed,
}

/// Something that happened on a channel, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Regular data
    Data(Bytes),
    /// Extended data, e.g. stderr
    ExtendedData {
        /// Data type code ([`EXTENDED_DATA_STDERR`](crate::ssh::connection::EXTENDED_DATA_STDERR) for stderr)
        code: u32,
        /// The data
        data: Bytes,
    },
    /// Peer will send no more data
    Eof,
    /// Channel request from the peer
    Request {
        /// Request type name
        request_type: String,
        /// Whether the peer asked for a reply
        want_reply: bool,
        /// Request-specific data
        data: Vec<u8>,
    },
    /// Peer closed the channel; no further events follow
    Closed,
}

/// Point-in-time view of a channel's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Local channel id
    pub local_id: u32,
    /// Peer's channel id
    pub remote_id: u32,
    /// Lifecycle state
    pub state: ChannelState,
    /// Local EOF sent
    pub eof_sent: bool,
    /// Peer EOF received
    pub eof_received: bool,
    /// Credit the peer still has for sending to us
    pub local_window: u32,
    /// Credit we still have for sending to the peer
    pub remote_window: u32,
    /// Largest data payload we accept
    pub local_max_packet: u32,
    /// Largest data payload the peer accepts
    pub remote_max_packet: u32,
}

/// Handle to an open channel.
///
/// Dropping the handle closes the channel.
pub struct Channel {
    session: Arc<Shared>,
    inner: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(session: Arc<Shared>, inner: Arc<ChannelShared>) -> Self {
        Self { session, inner }
    }

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.inner.local_id
    }

    /// Peer's channel id.
    pub fn remote_id(&self) -> u32 {
        self.inner.lock().remote_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// Snapshot of windows, ids and state.
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.inner.snapshot()
    }

    /// Exit status reported by the peer, if any.
    pub fn exit_status(&self) -> Option<u32> {
        self.inner.lock().exit_status
    }

    /// Exit signal reported by the peer, if any.
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.inner.lock().exit_signal.clone()
    }

    /// Installs the handler that answers inbound requests with `want_reply`.
    ///
    /// Without a handler such requests are refused.
    pub fn set_request_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.inner.lock().request_handler = Some(Arc::new(handler));
    }

    /// Writes data, waiting for window credit as needed.
    ///
    /// Data is split so that no message exceeds the peer's maximum packet
    /// size or the available window.
    pub async fn write(&self, data: &[u8]) -> LatchResult<()> {
        self.write_chunks(data, |remote_id, chunk| encode_data(remote_id, chunk))
            .await
    }

    /// Writes extended data, e.g. stderr with [`EXTENDED_DATA_STDERR`](crate::ssh::connection::EXTENDED_DATA_STDERR).
    pub async fn write_extended(&self, code: u32, data: &[u8]) -> LatchResult<()> {
        self.write_chunks(data, |remote_id, chunk| {
            ChannelExtendedData::new(remote_id, code, chunk.to_vec()).to_bytes()
        })
        .await
    }

    async fn write_chunks<F>(&self, data: &[u8], encode: F) -> LatchResult<()>
    where
        F: Fn(u32, &[u8]) -> Vec<u8>,
    {
        let transport_limit =
            (self.session.config().max_packet_len() - CHANNEL_PACKET_OVERHEAD) as u32;
        let mut offset = 0;
        while offset < data.len() {
            let (remote_id, max_packet) = self.inner.writable()?;
            let limit = max_packet.min(transport_limit) as usize;
            let wanted = limit.min(data.len() - offset);
            let granted = self.inner.acquire_window(wanted).await?;
            let chunk = &data[offset..offset + granted];
            self.session.send(encode(remote_id, chunk)).await?;
            offset += granted;
        }
        Ok(())
    }

    /// Waits for the next event.
    ///
    /// Returns `Ok(None)` once the channel is closed and all events were
    /// consumed. Consuming data may send a window adjustment to the peer.
    pub async fn recv(&self) -> LatchResult<Option<ChannelEvent>> {
        loop {
            match self.inner.take_event() {
                Ok(Some((event, adjust))) => {
                    if let Some(adjust) = adjust {
                        self.session.send(adjust).await?;
                    }
                    return Ok(Some(event));
                }
                Ok(None) => self.inner.notify.notified().await,
                Err(LatchError::ChannelClosed(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads regular data until EOF or close.
    ///
    /// Extended data and requests are skipped.
    pub async fn read_to_end(&self) -> LatchResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(event) = self.recv().await? {
            match event {
                ChannelEvent::Data(data) => out.extend_from_slice(&data),
                ChannelEvent::Eof | ChannelEvent::Closed => break,
                _ => {}
            }
        }
        Ok(out)
    }

    /// Sends a channel request.
    ///
    /// With `want_reply` this waits for SUCCESS (true) or FAILURE (false);
    /// replies are matched to requests in order. Without it, returns true as
    /// soon as the request is queued.
    pub async fn send_request(
        &self,
        request_type: &str,
        want_reply: bool,
        data: &[u8],
    ) -> LatchResult<bool> {
        let (remote_id, reply) = self.inner.register_request(want_reply)?;
        let request = ChannelRequest::new(remote_id, request_type, want_reply, data.to_vec());
        self.session.send(request.to_bytes()).await?;
        match reply {
            Some(rx) => match rx.await {
                Ok(granted) => Ok(granted),
                Err(_) => Err(self.inner.closed_error()),
            },
            None => Ok(true),
        }
    }

    /// Runs `command` on a session channel.
    pub async fn exec(&self, command: &str) -> LatchResult<bool> {
        self.send_request("exec", true, &string_request_data(command))
            .await
    }

    /// Sends EOF. Further writes fail.
    pub async fn eof(&self) -> LatchResult<()> {
        if let Some(remote_id) = self.inner.mark_eof()? {
            self.session.send(ChannelEof::new(remote_id).to_bytes()).await?;
        }
        Ok(())
    }

    /// Sends CLOSE. The id is released once the peer's CLOSE arrives.
    pub async fn close(&self) -> LatchResult<()> {
        if let Some(payload) = self.session.mux().begin_close(&self.inner) {
            self.session.send(payload).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.inner.local_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let Some(payload) = self.session.mux().begin_close(&self.inner) else {
            return;
        };
        let local_id = self.inner.local_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let session = Arc::clone(&self.session);
                handle.spawn(async move {
                    if let Err(e) = session.send(payload).await {
                        debug!(channel = local_id, "Close on drop failed: {}", e);
                    }
                });
            }
            Err(_) => debug!(channel = local_id, "Dropped outside a runtime; close not sent"),
        }
    }
}

/// Receives channels the peer opens with one channel type.
pub struct ChannelListener {
    session: Arc<Shared>,
    channel_type: String,
    rx: mpsc::UnboundedReceiver<Arc<ChannelShared>>,
}

impl ChannelListener {
    pub(crate) fn new(
        session: Arc<Shared>,
        channel_type: &str,
        rx: mpsc::UnboundedReceiver<Arc<ChannelShared>>,
    ) -> Self {
        Self {
            session,
            channel_type: channel_type.to_string(),
            rx,
        }
    }

    /// Channel type this listener accepts.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Waits for the next inbound channel.
    pub async fn accept(&mut self) -> LatchResult<Channel> {
        match self.rx.recv().await {
            Some(inner) => Ok(Channel::new(Arc::clone(&self.session), inner)),
            None => Err(self.session.terminated_error()),
        }
    }
}

impl std::fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelListener")
            .field("channel_type", &self.channel_type)
            .finish()
    }
}

pub(crate) type OpenReply = oneshot::Sender<LatchResult<()>>;
