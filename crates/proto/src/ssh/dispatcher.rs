//! Channel multiplexer.
//!
//! Routes channel messages (90-100) to per-channel state, allocates local
//! channel ids and enforces the flow-control limits advertised to the peer.
//! Runs on the session's reader task; anything it needs sent is returned to
//! the caller as [`MuxActions`].
//!
//! Lock order is multiplexer first, then channel. A channel lock is never
//! held while the multiplexer lock is taken.

use crate::ssh::channel::{ChannelEvent, ChannelSnapshot, ChannelState, OpenReply, RequestHandler};
use crate::ssh::connection::{
    parse_exit_status, ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure,
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelRequest, ChannelSuccess, ChannelWindowAdjust, ExitSignal,
};
use crate::ssh::logging;
use crate::ssh::message::MessageType;
use bytes::Bytes;
use latch_platform::{LatchError, LatchResult};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, warn};

/// Hands out local channel ids.
///
/// Ids come from an increasing counter; a released id is reused only after
/// its channel is fully torn down.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next: u32,
    free: BTreeSet<u32>,
}

impl IdAllocator {
    pub(crate) fn allocate(&mut self) -> LatchResult<u32> {
        if let Some(id) = self.free.pop_first() {
            return Ok(id);
        }
        let id = self.next;
        self.next = self
            .next
            .checked_add(1)
            .ok_or_else(|| LatchError::Protocol("Channel ids exhausted".to_string()))?;
        Ok(id)
    }

    pub(crate) fn release(&mut self, id: u32) {
        if id < self.next {
            self.free.insert(id);
        }
    }
}

/// Mutable per-channel bookkeeping.
pub(crate) struct ChannelCore {
    pub(crate) remote_id: u32,
    pub(crate) state: ChannelState,
    pub(crate) eof_sent: bool,
    pub(crate) eof_received: bool,
    pub(crate) close_sent: bool,
    pub(crate) close_received: bool,
    pub(crate) remote_max_packet: u32,
    pub(crate) local_window: u32,
    pub(crate) local_initial_window: u32,
    pub(crate) local_max_packet: u32,
    /// Bytes handed to the application but not yet credited back
    pub(crate) consumed: u32,
    pub(crate) events: VecDeque<ChannelEvent>,
    pub(crate) pending_requests: VecDeque<oneshot::Sender<bool>>,
    pub(crate) request_handler: Option<RequestHandler>,
    pub(crate) exit_status: Option<u32>,
    pub(crate) exit_signal: Option<ExitSignal>,
    pub(crate) open_reply: Option<OpenReply>,
    /// Open timed out; a late confirmation is closed straight away
    pub(crate) abandoned: bool,
    /// Session termination cause, once terminated
    pub(crate) error: Option<Arc<LatchError>>,
}

/// State shared between a [`Channel`](crate::ssh::channel::Channel) handle and
/// the multiplexer.
pub(crate) struct ChannelShared {
    pub(crate) local_id: u32,
    core: Mutex<ChannelCore>,
    /// One permit per byte the peer lets us send
    remote_window: Semaphore,
    pub(crate) notify: Notify,
}

impl ChannelShared {
    fn new(local_id: u32, window: u32, max_packet: u32, state: ChannelState) -> Self {
        Self {
            local_id,
            core: Mutex::new(ChannelCore {
                remote_id: 0,
                state,
                eof_sent: false,
                eof_received: false,
                close_sent: false,
                close_received: false,
                remote_max_packet: 0,
                local_window: window,
                local_initial_window: window,
                local_max_packet: max_packet,
                consumed: 0,
                events: VecDeque::new(),
                pending_requests: VecDeque::new(),
                request_handler: None,
                exit_status: None,
                exit_signal: None,
                open_reply: None,
                abandoned: false,
                error: None,
            }),
            remote_window: Semaphore::new(0),
            notify: Notify::new(),
        }
    }

    /// Adds to the peer's window. The window never grows past 2^32-1 or
    /// what the semaphore can count.
    fn grant_window(&self, bytes: u32) {
        let limit = (u32::MAX as usize).min(Semaphore::MAX_PERMITS);
        let room = limit.saturating_sub(self.remote_window.available_permits());
        self.remote_window.add_permits((bytes as usize).min(room));
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelCore> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn snapshot(&self) -> ChannelSnapshot {
        let core = self.lock();
        ChannelSnapshot {
            local_id: self.local_id,
            remote_id: core.remote_id,
            state: core.state,
            eof_sent: core.eof_sent,
            eof_received: core.eof_received,
            local_window: core.local_window,
            remote_window: self.remote_window.available_permits().min(u32::MAX as usize) as u32,
            local_max_packet: core.local_max_packet,
            remote_max_packet: core.remote_max_packet,
        }
    }

    fn error_from(&self, core: &ChannelCore) -> LatchError {
        match &core.error {
            Some(cause) => LatchError::Terminated(Arc::clone(cause)),
            None => LatchError::ChannelClosed(self.local_id),
        }
    }

    pub(crate) fn closed_error(&self) -> LatchError {
        let core = self.lock();
        self.error_from(&core)
    }

    /// Returns the peer's id and packet limit if data may still be sent.
    pub(crate) fn writable(&self) -> LatchResult<(u32, u32)> {
        let core = self.lock();
        if core.state != ChannelState::Open || core.eof_sent || core.close_sent {
            return Err(self.error_from(&core));
        }
        Ok((core.remote_id, core.remote_max_packet.max(1)))
    }

    /// Waits for at least one byte of window and takes up to `wanted`.
    pub(crate) async fn acquire_window(&self, wanted: usize) -> LatchResult<usize> {
        let first = match self.remote_window.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(self.closed_error()),
        };
        first.forget();
        let extra = self.remote_window.available_permits().min(wanted.saturating_sub(1));
        if extra == 0 {
            return Ok(1);
        }
        match self.remote_window.try_acquire_many(extra as u32) {
            Ok(permits) => {
                permits.forget();
                Ok(1 + extra)
            }
            // Raced with another writer on the same channel
            Err(_) => Ok(1),
        }
    }

    /// Pops the next event, crediting consumed data back to the peer.
    ///
    /// Returns `Ok(None)` when nothing is queued yet, and the closed error
    /// once the channel is closed and drained.
    pub(crate) fn take_event(&self) -> LatchResult<Option<(ChannelEvent, Option<Vec<u8>>)>> {
        let mut core = self.lock();
        let Some(event) = core.events.pop_front() else {
            if core.state == ChannelState::Closed {
                return Err(self.error_from(&core));
            }
            return Ok(None);
        };

        let len = match &event {
            ChannelEvent::Data(data) => data.len(),
            ChannelEvent::ExtendedData { data, .. } => data.len(),
            _ => 0,
        };
        let mut adjust = None;
        if len > 0 {
            core.consumed = core.consumed.saturating_add(len as u32);
            let open = !core.close_sent && !core.close_received && !core.eof_received;
            if open && core.local_window < core.local_initial_window / 2 {
                let credit = core.consumed;
                core.local_window = core.local_window.saturating_add(credit);
                core.consumed = 0;
                adjust = Some(ChannelWindowAdjust::new(core.remote_id, credit).to_bytes());
            }
        }
        Ok(Some((event, adjust)))
    }

    /// Registers a reply slot for a channel request.
    pub(crate) fn register_request(
        &self,
        want_reply: bool,
    ) -> LatchResult<(u32, Option<oneshot::Receiver<bool>>)> {
        let mut core = self.lock();
        if core.state != ChannelState::Open || core.close_sent {
            return Err(self.error_from(&core));
        }
        let reply = if want_reply {
            let (tx, rx) = oneshot::channel();
            core.pending_requests.push_back(tx);
            Some(rx)
        } else {
            None
        };
        Ok((core.remote_id, reply))
    }

    /// Marks local EOF; returns the peer's id if EOF still has to be sent.
    pub(crate) fn mark_eof(&self) -> LatchResult<Option<u32>> {
        let mut core = self.lock();
        if core.eof_sent {
            return Ok(None);
        }
        if core.state != ChannelState::Open || core.close_sent {
            return Err(self.error_from(&core));
        }
        core.eof_sent = true;
        Ok(Some(core.remote_id))
    }

    fn push_event(&self, core: &mut ChannelCore, event: ChannelEvent) {
        core.events.push_back(event);
        self.notify.notify_one();
    }

    /// Final teardown: no more sends, no more events after `Closed`.
    fn finish(&self, core: &mut ChannelCore, error: Option<Arc<LatchError>>) {
        if core.state == ChannelState::Closed {
            return;
        }
        core.state = ChannelState::Closed;
        if error.is_none() {
            core.events.push_back(ChannelEvent::Closed);
        }
        core.error = error;
        core.pending_requests.clear();
        self.remote_window.close();
        self.notify.notify_one();
    }
}

/// Messages and hand-offs the reader must perform after routing a message.
#[derive(Default)]
pub(crate) struct MuxActions {
    /// Payloads to send, in order
    pub(crate) replies: Vec<Vec<u8>>,
    /// Inbound channel to deliver once the confirmation is sent
    pub(crate) accepted: Option<(mpsc::UnboundedSender<Arc<ChannelShared>>, Arc<ChannelShared>)>,
}

impl MuxActions {
    fn reply(payload: Vec<u8>) -> Self {
        Self {
            replies: vec![payload],
            accepted: None,
        }
    }
}

#[derive(Default)]
struct MuxInner {
    ids: IdAllocator,
    channels: HashMap<u32, Arc<ChannelShared>>,
    listeners: HashMap<String, mpsc::UnboundedSender<Arc<ChannelShared>>>,
    terminated: Option<Arc<LatchError>>,
}

/// Owns every channel of one session.
pub(crate) struct Multiplexer {
    inner: Mutex<MuxInner>,
    window: u32,
    max_packet: u32,
}

impl Multiplexer {
    pub(crate) fn new(window: u32, max_packet: u32) -> Self {
        Self {
            inner: Mutex::new(MuxInner::default()),
            window,
            max_packet,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Local window and maximum packet advertised for new channels.
    pub(crate) fn local_limits(&self) -> (u32, u32) {
        (self.window, self.max_packet)
    }

    /// Number of channels not yet torn down.
    pub(crate) fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    fn terminated_error(inner: &MuxInner) -> LatchResult<()> {
        match &inner.terminated {
            Some(cause) => Err(LatchError::Terminated(Arc::clone(cause))),
            None => Ok(()),
        }
    }

    /// Allocates an id for a locally initiated open.
    pub(crate) fn begin_open(
        &self,
    ) -> LatchResult<(Arc<ChannelShared>, oneshot::Receiver<LatchResult<()>>)> {
        let mut inner = self.lock();
        Self::terminated_error(&inner)?;
        let id = inner.ids.allocate()?;
        let channel = Arc::new(ChannelShared::new(
            id,
            self.window,
            self.max_packet,
            ChannelState::Opening,
        ));
        let (tx, rx) = oneshot::channel();
        channel.lock().open_reply = Some(tx);
        inner.channels.insert(id, Arc::clone(&channel));
        Ok((channel, rx))
    }

    /// Gives up on an open that timed out.
    ///
    /// Returns a CLOSE to send if the confirmation slipped in meanwhile.
    pub(crate) fn abandon_open(&self, channel: &Arc<ChannelShared>) -> Option<Vec<u8>> {
        let mut core = channel.lock();
        match core.state {
            ChannelState::Opening => {
                core.abandoned = true;
                core.open_reply = None;
                None
            }
            ChannelState::Open if !core.close_sent => {
                core.close_sent = true;
                core.state = ChannelState::Closing;
                channel.remote_window.close();
                Some(ChannelClose::new(core.remote_id).to_bytes())
            }
            _ => None,
        }
    }

    /// Starts a local close; returns the CLOSE to send, if one is due.
    pub(crate) fn begin_close(&self, channel: &Arc<ChannelShared>) -> Option<Vec<u8>> {
        let mut core = channel.lock();
        if core.close_sent || core.state != ChannelState::Open {
            return None;
        }
        core.close_sent = true;
        core.state = ChannelState::Closing;
        channel.remote_window.close();
        debug!(channel = channel.local_id, "Closing channel");
        Some(ChannelClose::new(core.remote_id).to_bytes())
    }

    /// Registers the receiver for peer-initiated opens of `channel_type`.
    pub(crate) fn listen(
        &self,
        channel_type: &str,
    ) -> LatchResult<mpsc::UnboundedReceiver<Arc<ChannelShared>>> {
        let mut inner = self.lock();
        Self::terminated_error(&inner)?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.listeners.insert(channel_type.to_string(), tx);
        Ok(rx)
    }

    fn lookup(&self, msg: u8, id: u32) -> LatchResult<Arc<ChannelShared>> {
        self.lock().channels.get(&id).cloned().ok_or_else(|| {
            LatchError::Protocol(format!(
                "{} for unknown channel {}",
                MessageType::from_u8(msg).map_or("channel message", |m| m.name()),
                id
            ))
        })
    }

    fn release(&self, id: u32) {
        let mut inner = self.lock();
        if inner.channels.remove(&id).is_some() {
            inner.ids.release(id);
            debug!(channel = id, "Channel released");
        }
    }

    /// Routes one channel message.
    pub(crate) fn handle(&self, payload: &[u8]) -> LatchResult<MuxActions> {
        let msg = payload.first().copied().unwrap_or_default();
        match MessageType::from_u8(msg) {
            Some(MessageType::ChannelOpen) => self.on_open(payload),
            Some(MessageType::ChannelOpenConfirmation) => self.on_confirmation(payload),
            Some(MessageType::ChannelOpenFailure) => self.on_open_failure(payload),
            Some(MessageType::ChannelWindowAdjust) => self.on_window_adjust(payload),
            Some(MessageType::ChannelData) => {
                let data = ChannelData::from_bytes(payload)?;
                let id = data.recipient_channel();
                self.on_data(msg, id, None, data.into_data())
            }
            Some(MessageType::ChannelExtendedData) => {
                let data = ChannelExtendedData::from_bytes(payload)?;
                self.on_data(
                    msg,
                    data.recipient_channel(),
                    Some(data.data_type_code()),
                    data.data().to_vec(),
                )
            }
            Some(MessageType::ChannelEof) => {
                let eof = ChannelEof::from_bytes(payload)?;
                let channel = self.lookup(msg, eof.recipient_channel())?;
                let mut core = channel.lock();
                if !core.eof_received && core.state != ChannelState::Closed {
                    core.eof_received = true;
                    channel.push_event(&mut core, ChannelEvent::Eof);
                }
                Ok(MuxActions::default())
            }
            Some(MessageType::ChannelClose) => self.on_close(payload),
            Some(MessageType::ChannelRequest) => self.on_request(payload),
            Some(MessageType::ChannelSuccess) => {
                let id = ChannelSuccess::from_bytes(payload)?.recipient_channel();
                self.on_request_reply(msg, id, true)
            }
            Some(MessageType::ChannelFailure) => {
                let id = ChannelFailure::from_bytes(payload)?.recipient_channel();
                self.on_request_reply(msg, id, false)
            }
            _ => Err(LatchError::Protocol(format!(
                "Message {} is not a channel message",
                msg
            ))),
        }
    }

    fn on_open(&self, payload: &[u8]) -> LatchResult<MuxActions> {
        let open = ChannelOpen::from_bytes(payload)?;
        let mut inner = self.lock();

        let listener = inner
            .listeners
            .get(open.channel_type())
            .filter(|tx| !tx.is_closed())
            .cloned();
        let Some(listener) = listener else {
            debug!(channel_type = open.channel_type(), "Refusing channel open");
            let failure = ChannelOpenFailure::with_description(
                open.sender_channel(),
                ChannelOpenFailureReason::AdministrativelyProhibited,
                &format!("open refused: {} channels not accepted", open.channel_type()),
            );
            return Ok(MuxActions::reply(failure.to_bytes()));
        };
        if open.maximum_packet_size() == 0 {
            return Err(LatchError::Protocol(
                "Channel open with zero maximum packet size".to_string(),
            ));
        }

        let id = inner.ids.allocate()?;
        let channel = Arc::new(ChannelShared::new(
            id,
            self.window,
            self.max_packet,
            ChannelState::Open,
        ));
        {
            let mut core = channel.lock();
            core.remote_id = open.sender_channel();
            core.remote_max_packet = open.maximum_packet_size();
        }
        channel.grant_window(open.initial_window_size());
        inner.channels.insert(id, Arc::clone(&channel));

        logging::log_channel_open(id, open.sender_channel(), open.channel_type());
        let confirmation =
            ChannelOpenConfirmation::new(open.sender_channel(), id, self.window, self.max_packet);
        Ok(MuxActions {
            replies: vec![confirmation.to_bytes()],
            accepted: Some((listener, channel)),
        })
    }

    /// Called when an accepted channel could not be handed to its listener.
    pub(crate) fn refuse_accepted(&self, channel: &Arc<ChannelShared>) -> Option<Vec<u8>> {
        self.begin_close(channel)
    }

    fn on_confirmation(&self, payload: &[u8]) -> LatchResult<MuxActions> {
        let confirmation = ChannelOpenConfirmation::from_bytes(payload)?;
        let channel = self.lookup(payload[0], confirmation.recipient_channel())?;
        let mut core = channel.lock();
        if core.state != ChannelState::Opening {
            return Err(LatchError::Protocol(format!(
                "Unexpected open confirmation for channel {}",
                channel.local_id
            )));
        }
        if confirmation.maximum_packet_size() == 0 {
            return Err(LatchError::Protocol(
                "Open confirmation with zero maximum packet size".to_string(),
            ));
        }
        core.remote_id = confirmation.sender_channel();
        core.remote_max_packet = confirmation.maximum_packet_size();
        core.state = ChannelState::Open;
        channel.grant_window(confirmation.initial_window_size());

        let delivered = match core.open_reply.take() {
            Some(tx) => tx.send(Ok(())).is_ok(),
            None => false,
        };
        if core.abandoned || !delivered {
            debug!(channel = channel.local_id, "Closing channel confirmed after its open was abandoned");
            core.close_sent = true;
            core.state = ChannelState::Closing;
            channel.remote_window.close();
            return Ok(MuxActions::reply(ChannelClose::new(core.remote_id).to_bytes()));
        }
        debug!(
            channel = channel.local_id,
            remote = core.remote_id,
            window = confirmation.initial_window_size(),
            max_packet = core.remote_max_packet,
            "Channel open confirmed"
        );
        Ok(MuxActions::default())
    }

    fn on_open_failure(&self, payload: &[u8]) -> LatchResult<MuxActions> {
        let failure = ChannelOpenFailure::from_bytes(payload)?;
        let channel = self.lookup(payload[0], failure.recipient_channel())?;
        {
            let mut core = channel.lock();
            if core.state != ChannelState::Opening {
                return Err(LatchError::Protocol(format!(
                    "Unexpected open failure for channel {}",
                    channel.local_id
                )));
            }
            if let Some(tx) = core.open_reply.take() {
                let _ = tx.send(Err(LatchError::ChannelOpenFailed {
                    reason: failure.reason_code(),
                    description: failure.description().to_string(),
                }));
            }
            channel.finish(&mut core, None);
        }
        self.release(channel.local_id);
        Ok(MuxActions::default())
    }

    fn on_window_adjust(&self, payload: &[u8]) -> LatchResult<MuxActions> {
        let adjust = ChannelWindowAdjust::from_bytes(payload)?;
        let channel = self.lookup(payload[0], adjust.recipient_channel())?;
        let core = channel.lock();
        if core.state == ChannelState::Opening {
            return Err(LatchError::Protocol(format!(
                "Window adjust for unconfirmed channel {}",
                channel.local_id
            )));
        }
        channel.grant_window(adjust.bytes_to_add());
        Ok(MuxActions::default())
    }

    fn on_data(
        &self,
        msg: u8,
        id: u32,
        code: Option<u32>,
        data: Vec<u8>,
    ) -> LatchResult<MuxActions> {
        let channel = self.lookup(msg, id)?;
        let mut core = channel.lock();
        if core.state == ChannelState::Opening {
            return Err(LatchError::Protocol(format!(
                "Data for unconfirmed channel {}",
                id
            )));
        }
        let len = data.len();
        if len > core.local_max_packet as usize {
            return Err(LatchError::FlowControl(format!(
                "Channel {}: {} bytes exceed maximum packet size {}",
                id, len, core.local_max_packet
            )));
        }
        if len > core.local_window as usize {
            return Err(LatchError::FlowControl(format!(
                "Channel {}: {} bytes exceed window {}",
                id, len, core.local_window
            )));
        }
        core.local_window -= len as u32;

        if core.eof_received {
            warn!(channel = id, "Discarding data received after EOF");
            return Ok(MuxActions::default());
        }
        if core.close_sent || core.state == ChannelState::Closed {
            return Ok(MuxActions::default());
        }
        let data = Bytes::from(data);
        let event = match code {
            Some(code) => ChannelEvent::ExtendedData { code, data },
            None => ChannelEvent::Data(data),
        };
        channel.push_event(&mut core, event);
        Ok(MuxActions::default())
    }

    fn on_close(&self, payload: &[u8]) -> LatchResult<MuxActions> {
        let close = ChannelClose::from_bytes(payload)?;
        let channel = self.lookup(payload[0], close.recipient_channel())?;
        let mut actions = MuxActions::default();
        {
            let mut core = channel.lock();
            if core.state == ChannelState::Opening {
                return Err(LatchError::Protocol(format!(
                    "Close for unconfirmed channel {}",
                    channel.local_id
                )));
            }
            core.close_received = true;
            if !core.close_sent {
                core.close_sent = true;
                actions.replies.push(ChannelClose::new(core.remote_id).to_bytes());
            }
            channel.finish(&mut core, None);
        }
        logging::log_channel_closed(channel.local_id);
        self.release(channel.local_id);
        Ok(actions)
    }

    fn on_request(&self, payload: &[u8]) -> LatchResult<MuxActions> {
        let request = ChannelRequest::from_bytes(payload)?;
        let channel = self.lookup(payload[0], request.recipient_channel())?;
        let (remote_id, handler, can_reply) = {
            let mut core = channel.lock();
            if core.state == ChannelState::Opening {
                return Err(LatchError::Protocol(format!(
                    "Request for unconfirmed channel {}",
                    channel.local_id
                )));
            }
            match request.request_type() {
                "exit-status" => core.exit_status = parse_exit_status(request.data()).ok(),
                "exit-signal" => core.exit_signal = ExitSignal::from_data(request.data()).ok(),
                _ => {}
            }
            let can_reply = !core.close_sent;
            if can_reply {
                channel.push_event(
                    &mut core,
                    ChannelEvent::Request {
                        request_type: request.request_type().to_string(),
                        want_reply: request.want_reply(),
                        data: request.data().to_vec(),
                    },
                );
            }
            (core.remote_id, core.request_handler.clone(), can_reply)
        };

        if !request.want_reply() || !can_reply {
            return Ok(MuxActions::default());
        }
        let granted = handler.map_or(false, |handler| {
            handler(request.request_type(), request.data())
        });
        debug!(
            channel = channel.local_id,
            request = request.request_type(),
            granted,
            "Answered channel request"
        );
        let reply = if granted {
            ChannelSuccess::new(remote_id).to_bytes()
        } else {
            ChannelFailure::new(remote_id).to_bytes()
        };
        Ok(MuxActions::reply(reply))
    }

    fn on_request_reply(&self, msg: u8, id: u32, granted: bool) -> LatchResult<MuxActions> {
        let channel = self.lookup(msg, id)?;
        let mut core = channel.lock();
        match core.pending_requests.pop_front() {
            Some(tx) => {
                let _ = tx.send(granted);
            }
            None => warn!(channel = id, "Request reply without a pending request"),
        }
        Ok(MuxActions::default())
    }

    /// Fails every channel, pending open and listener with `cause`.
    pub(crate) fn shutdown(&self, cause: Arc<LatchError>) {
        let channels: Vec<Arc<ChannelShared>> = {
            let mut inner = self.lock();
            if inner.terminated.is_some() {
                return;
            }
            inner.terminated = Some(Arc::clone(&cause));
            inner.listeners.clear();
            inner.channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            let mut core = channel.lock();
            if let Some(tx) = core.open_reply.take() {
                let _ = tx.send(Err(LatchError::Terminated(Arc::clone(&cause))));
            }
            channel.finish(&mut core, Some(Arc::clone(&cause)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::{encode_data, exit_status_data, ChannelOpen};

    const WINDOW: u32 = 32768;
    const MAX_PACKET: u32 = 16384;

    fn opened(mux: &Multiplexer) -> Arc<ChannelShared> {
        let (channel, mut rx) = mux.begin_open().unwrap();
        let confirmation = ChannelOpenConfirmation::new(channel.local_id, 77, 1000, 500);
        let actions = mux.handle(&confirmation.to_bytes()).unwrap();
        assert!(actions.replies.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        channel
    }

    #[test]
    fn test_id_allocator_reuses_after_release() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.allocate().unwrap(), 0);
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 2);
        ids.release(1);
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 3);
        ids.release(42);
        assert_eq!(ids.allocate().unwrap(), 4);
    }

    #[test]
    fn test_confirmation_sets_remote_parameters() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let channel = opened(&mux);
        let snapshot = channel.snapshot();
        assert_eq!(snapshot.state, ChannelState::Open);
        assert_eq!(snapshot.remote_id, 77);
        assert_eq!(snapshot.remote_window, 1000);
        assert_eq!(snapshot.remote_max_packet, 500);
        assert_eq!(snapshot.local_window, WINDOW);
    }

    #[test]
    fn test_huge_peer_window_is_clamped() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let (channel, mut rx) = mux.begin_open().unwrap();
        let confirmation = ChannelOpenConfirmation::new(channel.local_id, 77, u32::MAX, 500);
        mux.handle(&confirmation.to_bytes()).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));

        let adjust = ChannelWindowAdjust::new(channel.local_id, u32::MAX);
        mux.handle(&adjust.to_bytes()).unwrap();
        let limit = (u32::MAX as usize).min(Semaphore::MAX_PERMITS);
        assert_eq!(channel.snapshot().remote_window as usize, limit);
    }

    #[test]
    fn test_data_beyond_max_packet_is_fatal() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let channel = opened(&mux);
        let payload = encode_data(channel.local_id, &vec![0u8; MAX_PACKET as usize + 1]);
        match mux.handle(&payload) {
            Err(LatchError::FlowControl(msg)) => assert!(msg.contains("maximum packet size")),
            other => panic!("Expected FlowControl, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_data_beyond_window_is_fatal() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let channel = opened(&mux);
        let chunk = vec![0u8; MAX_PACKET as usize];
        mux.handle(&encode_data(channel.local_id, &chunk)).unwrap();
        mux.handle(&encode_data(channel.local_id, &chunk)).unwrap();
        assert_eq!(channel.snapshot().local_window, 0);
        assert!(matches!(
            mux.handle(&encode_data(channel.local_id, b"x")),
            Err(LatchError::FlowControl(_))
        ));
    }

    #[test]
    fn test_consuming_data_returns_window() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let channel = opened(&mux);
        mux.handle(&encode_data(channel.local_id, &vec![1u8; 10000])).unwrap();
        let (_, adjust) = channel.take_event().unwrap().unwrap();
        assert!(adjust.is_none());

        mux.handle(&encode_data(channel.local_id, &vec![2u8; 10000])).unwrap();
        let (event, adjust) = channel.take_event().unwrap().unwrap();
        assert!(matches!(event, ChannelEvent::Data(ref d) if d.len() == 10000));
        let adjust = ChannelWindowAdjust::from_bytes(&adjust.unwrap()).unwrap();
        assert_eq!(adjust.recipient_channel(), 77);
        assert_eq!(adjust.bytes_to_add(), 20000);
        assert_eq!(channel.snapshot().local_window, WINDOW);
    }

    #[test]
    fn test_unknown_channel_is_fatal() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        match mux.handle(&encode_data(9, b"x")) {
            Err(LatchError::Protocol(msg)) => assert!(msg.contains("unknown channel 9")),
            other => panic!("Expected Protocol error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_peer_close_is_answered_and_releases_id() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let channel = opened(&mux);
        let actions = mux.handle(&ChannelClose::new(channel.local_id).to_bytes()).unwrap();
        assert_eq!(actions.replies, vec![ChannelClose::new(77).to_bytes()]);
        assert_eq!(channel.snapshot().state, ChannelState::Closed);
        assert_eq!(mux.channel_count(), 0);

        let (event, _) = channel.take_event().unwrap().unwrap();
        assert_eq!(event, ChannelEvent::Closed);
        assert!(matches!(channel.take_event(), Err(LatchError::ChannelClosed(0))));

        let (again, _) = mux.begin_open().unwrap();
        assert_eq!(again.local_id, channel.local_id);
    }

    #[test]
    fn test_local_close_keeps_id_until_peer_close() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let channel = opened(&mux);
        assert!(mux.begin_close(&channel).is_some());
        assert!(mux.begin_close(&channel).is_none());
        assert_eq!(channel.snapshot().state, ChannelState::Closing);

        let (other, _) = mux.begin_open().unwrap();
        assert_ne!(other.local_id, channel.local_id);

        let actions = mux.handle(&ChannelClose::new(channel.local_id).to_bytes()).unwrap();
        assert!(actions.replies.is_empty());
        assert_eq!(mux.channel_count(), 1);
    }

    #[test]
    fn test_open_failure_frees_id() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let (channel, mut rx) = mux.begin_open().unwrap();
        let failure = ChannelOpenFailure::new(channel.local_id, ChannelOpenFailureReason::ConnectFailed);
        mux.handle(&failure.to_bytes()).unwrap();
        match rx.try_recv() {
            Ok(Err(LatchError::ChannelOpenFailed { reason, .. })) => assert_eq!(reason, 2),
            other => panic!("Expected open failure, got {:?}", other.map(|r| r.is_ok())),
        }
        assert_eq!(mux.channel_count(), 0);
    }

    #[test]
    fn test_late_confirmation_after_abandon_is_closed() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let (channel, _rx) = mux.begin_open().unwrap();
        assert!(mux.abandon_open(&channel).is_none());

        let confirmation = ChannelOpenConfirmation::new(channel.local_id, 5, 100, 100);
        let actions = mux.handle(&confirmation.to_bytes()).unwrap();
        assert_eq!(actions.replies, vec![ChannelClose::new(5).to_bytes()]);

        mux.handle(&ChannelClose::new(channel.local_id).to_bytes()).unwrap();
        assert_eq!(mux.channel_count(), 0);
    }

    #[test]
    fn test_inbound_open_requires_listener() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let open = ChannelOpen::new("x11", 4, 1000, 1000).to_bytes();
        let actions = mux.handle(&open).unwrap();
        let failure = ChannelOpenFailure::from_bytes(&actions.replies[0]).unwrap();
        assert_eq!(failure.recipient_channel(), 4);
        assert_eq!(failure.reason_code(), 1);

        let mut rx = mux.listen("x11").unwrap();
        let actions = mux.handle(&open).unwrap();
        let confirmation = ChannelOpenConfirmation::from_bytes(&actions.replies[0]).unwrap();
        assert_eq!(confirmation.recipient_channel(), 4);
        assert_eq!(confirmation.initial_window_size(), WINDOW);
        let (tx, channel) = actions.accepted.unwrap();
        tx.send(channel).unwrap();
        let accepted = rx.try_recv().unwrap();
        assert_eq!(accepted.snapshot().remote_window, 1000);
    }

    #[test]
    fn test_requests_and_replies() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let channel = opened(&mux);

        let exit = ChannelRequest::new(channel.local_id, "exit-status", false, exit_status_data(3));
        assert!(mux.handle(&exit.to_bytes()).unwrap().replies.is_empty());
        assert_eq!(channel.lock().exit_status, Some(3));

        let shell = ChannelRequest::new(channel.local_id, "shell", true, Vec::new());
        let actions = mux.handle(&shell.to_bytes()).unwrap();
        assert_eq!(actions.replies, vec![ChannelFailure::new(77).to_bytes()]);

        channel.lock().request_handler = Some(Arc::new(|kind: &str, _: &[u8]| kind == "shell"));
        let actions = mux.handle(&shell.to_bytes()).unwrap();
        assert_eq!(actions.replies, vec![ChannelSuccess::new(77).to_bytes()]);

        let (_, reply) = channel.register_request(true).unwrap();
        let mut reply = reply.unwrap();
        mux.handle(&ChannelSuccess::new(channel.local_id).to_bytes()).unwrap();
        assert_eq!(reply.try_recv(), Ok(true));
    }

    #[test]
    fn test_shutdown_fails_everything() {
        let mux = Multiplexer::new(WINDOW, MAX_PACKET);
        let channel = opened(&mux);
        let (_pending, mut rx) = mux.begin_open().unwrap();
        mux.shutdown(Arc::new(LatchError::Closed("test".to_string())));

        assert!(matches!(rx.try_recv(), Ok(Err(LatchError::Terminated(_)))));
        assert!(matches!(channel.take_event(), Err(LatchError::Terminated(_))));
        assert!(matches!(channel.writable(), Err(LatchError::Terminated(_))));
        assert!(matches!(mux.begin_open(), Err(LatchError::Terminated(_))));
        assert!(mux.listen("session").is_err());
    }
}
