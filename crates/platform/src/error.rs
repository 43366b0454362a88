//! Error types for the latch engine.

use std::fmt;
use std::sync::Arc;

/// Details of a failed algorithm negotiation.
///
/// Carries the slot that could not be agreed on and both name-lists exactly as
/// they appeared in the two KEXINIT messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmNegotiationFailure {
    /// Slot name, e.g. `"encryption.c2s"`.
    pub slot: String,
    /// Local proposal for the slot.
    pub local: Vec<String>,
    /// Peer proposal for the slot.
    pub peer: Vec<String>,
}

impl fmt::Display for AlgorithmNegotiationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no common {} algorithm: local=[{}], peer=[{}]",
            self.slot,
            self.local.join(","),
            self.peer.join(",")
        )
    }
}

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No data yet; the operation may be retried as is.
    WouldBlock,
    /// The operation ran out of time.
    Timeout,
    /// Confined to one channel or request; the session stays usable.
    ChannelLocal,
    /// The session is terminating or terminated.
    Fatal,
}

/// Main error type for the latch engine.
#[derive(Debug)]
pub enum LatchError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (framing, parsing, unexpected messages)
    Protocol(String),

    /// Security error (MAC failure, host key rejection, bad signature)
    Security(String),

    /// No common algorithm for a negotiation slot
    AlgorithmNegotiation(AlgorithmNegotiationFailure),

    /// Message ordering violation during a strict key exchange
    StrictKex(String),

    /// Peer exceeded an advertised channel window or maximum packet size
    FlowControl(String),

    /// Peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// Reason code from the message
        reason: u32,
        /// Human-readable description from the message
        description: String,
    },

    /// Session was closed locally
    Closed(String),

    /// Session terminated earlier; holds the original cause
    Terminated(Arc<LatchError>),

    /// Operation timed out
    Timeout(String),

    /// No data available yet
    WouldBlock,

    /// Peer refused a channel open
    ChannelOpenFailed {
        /// Reason code from SSH_MSG_CHANNEL_OPEN_FAILURE
        reason: u32,
        /// Human-readable description from the message
        description: String,
    },

    /// Channel is closed or no longer accepts the operation
    ChannelClosed(u32),

    /// User authentication did not succeed
    Authentication(String),

    /// Other errors
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl LatchError {
    /// Classifies the error so callers can decide whether to retry, report, or tear down.
    pub fn class(&self) -> ErrorClass {
        match self {
            LatchError::WouldBlock => ErrorClass::WouldBlock,
            LatchError::Timeout(_) => ErrorClass::Timeout,
            LatchError::ChannelOpenFailed { .. }
            | LatchError::ChannelClosed(_)
            | LatchError::Authentication(_) => ErrorClass::ChannelLocal,
            _ => ErrorClass::Fatal,
        }
    }

    /// Returns true if the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Follows `Terminated` wrappers down to the error that ended the session.
    pub fn root_cause(&self) -> &LatchError {
        match self {
            LatchError::Terminated(cause) => cause.root_cause(),
            other => other,
        }
    }
}

impl fmt::Display for LatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatchError::Io(e) => write!(f, "IO error: {}", e),
            LatchError::Config(msg) => write!(f, "Configuration error: {}", msg),
            LatchError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            LatchError::Security(msg) => write!(f, "Security error: {}", msg),
            LatchError::AlgorithmNegotiation(failure) => {
                write!(f, "Algorithm negotiation failed: {}", failure)
            }
            LatchError::StrictKex(msg) => write!(f, "Strict KEX violation: {}", msg),
            LatchError::FlowControl(msg) => write!(f, "Flow control violation: {}", msg),
            LatchError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected by peer (reason {}): {}", reason, description),
            LatchError::Closed(msg) => write!(f, "Session closed: {}", msg),
            LatchError::Terminated(cause) => write!(f, "Session terminated: {}", cause),
            LatchError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            LatchError::WouldBlock => write!(f, "Operation would block"),
            LatchError::ChannelOpenFailed {
                reason,
                description,
            } => write!(f, "Channel open failed (reason {}): {}", reason, description),
            LatchError::ChannelClosed(id) => write!(f, "Channel {} is closed", id),
            LatchError::Authentication(msg) => write!(f, "Authentication failed: {}", msg),
            LatchError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for LatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LatchError::Io(e) => Some(e),
            LatchError::Terminated(cause) => Some(cause.as_ref()),
            LatchError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LatchError {
    fn from(err: std::io::Error) -> Self {
        LatchError::Io(err)
    }
}

impl From<AlgorithmNegotiationFailure> for LatchError {
    fn from(failure: AlgorithmNegotiationFailure) -> Self {
        LatchError::AlgorithmNegotiation(failure)
    }
}

/// Result type alias for latch operations.
pub type LatchResult<T> = Result<T, LatchError>;
