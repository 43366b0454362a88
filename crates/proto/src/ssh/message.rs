//! SSH protocol message types (RFC 4253).
//!
//! This module defines the SSH protocol message numbers as specified in
//! RFC 4253 Section 12 and related RFCs, together with the transport-level
//! messages that are not tied to key exchange or channels.
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service, ext-info
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! ```

use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use latch_platform::{LatchError, LatchResult};

/// SSH message types as defined in RFC 4253 Section 12.
///
/// Each message type has a unique numeric identifier used in the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,
    /// Extension information (RFC 8308).
    ExtInfo = 7,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// Diffie-Hellman/ECDH key exchange init (both use same message number).
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply (both use same message number).
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Keyboard-interactive info request. Shares number 60 with PK_OK and PASSWD_CHANGEREQ.
    UserauthInfoRequest = 60,
    /// Keyboard-interactive info response.
    UserauthInfoResponse = 61,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use latch_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            7 => Some(MessageType::ExtInfo),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthInfoRequest),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use latch_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::KexInit.name(), "SSH_MSG_KEXINIT");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::ExtInfo => "SSH_MSG_EXT_INFO",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthInfoRequest => "SSH_MSG_USERAUTH_INFO_REQUEST",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// True for KEXINIT, NEWKEYS and the method-specific range 30-49.
pub fn is_kex_message(msg: u8) -> bool {
    matches!(msg, 20 | 21 | 30..=49)
}

/// True for the user authentication range 50-79.
pub fn is_userauth_message(msg: u8) -> bool {
    (50..=79).contains(&msg)
}

/// True for the channel range 90-127.
pub fn is_channel_message(msg: u8) -> bool {
    (90..=127).contains(&msg)
}

/// Reads the leading message number and checks it.
pub(crate) fn expect_message(reader: &mut WireReader<'_>, expected: MessageType) -> LatchResult<()> {
    let got = reader.read_u8()?;
    if got != expected as u8 {
        return Err(LatchError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected as u8,
            expected.name(),
            got
        )));
    }
    Ok(())
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Picks the reason code to report for a fatal local error.
    pub fn for_error(err: &LatchError) -> Self {
        match err.root_cause() {
            LatchError::AlgorithmNegotiation(_) => DisconnectReason::KeyExchangeFailed,
            LatchError::Security(msg) if msg.contains("MAC") || msg.contains("tag") => {
                DisconnectReason::MacError
            }
            LatchError::Security(msg) if msg.contains("host key") => {
                DisconnectReason::HostKeyNotVerifiable
            }
            LatchError::Security(_) => DisconnectReason::KeyExchangeFailed,
            LatchError::Closed(_) => DisconnectReason::ByApplication,
            LatchError::Timeout(_) | LatchError::Io(_) => DisconnectReason::ConnectionLost,
            _ => DisconnectReason::ProtocolError,
        }
    }
}

/// SSH_MSG_DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason: u32,
    /// Human-readable description
    pub description: String,
    /// Language tag
    pub language: String,
}

impl Disconnect {
    /// Creates a disconnect message with an empty language tag.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason: reason as u32,
            description: description.into(),
            language: String::new(),
        }
    }

    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason);
        buf.put_str(&self.description);
        buf.put_str(&self.language);
        buf.to_vec()
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::Disconnect)?;
        let reason = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_string()?).into_owned();
        // Some implementations omit the language tag
        let language = if r.is_empty() {
            String::new()
        } else {
            String::from_utf8_lossy(r.read_string()?).into_owned()
        };
        Ok(Self {
            reason,
            description,
            language,
        })
    }
}

/// SSH_MSG_DEBUG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer asked for the message to be displayed
    pub always_display: bool,
    /// Message text
    pub message: String,
}

impl DebugMessage {
    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::Debug)?;
        let always_display = r.read_bool()?;
        let message = String::from_utf8_lossy(r.read_string()?).into_owned();
        Ok(Self {
            always_display,
            message,
        })
    }
}

/// Builds an SSH_MSG_IGNORE payload carrying `data`.
pub fn ignore_payload(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(MessageType::Ignore as u8);
    buf.put_string(data);
    buf.to_vec()
}

/// Builds an SSH_MSG_UNIMPLEMENTED payload for the given sequence number.
pub fn unimplemented_payload(sequence_number: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(MessageType::Unimplemented as u8);
    buf.extend_from_slice(&sequence_number.to_be_bytes());
    buf
}

/// Parses the sequence number out of SSH_MSG_UNIMPLEMENTED.
pub fn parse_unimplemented(data: &[u8]) -> LatchResult<u32> {
    let mut r = WireReader::new(data);
    expect_message(&mut r, MessageType::Unimplemented)?;
    Ok(r.read_u32()?)
}

/// Builds a SERVICE_REQUEST or SERVICE_ACCEPT payload.
pub fn service_payload(msg: MessageType, service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(msg as u8);
    buf.put_str(service);
    buf.to_vec()
}

/// Parses the service name out of SERVICE_REQUEST or SERVICE_ACCEPT.
pub fn parse_service(data: &[u8], msg: MessageType) -> LatchResult<String> {
    let mut r = WireReader::new(data);
    expect_message(&mut r, msg)?;
    Ok(r.read_utf8()?.to_string())
}

/// SSH_MSG_EXT_INFO (RFC 8308).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtInfo {
    /// Extension name/value pairs in wire order
    pub extensions: Vec<(String, Vec<u8>)>,
}

impl ExtInfo {
    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ExtInfo as u8);
        buf.put_u32(self.extensions.len() as u32);
        for (name, value) in &self.extensions {
            buf.put_str(name);
            buf.put_string(value);
        }
        buf.to_vec()
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::ExtInfo)?;
        let count = r.read_u32()?;
        let mut extensions = Vec::new();
        for _ in 0..count {
            let name = r.read_utf8()?.to_string();
            let value = r.read_string()?.to_vec();
            extensions.push((name, value));
        }
        Ok(Self { extensions })
    }

    /// Returns the `server-sig-algs` list if present.
    pub fn server_sig_algs(&self) -> Option<Vec<String>> {
        self.extensions
            .iter()
            .find(|(name, _)| name == "server-sig-algs")
            .map(|(_, value)| {
                String::from_utf8_lossy(value)
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether a reply is expected
    pub want_reply: bool,
    /// Request-specific data
    pub data: Vec<u8>,
}

impl GlobalRequest {
    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        buf.put_str(&self.name);
        buf.put_bool(self.want_reply);
        buf.extend_from_slice(&self.data);
        buf.to_vec()
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::GlobalRequest)?;
        let name = r.read_utf8()?.to_string();
        let want_reply = r.read_bool()?;
        Ok(Self {
            name,
            want_reply,
            data: r.rest().to_vec(),
        })
    }
}

/// Outcome of a global request that asked for a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalReply {
    /// SSH_MSG_REQUEST_SUCCESS with its response data
    Success(Vec<u8>),
    /// SSH_MSG_REQUEST_FAILURE
    Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(7), Some(MessageType::ExtInfo));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::NewKeys as u8, 21);
        assert_eq!(MessageType::ChannelData as u8, 94);
    }

    #[test]
    fn test_message_type_display() {
        let msg = MessageType::KexInit;
        assert_eq!(format!("{}", msg), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_message_ranges() {
        assert!(is_kex_message(20));
        assert!(is_kex_message(21));
        assert!(is_kex_message(31));
        assert!(is_kex_message(49));
        assert!(!is_kex_message(2));
        assert!(!is_kex_message(22));
        assert!(!is_kex_message(50));
        assert!(is_userauth_message(60));
        assert!(is_channel_message(94));
        assert!(!is_channel_message(80));
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let msg = Disconnect::new(DisconnectReason::ByApplication, "Client disconnecting");
        let parsed = Disconnect::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.reason, 11);
        assert_eq!(parsed.description, "Client disconnecting");
    }

    #[test]
    fn test_disconnect_without_language() {
        let data = [1u8, 0, 0, 0, 2, 0, 0, 0, 3, b'b', b'a', b'd'];
        let parsed = Disconnect::from_bytes(&data).unwrap();
        assert_eq!(parsed.reason, 2);
        assert_eq!(parsed.description, "bad");
        assert!(parsed.language.is_empty());
    }

    #[test]
    fn test_ext_info_server_sig_algs() {
        let info = ExtInfo {
            extensions: vec![
                ("server-sig-algs".to_string(), b"ssh-ed25519,rsa-sha2-256".to_vec()),
                ("no-flow-control".to_string(), b"p".to_vec()),
            ],
        };
        let parsed = ExtInfo::from_bytes(&info.to_bytes()).unwrap();
        assert_eq!(
            parsed.server_sig_algs(),
            Some(vec!["ssh-ed25519".to_string(), "rsa-sha2-256".to_string()])
        );
        assert_eq!(ExtInfo::default().server_sig_algs(), None);
    }

    #[test]
    fn test_global_request_roundtrip() {
        let req = GlobalRequest {
            name: "keepalive@openssh.com".to_string(),
            want_reply: true,
            data: Vec::new(),
        };
        assert_eq!(GlobalRequest::from_bytes(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn test_unimplemented() {
        let payload = unimplemented_payload(42);
        assert_eq!(parse_unimplemented(&payload).unwrap(), 42);
    }

    #[test]
    fn test_wrong_message_type() {
        let err = parse_service(&[6, 0, 0, 0, 0], MessageType::ServiceRequest).unwrap_err();
        assert!(matches!(err, LatchError::Protocol(msg) if msg.contains("expected 5")));
    }

    #[test]
    fn test_disconnect_reason_for_error() {
        assert_eq!(
            DisconnectReason::for_error(&LatchError::Security("MAC verification failed".into())),
            DisconnectReason::MacError
        );
        assert_eq!(
            DisconnectReason::for_error(&LatchError::FlowControl("window".into())),
            DisconnectReason::ProtocolError
        );
    }
}
