//! SSH connection protocol messages (RFC 4254).
//!
//! Wire codecs for the channel messages (90-100). Channel-type data and
//! request data are kept opaque: the multiplexer only interprets the fields
//! it needs for flow control and lifecycle, and leaves the rest to the
//! application.
//!
//! # Security
//!
//! - **Window size limits** - inbound data beyond the granted window is fatal
//! - **Maximum packet size** - inbound data beyond the advertised limit is fatal
//! - **Channel number validation** - messages for unknown channels are fatal
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::connection::{ChannelOpen, SESSION_CHANNEL};
//!
//! let open = ChannelOpen::new(SESSION_CHANNEL, 0, 2 * 1024 * 1024, 32 * 1024);
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed.channel_type(), "session");
//! ```

use crate::ssh::message::{expect_message, MessageType};
use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use latch_platform::LatchResult;

/// Channel type name of an interactive session.
pub const SESSION_CHANNEL: &str = "session";

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: String,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
    /// Channel-type specific fields, passed through untouched
    type_data: Vec<u8>,
}

impl ChannelOpen {
    /// Creates a channel open request without type-specific data.
    pub fn new(
        channel_type: &str,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type: channel_type.to_string(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            type_data: Vec::new(),
        }
    }

    /// Appends channel-type specific data.
    pub fn with_type_data(mut self, type_data: Vec<u8>) -> Self {
        self.type_data = type_data;
        self
    }

    /// Returns the channel type name.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Returns the channel-type specific data.
    pub fn type_data(&self) -> &[u8] {
        &self.type_data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        buf.put_str(&self.channel_type);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.extend_from_slice(&self.type_data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::ChannelOpen)?;
        Ok(Self {
            channel_type: r.read_utf8()?.to_string(),
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
            type_data: r.rest().to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes. Trailing channel-type specific data is ignored.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// Channel open failure reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    /// Raw reason code; peers may send values outside the defined set
    reason_code: u32,
    description: String,
    language_tag: String,
}

impl ChannelOpenFailure {
    /// Creates a new failure with the reason's default description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self::with_description(recipient_channel, reason, reason.as_str())
    }

    /// Creates a new failure with a custom description.
    pub fn with_description(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.to_string(),
            language_tag: String::new(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the raw reason code.
    pub fn reason_code(&self) -> u32 {
        self.reason_code
    }

    /// Returns the reason if it is one of the defined codes.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        buf.put_str(&self.description);
        buf.put_str(&self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::ChannelOpenFailure)?;
        let recipient_channel = r.read_u32()?;
        let reason_code = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_string()?).into_owned();
        // Some implementations omit the language tag
        let language_tag = if r.is_empty() {
            String::new()
        } else {
            String::from_utf8_lossy(r.read_string()?).into_owned()
        };
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
            language_tag,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the bytes to add.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            bytes_to_add: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new channel data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message, returning the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_data(self.recipient_channel, &self.data)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

/// Encodes SSH_MSG_CHANNEL_DATA straight from a borrowed slice.
pub fn encode_data(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + data.len());
    buf.put_u8(MessageType::ChannelData as u8);
    buf.put_u32(recipient_channel);
    buf.put_string(data);
    buf
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new extended data message.
    pub fn new(recipient_channel: u32, data_type_code: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code (1 is stderr).
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        buf.put_string(&self.data);
        buf
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data_type_code: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

macro_rules! recipient_only_message {
    ($(#[$doc:meta])* $name:ident, $msg:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            recipient_channel: u32,
        }

        impl $name {
            /// Creates the message for `recipient_channel`.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Returns the recipient channel number.
            pub fn recipient_channel(&self) -> u32 {
                self.recipient_channel
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = Vec::with_capacity(5);
                buf.put_u8($msg as u8);
                buf.put_u32(self.recipient_channel);
                buf
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
                let mut r = WireReader::new(data);
                expect_message(&mut r, $msg)?;
                Ok(Self {
                    recipient_channel: r.read_u32()?,
                })
            }
        }
    };
}

recipient_only_message!(
    /// SSH_MSG_CHANNEL_EOF.
    ChannelEof,
    MessageType::ChannelEof
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE.
    ChannelClose,
    MessageType::ChannelClose
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS.
    ChannelSuccess,
    MessageType::ChannelSuccess
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE.
    ChannelFailure,
    MessageType::ChannelFailure
);

/// SSH_MSG_CHANNEL_REQUEST.
///
/// Request-specific data is opaque; helpers below build and parse the few
/// request types the engine itself looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: String,
    want_reply: bool,
    data: Vec<u8>,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: &str, want_reply: bool, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            request_type: request_type.to_string(),
            want_reply,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type name.
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Returns the request-specific data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.request_type.len() + self.data.len());
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_str(&self.request_type);
        buf.put_bool(self.want_reply);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::ChannelRequest)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            request_type: r.read_utf8()?.to_string(),
            want_reply: r.read_bool()?,
            data: r.rest().to_vec(),
        })
    }
}

/// Request data holding a single string, as used by `exec` and `subsystem`.
pub fn string_request_data(value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + value.len());
    buf.put_str(value);
    buf
}

/// Request data of an `exit-status` request.
pub fn exit_status_data(status: u32) -> Vec<u8> {
    status.to_be_bytes().to_vec()
}

/// Parses the data of an `exit-status` request.
pub fn parse_exit_status(data: &[u8]) -> LatchResult<u32> {
    Ok(WireReader::new(data).read_u32()?)
}

/// Contents of an `exit-signal` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the "SIG" prefix
    pub signal: String,
    /// Whether a core was dumped
    pub core_dumped: bool,
    /// Error message
    pub message: String,
}

impl ExitSignal {
    /// Serializes the request data.
    pub fn to_data(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_str(&self.signal);
        buf.put_bool(self.core_dumped);
        buf.put_str(&self.message);
        buf.put_str("");
        buf
    }

    /// Parses the request data.
    pub fn from_data(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        Ok(Self {
            signal: r.read_utf8()?.to_string(),
            core_dumped: r.read_bool()?,
            message: String::from_utf8_lossy(r.read_string()?).into_owned(),
        })
    }
}
