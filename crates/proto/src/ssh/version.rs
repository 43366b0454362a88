//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both sides send an
//! identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Example: `SSH-2.0-latch_0.1.0 transport engine`
//!
//! A server may send other lines before its identification string; those
//! are skipped, up to a fixed number of lines.
//!
//! # Security
//!
//! - Maximum line length: 255 characters (DoS prevention)
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::version::Version;
//!
//! let version = Version::new("latch_0.1.0", Some("test"));
//! assert_eq!(version.to_string(), "SSH-2.0-latch_0.1.0 test");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use latch_platform::{LatchError, LatchResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum version string length (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of lines accepted before the identification string.
pub const MAX_PRE_BANNER_LINES: usize = 64;

/// Maximum length of a line preceding the identification string.
const MAX_PRE_BANNER_LINE_LENGTH: usize = 1024;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
    /// Exact line as sent or received, without CR LF; this is what the exchange hash covers
    raw: String,
}

impl Version {
    /// Creates a local SSH-2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let mut raw = format!("SSH-2.0-{}", software);
        if let Some(comments) = comments {
            raw.push(' ');
            raw.push_str(comments);
        }
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            raw,
        }
    }

    /// Default identification for this crate.
    pub fn default_latch() -> Self {
        Self::new(&format!("latch_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::Protocol`] if the line is too long, contains a
    /// null byte, lacks the `SSH-` prefix or names an unsupported version.
    pub fn parse(line: &str) -> LatchResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(LatchError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(LatchError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(LatchError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        // SSH-protoversion-softwareversion[ comments]
        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(LatchError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(LatchError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.find(' ') {
            Some(space_pos) => (
                rest[..space_pos].to_string(),
                Some(rest[space_pos + 1..].trim().to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
            raw: line.to_string(),
        })
    }

    /// Protocol version, `2.0` or `1.99`.
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Software version field.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Comments field.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The identification line exactly as exchanged, without CR LF.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.raw).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Sends the local identification line.
pub async fn write_version<W>(writer: &mut W, version: &Version) -> LatchResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&version.to_wire_format()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads lines until the peer's identification string.
///
/// Reads one byte at a time so that nothing after the line's LF is consumed.
pub async fn read_version<R>(reader: &mut R) -> LatchResult<Version>
where
    R: AsyncRead + Unpin + ?Sized,
{
    for _ in 0..=MAX_PRE_BANNER_LINES {
        let line = read_line(reader).await?;
        if line.starts_with(b"SSH-") {
            let text = String::from_utf8(line).map_err(|_| {
                LatchError::Protocol("Version string is not valid UTF-8".to_string())
            })?;
            return Version::parse(&text);
        }
        debug!(line = %String::from_utf8_lossy(&line), "Skipping pre-banner line");
    }
    Err(LatchError::Protocol(format!(
        "No identification string within {} lines",
        MAX_PRE_BANNER_LINES
    )))
}

async fn read_line<R>(reader: &mut R) -> LatchResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(LatchError::Protocol(
                    "Connection closed during version exchange".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        if line.len() >= MAX_PRE_BANNER_LINE_LENGTH {
            return Err(LatchError::Protocol(
                "Line too long during version exchange".to_string(),
            ));
        }
        line.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("latch_0.1.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "latch_0.1.0");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_version_display() {
        let version = Version::new("latch_0.1.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-latch_0.1.0");

        let with_comments = Version::new("latch_0.1.0", Some("engine"));
        assert_eq!(with_comments.to_string(), "SSH-2.0-latch_0.1.0 engine");
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_parse_keeps_raw_line() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9  two  spaces\r\n").unwrap();
        assert_eq!(version.as_str(), "SSH-2.0-OpenSSH_8.9  two  spaces");
        assert_eq!(version.comments(), Some("two  spaces"));
    }

    #[test]
    fn test_version_parse_1_99() {
        let version = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!(matches!(
            Version::parse("INVALID-2.0-Test"),
            Err(LatchError::Protocol(_))
        ));
        match Version::parse("SSH-1.0-OldClient") {
            Err(LatchError::Protocol(msg)) => {
                assert!(msg.contains("Unsupported protocol version"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
        assert!(Version::parse(&format!("SSH-2.0-{}", "A".repeat(300))).is_err());
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
    }

    #[test]
    fn test_version_wire_format() {
        let version = Version::new("latch_0.1.0", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-latch_0.1.0\r\n");
    }

    #[tokio::test]
    async fn test_read_version_skips_pre_banner_lines() {
        let input = b"Welcome\r\nauthorized use only\nSSH-2.0-OpenSSH_9.6\r\n\x00\x00\x00\x0c";
        let mut reader = &input[..];
        let version = read_version(&mut reader).await.unwrap();
        assert_eq!(version.software(), "OpenSSH_9.6");
        // Binary packet data after the line is left unread
        assert_eq!(reader, &[0, 0, 0, 0x0c]);
    }

    #[tokio::test]
    async fn test_read_version_gives_up() {
        let input = "noise\n".repeat(MAX_PRE_BANNER_LINES + 2);
        let mut reader = input.as_bytes();
        assert!(read_version(&mut reader).await.is_err());

        let mut eof: &[u8] = b"SSH-2.0-partial";
        assert!(read_version(&mut eof).await.is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let local = Version::new("latch_test", Some("x"));
        write_version(&mut a, &local).await.unwrap();
        let remote = read_version(&mut b).await.unwrap();
        assert_eq!(remote, local);
    }
}
