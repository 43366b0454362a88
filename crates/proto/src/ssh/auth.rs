//! SSH user authentication (RFC 4252, RFC 4256).
//!
//! A minimal client for the methods that need nothing but the user:
//! - "none" - Probes which methods the server accepts
//! - "keyboard-interactive" - Prompt rounds answered by the user
//! - "password" - Plain password
//!
//! Every question goes through one [`CredentialProvider`]. The session only
//! carries the messages; this module never touches the transport directly.
//!
//! # Example
//!
//! ```rust,no_run
//! use latch_proto::ssh::auth::authenticate;
//! use latch_proto::ssh::credential::StaticCredentials;
//! # use latch_proto::ssh::session::Session;
//!
//! # async fn run(session: &Session) -> latch_platform::LatchResult<()> {
//! let provider = StaticCredentials::new().with_password("secret");
//! let outcome = authenticate(session, "alice", &provider).await?;
//! println!("authenticated with {}", outcome.method);
//! # Ok(())
//! # }
//! ```

use crate::ssh::credential::{
    CredentialProvider, CredentialRequest, CredentialResponse, InteractivePrompt,
};
use crate::ssh::logging;
use crate::ssh::message::{expect_message, MessageType};
use crate::ssh::session::Session;
use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use latch_platform::{LatchError, LatchResult};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Service requested before authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service started once authentication succeeds.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Asks for the list of usable methods.
    None,
    /// Password authentication.
    Password(Zeroizing<String>),
    /// Keyboard-interactive authentication.
    KeyboardInteractive {
        /// Comma-separated submethod hints, usually empty
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    ///
    /// # Arguments
    ///
    /// * `user_name` - User name to authenticate as
    /// * `service_name` - Service to start after authentication (usually "ssh-connection")
    /// * `method` - Authentication method
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        buf.put_str(&self.user_name);
        buf.put_str(&self.service_name);
        buf.put_str(self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                // not changing the password
                buf.put_bool(false);
                buf.put_str(password);
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // language tag, deprecated
                buf.put_str("");
                buf.put_str(submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::Protocol`] if the data is invalid or names a
    /// method this module does not know.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::UserauthRequest)?;
        let user_name = r.read_utf8()?.to_string();
        let service_name = r.read_utf8()?.to_string();
        let method_name = r.read_utf8()?;

        let method = match method_name {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = r.read_bool()?;
                AuthMethod::Password(Zeroizing::new(r.read_utf8()?.to_string()))
            }
            "keyboard-interactive" => {
                let _language = r.read_utf8()?;
                AuthMethod::KeyboardInteractive {
                    submethods: r.read_utf8()?.to_string(),
                }
            }
            other => {
                return Err(LatchError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods_can_continue);
        buf.put_bool(self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::UserauthFailure)?;
        let methods_can_continue = r.read_name_list()?;
        let partial_success = r.read_bool()?;
        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language_tag: String,
}

impl AuthBanner {
    /// Creates a new banner message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            language_tag: String::new(),
        }
    }

    /// Returns the banner message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        buf.put_str(&self.message);
        buf.put_str(&self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::UserauthBanner)?;
        let message = r.read_utf8()?.to_string();
        let language_tag = r.read_utf8()?.to_string();
        Ok(Self {
            message,
            language_tag,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Round name
    pub name: String,
    /// Instruction text
    pub instruction: String,
    /// Prompts in order
    pub prompts: Vec<InteractivePrompt>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoRequest as u8);
        buf.put_str(&self.name);
        buf.put_str(&self.instruction);
        buf.put_str("");
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            buf.put_str(&prompt.text);
            buf.put_bool(prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> LatchResult<Self> {
        let mut r = WireReader::new(data);
        expect_message(&mut r, MessageType::UserauthInfoRequest)?;
        let name = r.read_utf8()?.to_string();
        let instruction = r.read_utf8()?.to_string();
        let _language = r.read_utf8()?;
        let count = r.read_u32()? as usize;
        // Each prompt takes at least five bytes
        if count > r.remaining() / 5 {
            return Err(LatchError::Protocol(format!(
                "INFO_REQUEST claims {} prompts in {} bytes",
                count,
                r.remaining()
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let text = r.read_utf8()?.to_string();
            let echo = r.read_bool()?;
            prompts.push(InteractivePrompt { text, echo });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// Builds SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
pub fn info_response(answers: &[Zeroizing<String>]) -> Zeroizing<Vec<u8>> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::UserauthInfoResponse as u8);
    buf.put_u32(answers.len() as u32);
    for answer in answers {
        buf.put_str(answer);
    }
    Zeroizing::new(buf.to_vec())
}

/// Parses SSH_MSG_USERAUTH_INFO_RESPONSE.
pub fn parse_info_response(data: &[u8]) -> LatchResult<Vec<Zeroizing<String>>> {
    let mut r = WireReader::new(data);
    expect_message(&mut r, MessageType::UserauthInfoResponse)?;
    let count = r.read_u32()? as usize;
    if count > r.remaining() / 4 {
        return Err(LatchError::Protocol(format!(
            "INFO_RESPONSE claims {} answers in {} bytes",
            count,
            r.remaining()
        )));
    }
    let mut answers = Vec::with_capacity(count);
    for _ in 0..count {
        answers.push(Zeroizing::new(r.read_utf8()?.to_string()));
    }
    Ok(answers)
}

/// Result of a successful [`authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Method that completed authentication
    pub method: String,
    /// Banners the server sent, in order
    pub banners: Vec<String>,
}

/// What the server said about one attempt.
enum Reply {
    Success,
    Failure(AuthFailure),
}

/// Authenticates `user` for `ssh-connection`.
///
/// Starts with "none" to learn the server's methods, then tries
/// keyboard-interactive and password, in that order, each at most once.
///
/// # Errors
///
/// Returns [`LatchError::Authentication`] when every usable method failed or
/// the provider cancelled, and the session's error if it terminated.
pub async fn authenticate(
    session: &Session,
    user: &str,
    provider: &dyn CredentialProvider,
) -> LatchResult<AuthOutcome> {
    session.request_service(USERAUTH_SERVICE).await?;
    let mut banners = Vec::new();

    let none = AuthRequest::new(user, CONNECTION_SERVICE, AuthMethod::None);
    session.send_message(none.to_bytes()).await?;
    let mut methods = match recv_reply(session, &mut banners).await? {
        Reply::Success => return Ok(succeeded(user, "none", banners)),
        Reply::Failure(failure) => failure.methods_can_continue().to_vec(),
    };
    let mut tried: Vec<&str> = Vec::new();

    loop {
        debug!(methods = %methods.join(","), "Server accepts authentication methods");
        let next = ["keyboard-interactive", "password"]
            .into_iter()
            .find(|m| !tried.contains(m) && methods.iter().any(|s| s.as_str() == *m));
        let Some(method) = next else {
            let reason = format!("No remaining methods (server offers {})", methods.join(","));
            logging::log_authentication_failed(user, &reason);
            return Err(LatchError::Authentication(reason));
        };
        tried.push(method);

        let reply = match method {
            "keyboard-interactive" => {
                keyboard_interactive(session, user, provider, &mut banners).await?
            }
            _ => password(session, user, provider, &mut banners).await?,
        };
        match reply {
            Reply::Success => return Ok(succeeded(user, method, banners)),
            Reply::Failure(failure) => {
                debug!(
                    method,
                    partial = failure.partial_success(),
                    "Authentication attempt failed"
                );
                methods = failure.methods_can_continue().to_vec();
            }
        }
    }
}

fn succeeded(user: &str, method: &str, banners: Vec<String>) -> AuthOutcome {
    logging::log_authentication_success(user, method);
    AuthOutcome {
        method: method.to_string(),
        banners,
    }
}

fn cancelled(user: &str) -> LatchError {
    logging::log_authentication_failed(user, "cancelled by user");
    LatchError::Authentication("Cancelled by user".to_string())
}

async fn password(
    session: &Session,
    user: &str,
    provider: &dyn CredentialProvider,
    banners: &mut Vec<String>,
) -> LatchResult<Reply> {
    let host = session.config().host().to_string();
    let request = CredentialRequest::Password {
        username: user.to_string(),
        prompt: format!("{}@{}'s password: ", user, host),
        host,
    };
    let secret = match provider.provide(&request) {
        CredentialResponse::Secret(secret) => secret,
        _ => return Err(cancelled(user)),
    };
    let auth = AuthRequest::new(user, CONNECTION_SERVICE, AuthMethod::Password(secret));
    session.send_message(auth.to_bytes()).await?;

    let payload = recv_filtered(session, banners).await?;
    match payload[0] {
        60 => Err(LatchError::Authentication(
            "Server requires a password change".to_string(),
        )),
        _ => parse_reply(&payload),
    }
}

async fn keyboard_interactive(
    session: &Session,
    user: &str,
    provider: &dyn CredentialProvider,
    banners: &mut Vec<String>,
) -> LatchResult<Reply> {
    let auth = AuthRequest::new(
        user,
        CONNECTION_SERVICE,
        AuthMethod::KeyboardInteractive {
            submethods: String::new(),
        },
    );
    session.send_message(auth.to_bytes()).await?;

    loop {
        let payload = recv_filtered(session, banners).await?;
        if payload[0] != MessageType::UserauthInfoRequest as u8 {
            return parse_reply(&payload);
        }
        let info = InfoRequest::from_bytes(&payload)?;
        debug!(prompts = info.prompts.len(), name = %info.name, "Keyboard-interactive round");
        let request = CredentialRequest::Interactive {
            name: info.name,
            instruction: info.instruction,
            prompts: info.prompts,
        };
        let response = provider.provide(&request);
        if !response.answers(&request) {
            return Err(LatchError::Authentication(
                "Wrong number of answers to keyboard-interactive prompts".to_string(),
            ));
        }
        let CredentialResponse::Answers(answers) = response else {
            return Err(cancelled(user));
        };
        let reply = info_response(&answers);
        session.send_message(reply.to_vec()).await?;
    }
}

/// Next auth message that is not a banner.
async fn recv_filtered(session: &Session, banners: &mut Vec<String>) -> LatchResult<Vec<u8>> {
    loop {
        let payload = session.recv_message().await?;
        if payload.first() == Some(&(MessageType::UserauthBanner as u8)) {
            let banner = AuthBanner::from_bytes(&payload)?;
            info!(banner = %banner.message(), "Server banner");
            banners.push(banner.message().to_string());
            continue;
        }
        if payload.is_empty() {
            return Err(LatchError::Protocol("Empty authentication message".to_string()));
        }
        return Ok(payload);
    }
}

async fn recv_reply(session: &Session, banners: &mut Vec<String>) -> LatchResult<Reply> {
    let payload = recv_filtered(session, banners).await?;
    parse_reply(&payload)
}

fn parse_reply(payload: &[u8]) -> LatchResult<Reply> {
    match MessageType::from_u8(payload[0]) {
        Some(MessageType::UserauthSuccess) => Ok(Reply::Success),
        Some(MessageType::UserauthFailure) => Ok(Reply::Failure(AuthFailure::from_bytes(payload)?)),
        _ => Err(LatchError::Protocol(format!(
            "Unexpected authentication message {}",
            payload[0]
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_request_password() {
        let auth = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::Password(Zeroizing::new("secret".to_string())),
        );

        assert_eq!(auth.user_name(), "alice");
        assert_eq!(auth.service_name(), "ssh-connection");
        assert_eq!(auth.method().name(), "password");

        let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
        assert_eq!(parsed, auth);
    }

    #[test]
    fn test_auth_request_keyboard_interactive_layout() {
        let auth = AuthRequest::new(
            "bob",
            "ssh-connection",
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        let bytes = auth.to_bytes();
        assert_eq!(bytes[0], 50);
        // ends with empty language and empty submethods
        assert_eq!(&bytes[bytes.len() - 8..], &[0u8; 8]);
        assert_eq!(AuthRequest::from_bytes(&bytes).unwrap(), auth);
    }

    #[test]
    fn test_auth_request_unknown_method() {
        let mut buf = BytesMut::new();
        buf.put_u8(50);
        buf.put_str("alice");
        buf.put_str("ssh-connection");
        buf.put_str("hostbased");
        assert!(AuthRequest::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_auth_failure() {
        let failure = AuthFailure::new(vec!["publickey".into(), "password".into()], true);
        let bytes = failure.to_bytes();
        let parsed = AuthFailure::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.methods_can_continue(), &["publickey", "password"]);
        assert!(parsed.partial_success());
    }

    #[test]
    fn test_auth_failure_truncated() {
        let mut bytes = AuthFailure::new(vec!["password".into()], false).to_bytes();
        bytes.pop();
        assert!(AuthFailure::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_auth_banner() {
        let banner = AuthBanner::new("Authorized use only\n");
        let parsed = AuthBanner::from_bytes(&banner.to_bytes()).unwrap();
        assert_eq!(parsed.message(), "Authorized use only\n");
    }

    #[test]
    fn test_info_request() {
        let info = InfoRequest {
            name: "otp".into(),
            instruction: "Enter both".into(),
            prompts: vec![
                InteractivePrompt {
                    text: "Password: ".into(),
                    echo: false,
                },
                InteractivePrompt {
                    text: "Token: ".into(),
                    echo: true,
                },
            ],
        };
        assert_eq!(InfoRequest::from_bytes(&info.to_bytes()).unwrap(), info);
    }

    #[test]
    fn test_info_request_prompt_count_bounded() {
        let mut buf = BytesMut::new();
        buf.put_u8(60);
        buf.put_str("");
        buf.put_str("");
        buf.put_str("");
        buf.put_u32(u32::MAX);
        assert!(InfoRequest::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_info_response() {
        let answers = vec![Zeroizing::new("hunter2".to_string()), Zeroizing::new(String::new())];
        let bytes = info_response(&answers);
        let parsed = parse_info_response(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].as_str(), "hunter2");
        assert_eq!(parsed[1].as_str(), "");
    }

    #[test]
    fn test_parse_reply() {
        assert!(matches!(parse_reply(&[52]).unwrap(), Reply::Success));
        let failure = AuthFailure::new(vec!["password".into()], false).to_bytes();
        assert!(matches!(parse_reply(&failure).unwrap(), Reply::Failure(_)));
        assert!(parse_reply(&[53]).is_err());
    }
}
