//! Credential requests for user interaction.
//!
//! Every interaction the engine or its collaborators need from the user is a
//! [`CredentialRequest`] value. A single [`CredentialProvider`] answers it with
//! a [`CredentialResponse`]. Console, GUI and headless front ends implement
//! the one trait.
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::credential::{
//!     CredentialProvider, CredentialRequest, CredentialResponse, StaticCredentials,
//! };
//!
//! let provider = StaticCredentials::new().with_password("hunter2");
//! let request = CredentialRequest::Password {
//!     username: "alice".into(),
//!     host: "example.com".into(),
//!     prompt: "Password: ".into(),
//! };
//! match provider.provide(&request) {
//!     CredentialResponse::Secret(secret) => assert_eq!(secret.as_str(), "hunter2"),
//!     other => panic!("unexpected response: {:?}", other),
//! }
//! ```

use zeroize::Zeroizing;

/// One prompt of a keyboard-interactive round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractivePrompt {
    /// Prompt text
    pub text: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// What the engine needs from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRequest {
    /// Login password
    Password {
        /// Account name
        username: String,
        /// Host identity
        host: String,
        /// Prompt text
        prompt: String,
    },
    /// Passphrase for a private key
    Passphrase {
        /// Key description, usually a path or comment
        key: String,
    },
    /// Yes/no confirmation
    Confirm {
        /// Question to show
        message: String,
    },
    /// Keyboard-interactive prompts (RFC 4256)
    Interactive {
        /// Round name
        name: String,
        /// Instruction text
        instruction: String,
        /// Prompts in order
        prompts: Vec<InteractivePrompt>,
    },
}

/// The user's answer.
#[derive(Clone)]
pub enum CredentialResponse {
    /// Password or passphrase
    Secret(Zeroizing<String>),
    /// Answer to a confirmation
    Confirmed(bool),
    /// Answers to interactive prompts, same order as the prompts
    Answers(Vec<Zeroizing<String>>),
    /// The user declined to answer
    Cancelled,
}

impl std::fmt::Debug for CredentialResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialResponse::Secret(_) => f.write_str("Secret(<redacted>)"),
            CredentialResponse::Confirmed(v) => f.debug_tuple("Confirmed").field(v).finish(),
            CredentialResponse::Answers(a) => write!(f, "Answers(<{} redacted>)", a.len()),
            CredentialResponse::Cancelled => f.write_str("Cancelled"),
        }
    }
}

impl CredentialResponse {
    /// True if this response is a valid answer to `request`.
    ///
    /// `Cancelled` matches every request.
    pub fn answers(&self, request: &CredentialRequest) -> bool {
        match (request, self) {
            (_, CredentialResponse::Cancelled) => true,
            (
                CredentialRequest::Password { .. } | CredentialRequest::Passphrase { .. },
                CredentialResponse::Secret(_),
            ) => true,
            (CredentialRequest::Confirm { .. }, CredentialResponse::Confirmed(_)) => true,
            (CredentialRequest::Interactive { prompts, .. }, CredentialResponse::Answers(a)) => {
                a.len() == prompts.len()
            }
            _ => false,
        }
    }
}

/// Single capability for answering credential requests.
pub trait CredentialProvider: Send + Sync {
    /// Answers one request.
    fn provide(&self, request: &CredentialRequest) -> CredentialResponse;
}

impl<F> CredentialProvider for F
where
    F: Fn(&CredentialRequest) -> CredentialResponse + Send + Sync,
{
    fn provide(&self, request: &CredentialRequest) -> CredentialResponse {
        self(request)
    }
}

/// Headless provider with fixed answers.
///
/// Answers password and passphrase requests with the configured secret,
/// interactive prompts with that secret for every non-echoed prompt and an
/// empty string otherwise, and confirmations with a fixed decision.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    secret: Option<Zeroizing<String>>,
    confirm: bool,
}

impl StaticCredentials {
    /// Provider that cancels everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the secret returned for password-like prompts.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.secret = Some(Zeroizing::new(password.into()));
        self
    }

    /// Sets the answer to confirmations.
    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("confirm", &self.confirm)
            .finish()
    }
}

impl CredentialProvider for StaticCredentials {
    fn provide(&self, request: &CredentialRequest) -> CredentialResponse {
        match request {
            CredentialRequest::Confirm { .. } => CredentialResponse::Confirmed(self.confirm),
            CredentialRequest::Password { .. } | CredentialRequest::Passphrase { .. } => {
                match &self.secret {
                    Some(secret) => CredentialResponse::Secret(secret.clone()),
                    None => CredentialResponse::Cancelled,
                }
            }
            CredentialRequest::Interactive { prompts, .. } => match &self.secret {
                Some(secret) => CredentialResponse::Answers(
                    prompts
                        .iter()
                        .map(|p| {
                            if p.echo {
                                Zeroizing::new(String::new())
                            } else {
                                secret.clone()
                            }
                        })
                        .collect(),
                ),
                None => CredentialResponse::Cancelled,
            },
        }
    }
}
