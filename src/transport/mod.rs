//! # Platform Transport
//!
//! The messaging platform is an external collaborator. Everything the
//! service needs from it goes through two traits:
//!
//! - [`PlatformTransport`]: authenticates one identity and hands back a
//!   connection plus its inbound event stream.
//! - [`PlatformConnection`]: call control and chat primitives on an
//!   authenticated connection.
//!
//! Inbound traffic is a closed set of [`PlatformEvent`] variants, one stream
//! per identity. Call audio travels on a separate pair of channels per call
//! ([`CallAudio`]) so that media never queues behind control events.

pub mod loopback;
pub mod sidecar;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

use crate::config::{TransportConfig, TransportKind};
use crate::error::CallError;
use crate::identity::IdentityKind;

pub use loopback::{LoopbackOptions, LoopbackPlatform};
pub use sidecar::SidecarTransport;

/// Events delivered by the platform on an identity's connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformEvent {
    /// Someone invited the identity into a call
    CallInvited {
        call_ref: String,
        #[serde(default)]
        from: Option<String>,
    },
    /// The platform accepted a join; `call_ref` echoes the joined reference
    CallConfirmed { call_ref: String, call_id: String },
    /// The call is over for this identity (left, kicked, discarded)
    CallEnded {
        call_ref: String,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        reason: String,
    },
    ParticipantChanged {
        call_id: String,
        participant: String,
        joined: bool,
    },
    ConnectionLost { reason: String },
    /// A chat message addressed to the identity
    MessageReceived {
        chat: String,
        sender: String,
        text: String,
    },
}

/// Who the platform says we are after authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

/// A resolved session artifact for one identity.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub kind: IdentityKind,
    pub session_path: PathBuf,
}

/// Bidirectional audio for one joined call.
///
/// `inbound` yields frames coming from the call; frames sent on `outbound`
/// are played into it. Dropping `outbound` stops outbound media.
pub struct CallAudio {
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub outbound: mpsc::Sender<Vec<u8>>,
}

/// Result of a successful authentication.
pub struct Connected {
    pub connection: Arc<dyn PlatformConnection>,
    pub events: mpsc::Receiver<PlatformEvent>,
    pub account: AccountInfo,
}

#[async_trait]
pub trait PlatformTransport: Send + Sync {
    /// Authenticate an identity and open its persistent connection.
    async fn connect(&self, credentials: &Credentials) -> Result<Connected, CallError>;
}

#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Ask the platform to join a call. Confirmation arrives later as
    /// [`PlatformEvent::CallConfirmed`].
    async fn join_call(&self, call_ref: &CallRef) -> Result<(), CallError>;

    /// Ask the platform to leave a call. Confirmation arrives later as
    /// [`PlatformEvent::CallEnded`].
    async fn leave_call(&self, call_ref: &CallRef) -> Result<(), CallError>;

    /// Whether the identity is still a member of the call.
    async fn verify_membership(&self, call_ref: &CallRef) -> Result<bool, CallError>;

    async fn open_audio(&self, call_id: &str) -> Result<CallAudio, CallError>;

    async fn send_message(&self, chat: &str, text: &str) -> Result<(), CallError>;

    async fn close(&self);
}

/// Build the transport selected in the configuration.
pub fn build_transport(config: &TransportConfig) -> Arc<dyn PlatformTransport> {
    match config.kind {
        TransportKind::Sidecar => Arc::new(SidecarTransport::new(config)),
        TransportKind::Loopback => Arc::new(LoopbackPlatform::new(LoopbackOptions::default())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRefKind {
    /// Numeric chat or group id (negative for groups)
    ChatId,
    /// `@username` of a user or public group
    Username,
    /// Any other opaque token the platform understands (invite slugs, `chat-42`)
    Opaque,
}

/// A validated reference to something that can be called.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct CallRef {
    raw: String,
    #[serde(skip)]
    kind: CallRefKind,
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@[A-Za-z0-9_]{3,32}$").expect("valid username regex"))
}

fn opaque_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\-]{0,127}$").expect("valid reference regex"))
}

impl CallRef {
    pub fn parse(input: &str) -> Result<Self, CallError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(CallError::InvalidCallRef("empty call reference".to_string()));
        }

        let digits = raw.strip_prefix('-').unwrap_or(raw);
        if !digits.is_empty() && digits.len() <= 20 && digits.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self {
                raw: raw.to_string(),
                kind: CallRefKind::ChatId,
            });
        }

        if raw.starts_with('@') {
            if username_re().is_match(raw) {
                return Ok(Self {
                    raw: raw.to_string(),
                    kind: CallRefKind::Username,
                });
            }
            return Err(CallError::InvalidCallRef(format!(
                "'{}' is not a valid username (3-32 letters, digits or underscores)",
                raw
            )));
        }

        if opaque_re().is_match(raw) {
            return Ok(Self {
                raw: raw.to_string(),
                kind: CallRefKind::Opaque,
            });
        }

        Err(CallError::InvalidCallRef(format!("'{}' is not a call reference", raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> CallRefKind {
        self.kind
    }

    /// Whether a reference echoed by the platform names this call.
    pub fn matches(&self, other: &str) -> bool {
        self.raw.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for CallRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<CallRef> for String {
    fn from(value: CallRef) -> Self {
        value.raw
    }
}
