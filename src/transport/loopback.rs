//! In-process stand-in for the messaging platform.
//!
//! Used for dry runs (`transport.kind = "loopback"`) and by the test suite.
//! Joins are confirmed automatically after a short delay, leaves are answered
//! with `CallEnded`, outbound call audio is recorded, and tests can inject
//! events, inbound audio, authentication failures and dropped connections.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    AccountInfo, CallAudio, CallRef, Connected, Credentials, PlatformConnection, PlatformEvent,
    PlatformTransport,
};
use crate::error::CallError;
use crate::identity::IdentityKind;

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Confirm joins and leaves without outside help
    pub auto_confirm: bool,
    pub confirm_delay: Duration,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            auto_confirm: true,
            confirm_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct PlatformInner {
    event_senders: HashMap<IdentityKind, mpsc::Sender<PlatformEvent>>,
    rejected: HashMap<IdentityKind, String>,
    failing_connects: HashMap<IdentityKind, u32>,
    connects: HashMap<IdentityKind, u32>,
    memberships: HashSet<String>,
    audio_inputs: HashMap<String, mpsc::Sender<Vec<u8>>>,
    sent_audio: HashMap<String, Vec<u8>>,
    audio_open_delay: Option<Duration>,
    journal: Vec<String>,
    next_call: u64,
}

/// Shared simulated platform. Cheap to clone.
#[derive(Clone)]
pub struct LoopbackPlatform {
    options: LoopbackOptions,
    inner: Arc<Mutex<PlatformInner>>,
}

impl LoopbackPlatform {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            inner: Arc::new(Mutex::new(PlatformInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlatformInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every future authentication of `kind` fail.
    pub fn reject(&self, kind: IdentityKind, reason: &str) {
        self.lock().rejected.insert(kind, reason.to_string());
    }

    /// Make the next `count` connection attempts of `kind` fail at the transport level.
    pub fn fail_next_connects(&self, kind: IdentityKind, count: u32) {
        self.lock().failing_connects.insert(kind, count);
    }

    /// Hold the next `open_audio` answer back for `delay`.
    pub fn delay_next_audio_open(&self, delay: Duration) {
        self.lock().audio_open_delay = Some(delay);
    }

    pub fn connect_count(&self, kind: IdentityKind) -> u32 {
        self.lock().connects.get(&kind).copied().unwrap_or(0)
    }

    /// Deliver an event on an identity's connection.
    pub async fn emit(&self, kind: IdentityKind, event: PlatformEvent) -> bool {
        let sender = self.lock().event_senders.get(&kind).cloned();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Close an identity's event stream as if the network went away.
    pub fn drop_connection(&self, kind: IdentityKind) {
        self.lock().event_senders.remove(&kind);
    }

    /// Forget that the user identity is in a call (simulates membership lost
    /// while disconnected).
    pub fn forget_membership(&self, call_ref: &str) {
        self.lock().memberships.remove(call_ref);
    }

    pub fn is_member(&self, call_ref: &str) -> bool {
        self.lock().memberships.contains(call_ref)
    }

    /// Push a frame of inbound audio into an open call.
    pub async fn inject_audio(&self, call_id: &str, frame: Vec<u8>) -> bool {
        let sender = self.lock().audio_inputs.get(call_id).cloned();
        match sender {
            Some(sender) => sender.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Everything the service has played into a call so far.
    pub fn sent_audio(&self, call_id: &str) -> Vec<u8> {
        self.lock().sent_audio.get(call_id).cloned().unwrap_or_default()
    }

    /// Requests seen so far, oldest first (`join chat-42`, `leave chat-42`, ...).
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    fn record(&self, entry: String) {
        debug!(entry = %entry, "loopback request");
        self.lock().journal.push(entry);
    }

    fn schedule(&self, kind: IdentityKind, event: PlatformEvent) {
        if !self.options.auto_confirm {
            return;
        }
        let platform = self.clone();
        let delay = self.options.confirm_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            platform.emit(kind, event).await;
        });
    }
}

#[async_trait]
impl PlatformTransport for LoopbackPlatform {
    async fn connect(&self, credentials: &Credentials) -> Result<Connected, CallError> {
        let kind = credentials.kind;
        let (tx, rx) = mpsc::channel(64);
        {
            let mut inner = self.lock();
            *inner.connects.entry(kind).or_insert(0) += 1;

            if let Some(reason) = inner.rejected.get(&kind) {
                return Err(CallError::Auth(reason.clone()));
            }
            if let Some(remaining) = inner.failing_connects.get_mut(&kind) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(CallError::Transport("loopback connect refused".to_string()));
                }
            }
            inner.event_senders.insert(kind, tx);
        }

        let account = AccountInfo {
            id: format!("loopback-{}", kind.as_str()),
            display_name: Some(format!("Loopback {}", kind.as_str())),
            is_bot: kind == IdentityKind::Bot,
        };

        Ok(Connected {
            connection: Arc::new(LoopbackConnection {
                kind,
                platform: self.clone(),
            }),
            events: rx,
            account,
        })
    }
}

struct LoopbackConnection {
    kind: IdentityKind,
    platform: LoopbackPlatform,
}

#[async_trait]
impl PlatformConnection for LoopbackConnection {
    async fn join_call(&self, call_ref: &CallRef) -> Result<(), CallError> {
        self.platform.record(format!("join {}", call_ref));
        let call_id = {
            let mut inner = self.platform.lock();
            inner.next_call += 1;
            inner.memberships.insert(call_ref.as_str().to_string());
            format!("call-{}", inner.next_call)
        };
        self.platform.schedule(
            self.kind,
            PlatformEvent::CallConfirmed {
                call_ref: call_ref.as_str().to_string(),
                call_id,
            },
        );
        Ok(())
    }

    async fn leave_call(&self, call_ref: &CallRef) -> Result<(), CallError> {
        self.platform.record(format!("leave {}", call_ref));
        self.platform.lock().memberships.remove(call_ref.as_str());
        self.platform.schedule(
            self.kind,
            PlatformEvent::CallEnded {
                call_ref: call_ref.as_str().to_string(),
                call_id: None,
                reason: "left".to_string(),
            },
        );
        Ok(())
    }

    async fn verify_membership(&self, call_ref: &CallRef) -> Result<bool, CallError> {
        Ok(self.platform.is_member(call_ref.as_str()))
    }

    async fn open_audio(&self, call_id: &str) -> Result<CallAudio, CallError> {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let delay = {
            let mut inner = self.platform.lock();
            inner.audio_inputs.insert(call_id.to_string(), in_tx);
            inner.audio_open_delay.take()
        };

        let platform = self.platform.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                platform
                    .lock()
                    .sent_audio
                    .entry(call_id.clone())
                    .or_default()
                    .extend_from_slice(&frame);
            }
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(CallAudio {
            inbound: in_rx,
            outbound: out_tx,
        })
    }

    async fn send_message(&self, chat: &str, text: &str) -> Result<(), CallError> {
        self.platform.record(format!("message {} {}", chat, text));
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.platform.lock();
        if let Some(sender) = inner.event_senders.get(&self.kind) {
            if sender.is_closed() {
                inner.event_senders.remove(&self.kind);
            }
        }
    }
}
