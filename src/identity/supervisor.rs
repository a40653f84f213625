use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::credentials;
use super::{ConnectionSlots, IdentityHealth, IdentityKind};
use crate::call::EngineHandle;
use crate::commands::ChatDispatcher;
use crate::error::CallError;
use crate::transport::{Connected, PlatformEvent, PlatformTransport};

/// How the first connection attempt of an identity went.
#[derive(Debug)]
pub(crate) enum StartupOutcome {
    Connected,
    Retrying,
    AuthFailed(String),
}

pub(crate) struct Supervisor {
    pub kind: IdentityKind,
    pub session: String,
    pub transport: Arc<dyn PlatformTransport>,
    pub slots: ConnectionSlots,
    pub engine: EngineHandle,
    pub dispatcher: Option<ChatDispatcher>,
    pub backoff: Backoff,
    pub shutdown: CancellationToken,
}

impl Supervisor {
    pub async fn run(self, startup: oneshot::Sender<StartupOutcome>) {
        let mut startup = Some(startup);
        let mut ever_connected = false;
        let mut failures: u32 = 0;
        let mut last_error = String::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if ever_connected || failures > 0 {
                self.report(IdentityHealth::Reconnecting {
                    attempt: failures + 1,
                    last_error: last_error.clone(),
                });
            } else {
                self.report(IdentityHealth::Connecting);
            }

            match self.connect().await {
                Ok(Connected {
                    connection,
                    mut events,
                    account,
                }) => {
                    failures = 0;
                    ever_connected = true;
                    if let Some(tx) = startup.take() {
                        let _ = tx.send(StartupOutcome::Connected);
                    }

                    info!(
                        identity = self.kind.as_str(),
                        account = %account.id,
                        "Identity connected"
                    );
                    self.slots.set(self.kind, connection.clone());
                    self.report(IdentityHealth::Connected {
                        account,
                        since: Utc::now(),
                    });

                    let lost = self.pump(&mut events).await;
                    self.slots.clear(self.kind);
                    connection.close().await;

                    match lost {
                        Some(reason) => {
                            warn!(identity = self.kind.as_str(), reason = %reason, "Connection lost");
                            last_error = reason;
                        }
                        None => break,
                    }
                }
                Err(CallError::Auth(reason)) => {
                    warn!(identity = self.kind.as_str(), reason = %reason, "Authentication failed");
                    if let Some(tx) = startup.take() {
                        let _ = tx.send(StartupOutcome::AuthFailed(reason.clone()));
                    }
                    self.report(IdentityHealth::AuthFailed { reason });
                    return;
                }
                Err(e) => {
                    if let Some(tx) = startup.take() {
                        let _ = tx.send(StartupOutcome::Retrying);
                    }
                    failures += 1;
                    last_error = e.to_string();
                    warn!(
                        identity = self.kind.as_str(),
                        attempt = failures,
                        "Connection attempt failed: {}",
                        e
                    );

                    if self.backoff.exhausted(failures) {
                        self.report(IdentityHealth::Degraded {
                            reason: format!("gave up after {} attempts: {}", failures, last_error),
                            since: Utc::now(),
                        });
                        return;
                    }
                }
            }

            let delay = self.backoff.delay(failures.saturating_sub(1));
            debug!(identity = self.kind.as_str(), delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(identity = self.kind.as_str(), "Supervisor stopped");
    }

    async fn connect(&self) -> Result<Connected, CallError> {
        let credentials = credentials::resolve(self.kind, &self.session)?;
        let connected = self.transport.connect(&credentials).await?;

        if self.kind == IdentityKind::User && connected.account.is_bot {
            connected.connection.close().await;
            return Err(CallError::Auth(
                "the call session belongs to a bot account; calls need a user account".to_string(),
            ));
        }
        Ok(connected)
    }

    /// Forward events until the connection is lost (`Some(reason)`) or the
    /// service shuts down (`None`).
    async fn pump(&self, events: &mut mpsc::Receiver<PlatformEvent>) -> Option<String> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                event = events.recv() => match event {
                    None => return Some("event stream closed".to_string()),
                    Some(PlatformEvent::ConnectionLost { reason }) => return Some(reason),
                    Some(event) => self.route(event),
                }
            }
        }
    }

    fn route(&self, event: PlatformEvent) {
        match (self.kind, event) {
            (IdentityKind::Bot, PlatformEvent::MessageReceived { chat, sender, text }) => {
                if let Some(dispatcher) = self.dispatcher.clone() {
                    tokio::spawn(async move { dispatcher.handle(chat, sender, text).await });
                }
            }
            (
                IdentityKind::User,
                event @ (PlatformEvent::CallInvited { .. }
                | PlatformEvent::CallConfirmed { .. }
                | PlatformEvent::CallEnded { .. }
                | PlatformEvent::ParticipantChanged { .. }),
            ) => self.engine.platform_event(event),
            (kind, event) => {
                debug!(identity = kind.as_str(), ?event, "Ignoring event");
            }
        }
    }

    fn report(&self, health: IdentityHealth) {
        self.engine.identity_changed(self.kind, health);
    }
}
