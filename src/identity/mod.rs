//! # Session Manager
//!
//! Owns the two platform identities the service runs as:
//!
//! - **bot**: receives chat commands and answers them
//! - **user**: joins calls (platforms only allow user accounts in calls)
//!
//! Each identity is driven by its own supervisor task that authenticates,
//! pumps the identity's event stream and reconnects with capped exponential
//! backoff when the connection drops. Authenticated connections are published
//! in [`ConnectionSlots`] so the call engine and the chat dispatcher can reach
//! them; health changes are reported to the engine so that status and join
//! admission always reflect the current state.

pub mod backoff;
pub mod credentials;
mod supervisor;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::call::EngineHandle;
use crate::commands::ChatDispatcher;
use crate::config::AppConfig;
use crate::transport::{AccountInfo, PlatformConnection, PlatformTransport};

use backoff::Backoff;
use supervisor::{StartupOutcome, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Bot,
    User,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Bot => "bot",
            IdentityKind::User => "user",
        }
    }
}

/// Connection health of one identity, as shown on status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdentityHealth {
    Connecting,
    Connected {
        account: AccountInfo,
        since: DateTime<Utc>,
    },
    Reconnecting {
        attempt: u32,
        last_error: String,
    },
    /// Retry budget exhausted; the identity stays down until restart
    Degraded {
        reason: String,
        since: DateTime<Utc>,
    },
    AuthFailed {
        reason: String,
    },
}

impl IdentityHealth {
    pub fn is_connected(&self) -> bool {
        matches!(self, IdentityHealth::Connected { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            IdentityHealth::Connecting => "connecting",
            IdentityHealth::Connected { .. } => "connected",
            IdentityHealth::Reconnecting { .. } => "reconnecting",
            IdentityHealth::Degraded { .. } => "degraded",
            IdentityHealth::AuthFailed { .. } => "auth_failed",
        }
    }
}

/// The currently authenticated connection of each identity.
#[derive(Clone, Default)]
pub struct ConnectionSlots {
    inner: Arc<RwLock<HashMap<IdentityKind, Arc<dyn PlatformConnection>>>>,
}

impl ConnectionSlots {
    pub fn get(&self, kind: IdentityKind) -> Option<Arc<dyn PlatformConnection>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    pub fn set(&self, kind: IdentityKind, connection: Arc<dyn PlatformConnection>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, connection);
    }

    pub fn clear(&self, kind: IdentityKind) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
    }
}

/// Runs both identity supervisors for the lifetime of the process.
pub struct SessionManager {
    tasks: Vec<JoinHandle<()>>,
    startup: Vec<(IdentityKind, oneshot::Receiver<StartupOutcome>)>,
}

impl SessionManager {
    pub fn start(
        config: &AppConfig,
        transport: Arc<dyn PlatformTransport>,
        slots: ConnectionSlots,
        engine: EngineHandle,
        dispatcher: ChatDispatcher,
        shutdown: CancellationToken,
    ) -> Self {
        let mut tasks = Vec::with_capacity(2);
        let mut startup = Vec::with_capacity(2);

        for (kind, session) in [
            (IdentityKind::Bot, config.identities.bot.session.clone()),
            (IdentityKind::User, config.identities.user.session.clone()),
        ] {
            let (tx, rx) = oneshot::channel();
            let supervisor = Supervisor {
                kind,
                session,
                transport: transport.clone(),
                slots: slots.clone(),
                engine: engine.clone(),
                dispatcher: (kind == IdentityKind::Bot).then(|| dispatcher.clone()),
                backoff: Backoff::from(&config.reconnect),
                shutdown: shutdown.clone(),
            };
            tasks.push(tokio::spawn(supervisor.run(tx)));
            startup.push((kind, rx));
        }

        Self { tasks, startup }
    }

    /// Wait until each identity has either connected, started retrying or
    /// failed authentication.
    ///
    /// Returns an error only when both identities failed to authenticate; a
    /// single failed identity is reported on status and the other one keeps
    /// running.
    pub async fn wait_for_startup(&mut self) -> Result<()> {
        let mut auth_failures = Vec::new();
        for (kind, rx) in self.startup.drain(..) {
            match rx.await {
                Ok(StartupOutcome::Connected) => info!(identity = kind.as_str(), "Identity online"),
                Ok(StartupOutcome::Retrying) => {
                    warn!(identity = kind.as_str(), "Identity not reachable yet, retrying in background")
                }
                Ok(StartupOutcome::AuthFailed(reason)) => {
                    error!(identity = kind.as_str(), reason = %reason, "Identity failed to authenticate");
                    auth_failures.push(format!("{}: {}", kind.as_str(), reason));
                }
                Err(_) => warn!(identity = kind.as_str(), "Supervisor stopped before reporting startup"),
            }
        }

        if auth_failures.len() == 2 {
            return Err(anyhow::anyhow!(
                "Both identities failed to authenticate ({})",
                auth_failures.join("; ")
            ));
        }
        Ok(())
    }

    /// Wait for the supervisors to wind down after shutdown was requested.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
