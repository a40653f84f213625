use chrono::{DateTime, Utc};
use serde::Serialize;

use super::queue::QueueSnapshot;
use super::state::{CallSession, CallState, FailureRecord, Transition};
use crate::identity::IdentityHealth;
use crate::media::MediaStats;

#[derive(Debug, Clone, Serialize)]
pub struct IdentitiesStatus {
    pub bot: IdentityHealth,
    pub user: IdentityHealth,
}

/// Everything status readers see, published by the engine after each message.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: CallState,
    pub call: Option<CallSession>,
    pub last_failure: Option<FailureRecord>,
    pub identities: IdentitiesStatus,
    /// Both identities connected
    pub joins_allowed: bool,
    pub queue_depth: usize,
    pub queue: QueueSnapshot,
    pub media: Option<MediaStats>,
    pub transitions: Vec<Transition>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn initial() -> Self {
        Self {
            state: CallState::Idle,
            call: None,
            last_failure: None,
            identities: IdentitiesStatus {
                bot: IdentityHealth::Connecting,
                user: IdentityHealth::Connecting,
            },
            joins_allowed: false,
            queue_depth: 0,
            queue: QueueSnapshot {
                playing: None,
                pending: Vec::new(),
                history: Vec::new(),
            },
            media: None,
            transitions: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// One-line summary for chat replies and logs.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        match &self.call {
            Some(call) => lines.push(format!("Call: {} ({})", self.state.as_str(), call.call_ref)),
            None => lines.push(format!("Call: {}", self.state.as_str())),
        }
        match &self.queue.playing {
            Some(job) => lines.push(format!("Playing: {} ({} queued)", job.id, self.queue.pending.len())),
            None => lines.push(format!("Queue: {} waiting", self.queue.pending.len())),
        }
        lines.push(format!(
            "Identities: bot {}, user {}",
            self.identities.bot.label(),
            self.identities.user.label()
        ));
        if let Some(failure) = &self.last_failure {
            lines.push(format!("Last failure: {}", failure.message));
        }
        lines.join("\n")
    }
}
