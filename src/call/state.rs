//! # Call Session State Machine
//!
//! A pure transition function over the single call session the service can
//! hold. It owns no tasks and performs no I/O: every input produces a list
//! of [`Effect`]s that the engine carries out, which keeps the lifecycle rules
//! testable without a platform or subprocesses.
//!
//! ```text
//! idle ──join──► joining ──confirmed──► active ──leave──► leaving ──ended──► idle
//!                   │                     │
//!                   └──────── error ──────┴──► failed ──► idle
//! ```
//!
//! `failed` is only ever visible in the transition history: a failure is
//! recorded and the machine settles in `idle` within the same input.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CallError;
use crate::transport::CallRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Joining,
    Active,
    Leaving,
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Joining => "joining",
            CallState::Active => "active",
            CallState::Leaving => "leaving",
            CallState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub request_id: Uuid,
    pub call_ref: CallRef,
    pub call_id: Option<String>,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub joined_at: Option<DateTime<Utc>>,
    pub participants: BTreeSet<String>,
}

/// Why the last session ended badly. Kept until a new session starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub call_ref: String,
    pub request_id: Uuid,
    pub code: &'static str,
    pub message: String,
    #[serde(skip)]
    pub error: CallError,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
    pub call_ref: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Join,
    Leave,
}

#[derive(Debug, Clone)]
pub enum CallInput {
    Join { call_ref: CallRef, request_id: Uuid },
    Confirmed { call_ref: String, call_id: String },
    Leave,
    Ended {
        call_ref: String,
        call_id: Option<String>,
        reason: String,
    },
    ParticipantChanged {
        call_id: String,
        participant: String,
        joined: bool,
    },
    TransportError { request_id: Option<Uuid>, error: CallError },
    TimedOut { request_id: Uuid, phase: Phase },
}

/// Work the engine performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RequestJoin { call_ref: CallRef, request_id: Uuid },
    RequestLeave { call_ref: CallRef },
    StartPipeline { call_id: String, request_id: Uuid },
    /// Fail every queued and playing job with `CallEnded`
    DrainQueue,
    ReleasePipeline,
    ArmTimeout { request_id: Uuid, phase: Phase },
}

pub struct CallMachine {
    session: Option<CallSession>,
    last_failure: Option<FailureRecord>,
    transitions: VecDeque<Transition>,
    history_limit: usize,
}

impl CallMachine {
    pub fn new(history_limit: usize) -> Self {
        Self {
            session: None,
            last_failure: None,
            transitions: VecDeque::with_capacity(history_limit),
            history_limit: history_limit.max(1),
        }
    }

    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn last_failure(&self) -> Option<&FailureRecord> {
        self.last_failure.as_ref()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    /// Apply one input. Errors are caller misuse and leave the state untouched.
    pub fn apply(&mut self, input: CallInput) -> Result<Vec<Effect>, CallError> {
        match input {
            CallInput::Join {
                call_ref,
                request_id,
            } => {
                if self.session.is_some() {
                    return Err(CallError::AlreadyInCall);
                }
                self.last_failure = None;
                self.session = Some(CallSession {
                    request_id,
                    call_ref: call_ref.clone(),
                    call_id: None,
                    state: CallState::Idle,
                    created_at: Utc::now(),
                    joined_at: None,
                    participants: BTreeSet::new(),
                });
                self.set_state(CallState::Joining);
                Ok(vec![
                    Effect::RequestJoin {
                        call_ref,
                        request_id,
                    },
                    Effect::ArmTimeout {
                        request_id,
                        phase: Phase::Join,
                    },
                ])
            }

            CallInput::Confirmed { call_ref, call_id } => {
                let Some(session) = self.session.as_mut() else {
                    info!(call_ref = %call_ref, "Ignoring confirmation while idle");
                    return Ok(Vec::new());
                };
                if session.state != CallState::Joining || !session.call_ref.matches(&call_ref) {
                    info!(
                        call_ref = %call_ref,
                        state = session.state.as_str(),
                        "Ignoring stale confirmation"
                    );
                    return Ok(Vec::new());
                }
                session.call_id = Some(call_id.clone());
                session.joined_at = Some(Utc::now());
                let request_id = session.request_id;
                self.set_state(CallState::Active);
                Ok(vec![Effect::StartPipeline {
                    call_id,
                    request_id,
                }])
            }

            CallInput::Leave => match self.state() {
                CallState::Idle | CallState::Failed => Err(CallError::NotInCall),
                CallState::Joining => Ok(self.fail(CallError::Cancelled)),
                CallState::Leaving => Ok(Vec::new()),
                CallState::Active => {
                    let (call_ref, request_id) = match self.session.as_ref() {
                        Some(s) => (s.call_ref.clone(), s.request_id),
                        None => return Err(CallError::NotInCall),
                    };
                    self.set_state(CallState::Leaving);
                    Ok(vec![
                        Effect::DrainQueue,
                        Effect::ReleasePipeline,
                        Effect::RequestLeave { call_ref },
                        Effect::ArmTimeout {
                            request_id,
                            phase: Phase::Leave,
                        },
                    ])
                }
            },

            CallInput::Ended {
                call_ref,
                call_id,
                reason,
            } => {
                let Some(session) = self.session.as_ref() else {
                    return Ok(Vec::new());
                };
                let same_call = session.call_ref.matches(&call_ref)
                    || (call_id.is_some() && call_id == session.call_id);
                if !same_call {
                    info!(call_ref = %call_ref, "Ignoring end of unrelated call");
                    return Ok(Vec::new());
                }
                match session.state {
                    CallState::Leaving => {
                        self.set_state(CallState::Idle);
                        self.session = None;
                        Ok(Vec::new())
                    }
                    CallState::Joining | CallState::Active => Ok(self.fail(CallError::Transport(
                        format!("call ended by platform: {}", reason),
                    ))),
                    CallState::Idle | CallState::Failed => Ok(Vec::new()),
                }
            }

            CallInput::ParticipantChanged {
                call_id,
                participant,
                joined,
            } => {
                if let Some(session) = self.session.as_mut() {
                    if session.call_id.as_deref() == Some(call_id.as_str()) {
                        if joined {
                            session.participants.insert(participant);
                        } else {
                            session.participants.remove(&participant);
                        }
                    }
                }
                Ok(Vec::new())
            }

            CallInput::TransportError { request_id, error } => {
                let Some(session) = self.session.as_ref() else {
                    return Ok(Vec::new());
                };
                if request_id.is_some_and(|id| id != session.request_id) {
                    return Ok(Vec::new());
                }
                if session.state == CallState::Leaving {
                    // Leaving anyway; the platform error only means the leave
                    // request itself failed
                    warn!(error = %error, "Error while leaving, settling idle");
                    self.set_state(CallState::Idle);
                    self.session = None;
                    return Ok(Vec::new());
                }
                Ok(self.fail(error))
            }

            CallInput::TimedOut { request_id, phase } => {
                let Some(session) = self.session.as_ref() else {
                    return Ok(Vec::new());
                };
                if session.request_id != request_id {
                    return Ok(Vec::new());
                }
                match (phase, session.state) {
                    (Phase::Join, CallState::Joining) => {
                        let error = CallError::Timeout(format!(
                            "no confirmation for {} within the join timeout",
                            session.call_ref
                        ));
                        Ok(self.fail(error))
                    }
                    (Phase::Leave, CallState::Leaving) => {
                        let error = CallError::Timeout(format!(
                            "leave of {} was never confirmed",
                            session.call_ref
                        ));
                        Ok(self.fail(error))
                    }
                    _ => Ok(Vec::new()),
                }
            }
        }
    }

    /// Record a failure and unwind to idle.
    fn fail(&mut self, error: CallError) -> Vec<Effect> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let was = session.state;
        let call_ref = session.call_ref.clone();
        warn!(call_ref = %call_ref, state = was.as_str(), error = %error, "Call session failed");

        self.last_failure = Some(FailureRecord {
            call_ref: call_ref.to_string(),
            request_id: session.request_id,
            code: error.code(),
            message: error.to_string(),
            error,
            at: Utc::now(),
        });
        self.set_state(CallState::Failed);
        self.set_state(CallState::Idle);
        self.session = None;

        let mut effects = vec![Effect::DrainQueue, Effect::ReleasePipeline];
        if was != CallState::Leaving {
            effects.push(Effect::RequestLeave { call_ref });
        }
        effects
    }

    fn set_state(&mut self, to: CallState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let from = session.state;
        session.state = to;
        info!(
            call_ref = %session.call_ref,
            from = from.as_str(),
            to = to.as_str(),
            "Call state transition"
        );
        if self.transitions.len() == self.history_limit {
            self.transitions.pop_front();
        }
        self.transitions.push_back(Transition {
            from,
            to,
            call_ref: session.call_ref.to_string(),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(machine: &mut CallMachine, call_ref: &str) -> Result<(Uuid, Vec<Effect>), CallError> {
        let request_id = Uuid::new_v4();
        let effects = machine.apply(CallInput::Join {
            call_ref: CallRef::parse(call_ref).unwrap(),
            request_id,
        })?;
        Ok((request_id, effects))
    }

    fn confirm(machine: &mut CallMachine, call_ref: &str) -> Vec<Effect> {
        machine
            .apply(CallInput::Confirmed {
                call_ref: call_ref.to_string(),
                call_id: "c1".to_string(),
            })
            .unwrap()
    }

    #[test]
    fn test_join_confirm_leave_cycle() {
        let mut machine = CallMachine::new(16);
        let (request_id, effects) = join(&mut machine, "chat-42").unwrap();
        assert_eq!(machine.state(), CallState::Joining);
        assert!(matches!(effects[0], Effect::RequestJoin { .. }));
        assert_eq!(
            effects[1],
            Effect::ArmTimeout {
                request_id,
                phase: Phase::Join
            }
        );

        let effects = confirm(&mut machine, "chat-42");
        assert_eq!(machine.state(), CallState::Active);
        assert_eq!(
            effects,
            vec![Effect::StartPipeline {
                call_id: "c1".to_string(),
                request_id
            }]
        );

        let effects = machine.apply(CallInput::Leave).unwrap();
        assert_eq!(machine.state(), CallState::Leaving);
        assert_eq!(effects[0], Effect::DrainQueue);
        assert_eq!(effects[1], Effect::ReleasePipeline);

        // Leave while leaving is idempotent
        assert!(machine.apply(CallInput::Leave).unwrap().is_empty());
        assert_eq!(machine.state(), CallState::Leaving);

        machine
            .apply(CallInput::Ended {
                call_ref: "chat-42".to_string(),
                call_id: None,
                reason: "left".to_string(),
            })
            .unwrap();
        assert_eq!(machine.state(), CallState::Idle);
        assert!(machine.last_failure().is_none());
    }

    #[test]
    fn test_join_while_busy_is_rejected() {
        let mut machine = CallMachine::new(16);
        join(&mut machine, "chat-1").unwrap();
        assert_eq!(join(&mut machine, "chat-2").unwrap_err(), CallError::AlreadyInCall);
        assert_eq!(machine.session().unwrap().call_ref.as_str(), "chat-1");

        confirm(&mut machine, "chat-1");
        assert_eq!(join(&mut machine, "chat-2").unwrap_err(), CallError::AlreadyInCall);
        assert_eq!(machine.state(), CallState::Active);
    }

    #[test]
    fn test_confirmation_while_idle_is_noop() {
        let mut machine = CallMachine::new(16);
        assert!(confirm(&mut machine, "chat-42").is_empty());
        assert_eq!(machine.state(), CallState::Idle);
        assert_eq!(machine.transitions().count(), 0);
    }

    #[test]
    fn test_confirmation_for_other_call_is_ignored() {
        let mut machine = CallMachine::new(16);
        join(&mut machine, "chat-1").unwrap();
        assert!(confirm(&mut machine, "chat-2").is_empty());
        assert_eq!(machine.state(), CallState::Joining);
    }

    #[test]
    fn test_leave_while_idle() {
        let mut machine = CallMachine::new(16);
        assert_eq!(machine.apply(CallInput::Leave).unwrap_err(), CallError::NotInCall);
    }

    #[test]
    fn test_leave_while_joining_cancels() {
        let mut machine = CallMachine::new(16);
        join(&mut machine, "chat-1").unwrap();
        let effects = machine.apply(CallInput::Leave).unwrap();
        assert_eq!(machine.state(), CallState::Idle);
        assert!(effects.contains(&Effect::DrainQueue));
        assert_eq!(machine.last_failure().unwrap().error, CallError::Cancelled);

        let states: Vec<_> = machine.transitions().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![CallState::Joining, CallState::Failed, CallState::Idle]
        );
    }

    #[test]
    fn test_platform_end_while_active_is_failure() {
        let mut machine = CallMachine::new(16);
        join(&mut machine, "chat-1").unwrap();
        confirm(&mut machine, "chat-1");
        let effects = machine
            .apply(CallInput::Ended {
                call_ref: "chat-1".to_string(),
                call_id: Some("c1".to_string()),
                reason: "kicked".to_string(),
            })
            .unwrap();
        assert_eq!(machine.state(), CallState::Idle);
        assert!(effects.contains(&Effect::ReleasePipeline));
        let failure = machine.last_failure().unwrap();
        assert_eq!(failure.code, "transport_error");
        assert!(failure.message.contains("kicked"));
    }

    #[test]
    fn test_stale_timeout_is_ignored() {
        let mut machine = CallMachine::new(16);
        let (request_id, _) = join(&mut machine, "chat-1").unwrap();
        confirm(&mut machine, "chat-1");
        machine
            .apply(CallInput::TimedOut {
                request_id,
                phase: Phase::Join,
            })
            .unwrap();
        assert_eq!(machine.state(), CallState::Active);

        machine
            .apply(CallInput::TimedOut {
                request_id: Uuid::new_v4(),
                phase: Phase::Leave,
            })
            .unwrap();
        assert_eq!(machine.state(), CallState::Active);
    }

    #[test]
    fn test_join_timeout_fails_session() {
        let mut machine = CallMachine::new(16);
        let (request_id, _) = join(&mut machine, "chat-1").unwrap();
        machine
            .apply(CallInput::TimedOut {
                request_id,
                phase: Phase::Join,
            })
            .unwrap();
        assert_eq!(machine.state(), CallState::Idle);
        assert_eq!(machine.last_failure().unwrap().code, "timeout");

        // A new session supersedes the failure
        join(&mut machine, "chat-2").unwrap();
        assert!(machine.last_failure().is_none());
    }

    #[test]
    fn test_unconfirmed_leave_records_timeout() {
        let mut machine = CallMachine::new(16);
        let (request_id, _) = join(&mut machine, "chat-1").unwrap();
        confirm(&mut machine, "chat-1");
        machine.apply(CallInput::Leave).unwrap();

        let effects = machine
            .apply(CallInput::TimedOut {
                request_id,
                phase: Phase::Leave,
            })
            .unwrap();
        assert_eq!(machine.state(), CallState::Idle);
        assert!(!effects.iter().any(|e| matches!(e, Effect::RequestLeave { .. })));

        let failure = machine.last_failure().unwrap();
        assert_eq!(failure.code, "timeout");
        assert!(failure.message.contains("never confirmed"));

        let states: Vec<_> = machine.transitions().map(|t| t.to).skip(2).collect();
        assert_eq!(
            states,
            vec![CallState::Leaving, CallState::Failed, CallState::Idle]
        );
    }

    #[test]
    fn test_participants_tracked() {
        let mut machine = CallMachine::new(16);
        join(&mut machine, "chat-1").unwrap();
        confirm(&mut machine, "chat-1");
        for (participant, joined) in [("alice", true), ("bob", true), ("alice", false)] {
            machine
                .apply(CallInput::ParticipantChanged {
                    call_id: "c1".to_string(),
                    participant: participant.to_string(),
                    joined,
                })
                .unwrap();
        }
        let participants: Vec<_> = machine.session().unwrap().participants.iter().cloned().collect();
        assert_eq!(participants, vec!["bob".to_string()]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut machine = CallMachine::new(3);
        for _ in 0..4 {
            join(&mut machine, "chat-1").unwrap();
            machine.apply(CallInput::Leave).unwrap();
        }
        assert_eq!(machine.transitions().count(), 3);
    }
}
