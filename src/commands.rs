//! # Commands
//!
//! The command vocabulary shared by the control endpoint and the bot chat
//! interface, plus the dispatcher that turns chat messages sent to the bot
//! identity into engine commands and replies with the outcome.
//!
//! Chat syntax:
//!
//! ```text
//! /join <chat id | @username | reference>
//! /leave
//! /play <file path | http(s) url>
//! /cancel <job id>
//! /status
//! ```
//!
//! Commands may carry the bot's name (`/status@callbridge_bot`), as chat
//! clients add it in groups.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::{AudioJob, EngineHandle, StatusSnapshot};
use crate::error::CallError;
use crate::identity::{ConnectionSlots, IdentityKind};
use crate::media::{AudioSource, MediaHandle};
use crate::transport::CallRef;

#[derive(Debug, Clone)]
pub enum Command {
    Join { call_ref: CallRef, wait: bool },
    Leave,
    Play { source: AudioSource },
    Cancel { job_id: String },
    /// Hand out the media pipeline so the caller can record inbound audio
    Capture,
    Status,
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub id: Uuid,
    pub command: Command,
}

pub enum CommandOutcome {
    Status(Arc<StatusSnapshot>),
    /// A join was started without waiting for confirmation
    Accepted {
        request_id: Uuid,
        status: Arc<StatusSnapshot>,
    },
    Job(AudioJob),
    Media(MediaHandle),
}

const USAGE: &str = "Commands: /join <chat>, /leave, /play <file or url>, /cancel <job>, /status";

/// Parse a chat message. `None` when the message is not a command at all.
pub fn parse_chat_command(text: &str) -> Option<Result<Command, String>> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let name = name.split('@').next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

    let parsed = match (name.as_str(), arg) {
        ("join", Some(arg)) => CallRef::parse(arg)
            .map(|call_ref| Command::Join {
                call_ref,
                wait: true,
            })
            .map_err(|e| e.to_string()),
        ("join", None) => Err("Usage: /join <chat id or @username>".to_string()),
        ("leave", _) => Ok(Command::Leave),
        ("play", Some(arg)) => AudioSource::parse(arg)
            .map(|source| Command::Play { source })
            .map_err(|e| e.to_string()),
        ("play", None) => Err("Usage: /play <file path or url>".to_string()),
        ("cancel", Some(arg)) => Ok(Command::Cancel {
            job_id: arg.to_string(),
        }),
        ("cancel", None) => Err("Usage: /cancel <job id>".to_string()),
        ("status", _) => Ok(Command::Status),
        ("capture", _) => Err("Capture is only available on the control endpoint".to_string()),
        _ => Err(USAGE.to_string()),
    };
    Some(parsed)
}

/// Text reply for a command outcome.
pub fn describe(outcome: &Result<CommandOutcome, CallError>) -> String {
    match outcome {
        Ok(CommandOutcome::Status(status)) => status.summary(),
        Ok(CommandOutcome::Accepted { request_id, status }) => {
            format!("Join started (request {})\n{}", request_id, status.summary())
        }
        Ok(CommandOutcome::Job(job)) => format!(
            "Job {}: {} ({})",
            job.id,
            job.status.as_str(),
            job.source
        ),
        Ok(CommandOutcome::Media(media)) => format!("Media pipeline for {}", media.call_id()),
        Err(e) => format!("Error ({}): {}", e.code(), e),
    }
}

/// Routes chat commands received by the bot identity.
#[derive(Clone)]
pub struct ChatDispatcher {
    engine: EngineHandle,
    slots: ConnectionSlots,
    allowed: Arc<Vec<String>>,
}

impl ChatDispatcher {
    pub fn new(engine: EngineHandle, slots: ConnectionSlots, allowed_senders: Vec<String>) -> Self {
        let allowed = allowed_senders
            .into_iter()
            .map(|s| s.trim().trim_start_matches('@').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            engine,
            slots,
            allowed: Arc::new(allowed),
        }
    }

    fn is_allowed(&self, sender: &str) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        let sender = sender.trim().trim_start_matches('@').to_ascii_lowercase();
        self.allowed.iter().any(|a| *a == sender)
    }

    pub async fn handle(&self, chat: String, sender: String, text: String) {
        let Some(parsed) = parse_chat_command(&text) else {
            return;
        };
        debug!(chat = %chat, sender = %sender, "Chat command received");

        let reply = if !self.is_allowed(&sender) {
            warn!(sender = %sender, "Rejected chat command from unlisted sender");
            "You are not allowed to control this bot.".to_string()
        } else {
            match parsed {
                Ok(command) => {
                    info!(sender = %sender, command = ?command, "Executing chat command");
                    describe(&self.engine.execute(command).await)
                }
                Err(usage) => usage,
            }
        };

        match self.slots.get(IdentityKind::Bot) {
            Some(bot) => {
                if let Err(e) = bot.send_message(&chat, &reply).await {
                    warn!(chat = %chat, error = %e, "Failed to send chat reply");
                }
            }
            None => warn!(chat = %chat, "Bot identity offline, reply dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert!(parse_chat_command("hello there").is_none());
        assert!(matches!(
            parse_chat_command("/join @some_user"),
            Some(Ok(Command::Join { wait: true, .. }))
        ));
        assert!(matches!(
            parse_chat_command("/leave@callbridge_bot"),
            Some(Ok(Command::Leave))
        ));
        assert!(matches!(
            parse_chat_command("  /STATUS  "),
            Some(Ok(Command::Status))
        ));
        assert!(matches!(
            parse_chat_command("/cancel q3"),
            Some(Ok(Command::Cancel { ref job_id })) if job_id == "q3"
        ));
        assert!(matches!(
            parse_chat_command("/play https://radio.example/stream"),
            Some(Ok(Command::Play { .. }))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_chat_command("/join"), Some(Err(_))));
        assert!(matches!(parse_chat_command("/join two words"), Some(Err(_))));
        assert!(matches!(parse_chat_command("/play /missing/file.ogg"), Some(Err(_))));
        assert!(matches!(parse_chat_command("/capture"), Some(Err(_))));
        assert_eq!(
            parse_chat_command("/dance").unwrap().unwrap_err(),
            USAGE.to_string()
        );
    }

    #[test]
    fn test_describe_error() {
        let text = describe(&Err(CallError::NotInCall));
        assert!(text.starts_with("Error (not_in_call)"));
    }
}
