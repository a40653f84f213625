//! # Configuration Management
//!
//! Loads the service configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `CALLBRIDGE__` prefix
//! - A handful of deployment overrides that container images tend to set
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment overrides (`CONTROL_PORT`, `STATUS_PORT`, `SESSION_NAME`, `CALL_SESSION_NAME`)
//! 2. Environment variables (`CALLBRIDGE__CALL__JOIN_TIMEOUT_SECS=20`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values
//!
//! Nested keys use a double underscore separator so that snake_case field
//! names such as `join_timeout_secs` survive the mapping intact.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Complete service configuration.
///
/// Each section maps to one component: the two listeners, the two platform
/// identities, the transport that carries them, the media pipeline, the call
/// state machine, the audio queue and the reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub control: ControlConfig,
    pub status: EndpointConfig,
    pub identities: IdentitiesConfig,
    pub transport: TransportConfig,
    pub media: MediaConfig,
    pub call: CallConfig,
    pub queue: QueueConfig,
    pub reconnect: ReconnectConfig,
}

/// The control endpoint: accepts join/leave/play/cancel/capture/status.
///
/// `allowed_senders` restricts which chat senders may issue commands to the
/// bot identity. An empty list lets everyone through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

/// A plain listener address (used for the read-only status endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitiesConfig {
    pub bot: IdentityConfig,
    pub user: IdentityConfig,
}

/// Where to find a pre-authenticated session artifact.
///
/// The value may be a bare session name (`interactive_call_session`) or a
/// path; see `identity::credentials` for the lookup rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub session: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Drive a platform helper process over JSON lines on stdin/stdout.
    Sidecar,
    /// In-process simulated platform (dry runs, local development).
    Loopback,
}

/// Platform transport settings.
///
/// For `kind = "sidecar"`, one helper process is spawned per identity with
/// `command` and `args`; the identity kind and session path are passed in the
/// `authenticate` request and as `CALLBRIDGE_IDENTITY` / `CALLBRIDGE_SESSION`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub request_timeout_ms: u64,
}

/// An external program invocation.
///
/// Arguments may contain `{source}`, `{rate}` and `{channels}` placeholders,
/// which are substituted before the process is spawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn render_args(&self, source: Option<&str>, sample_rate: u32, channels: u8) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                let mut rendered = arg
                    .replace("{rate}", &sample_rate.to_string())
                    .replace("{channels}", &channels.to_string());
                if let Some(source) = source {
                    rendered = rendered.replace("{source}", source);
                }
                rendered
            })
            .collect()
    }
}

/// Raw audio format and the external transcoding processes.
///
/// The raw format is always signed 16-bit little-endian PCM. `chunk_ms`
/// controls the frame size handed between tasks; with `realtime_pacing` the
/// audio feeder sleeps one chunk duration per chunk so the call receives audio
/// at playback speed.
///
/// A transcoder left unset means the call transport already exchanges raw PCM
/// in that direction and frames are passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub chunk_ms: u32,
    pub realtime_pacing: bool,
    pub prime_silence_ms: u32,
    pub max_capture_secs: u32,
    #[serde(default)]
    pub inbound_transcoder: Option<CommandSpec>,
    #[serde(default)]
    pub outbound_transcoder: Option<CommandSpec>,
    pub decoder: CommandSpec,
}

impl MediaConfig {
    /// Bytes per chunk of raw PCM (16-bit samples).
    pub fn chunk_bytes(&self) -> usize {
        let samples = self.sample_rate as usize * self.chunk_ms as usize / 1000;
        samples.max(1) * self.channels as usize * 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub join_timeout_secs: u64,
    pub leave_timeout_secs: u64,
    pub auto_accept_invites: bool,
    pub transition_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs waiting behind the one that is playing.
    pub max_pending: usize,
    /// Number of finished jobs kept around for status queries.
    pub history: usize,
}

/// Capped exponential backoff for identity reconnects.
///
/// Attempt `n` (starting at 0) waits `min(base_delay_ms * 2^n, max_delay_ms)`.
/// After `max_attempts` failures the identity is marked degraded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig {
                host: "0.0.0.0".to_string(),
                port: 8082,
                allowed_senders: Vec::new(),
            },
            status: EndpointConfig {
                host: "0.0.0.0".to_string(),
                port: 8081,
            },
            identities: IdentitiesConfig {
                bot: IdentityConfig {
                    session: "bot_session".to_string(),
                },
                user: IdentityConfig {
                    session: "interactive_call_session".to_string(),
                },
            },
            transport: TransportConfig {
                kind: TransportKind::Sidecar,
                command: "callbridge-platform".to_string(),
                args: Vec::new(),
                request_timeout_ms: 10_000,
            },
            media: MediaConfig {
                sample_rate: 48_000, // what the call stacks negotiate for voice
                channels: 1,
                chunk_ms: 20,
                realtime_pacing: true,
                prime_silence_ms: 1000,
                max_capture_secs: 120,
                inbound_transcoder: None,
                outbound_transcoder: None,
                decoder: CommandSpec {
                    program: "ffmpeg".to_string(),
                    args: [
                        "-hide_banner", "-loglevel", "error", "-nostdin",
                        "-i", "{source}",
                        "-f", "s16le", "-acodec", "pcm_s16le",
                        "-ar", "{rate}", "-ac", "{channels}",
                        "pipe:1",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                },
            },
            call: CallConfig {
                join_timeout_secs: 30,
                leave_timeout_secs: 10,
                auto_accept_invites: false,
                transition_history: 32,
            },
            queue: QueueConfig {
                max_pending: 16,
                history: 64,
            },
            reconnect: ReconnectConfig {
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                max_attempts: 8,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `CALLBRIDGE__CONTROL__PORT=9000`
    /// - `CALLBRIDGE__TRANSPORT__KIND=loopback`
    /// - `CALLBRIDGE__CALL__AUTO_ACCEPT_INVITES=true`
    /// - `CALL_SESSION_NAME=/app/interactive_call_session.session`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("CALLBRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        // Names used by the container images and the session login helpers
        if let Ok(port) = env::var("CONTROL_PORT") {
            settings = settings.set_override("control.port", port)?;
        }
        if let Ok(port) = env::var("STATUS_PORT") {
            settings = settings.set_override("status.port", port)?;
        }
        if let Ok(session) = env::var("SESSION_NAME") {
            settings = settings.set_override("identities.bot.session", session)?;
        }
        if let Ok(session) = env::var("CALL_SESSION_NAME") {
            settings = settings.set_override("identities.user.session", session)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    ///
    /// ## What this checks:
    /// - Both ports are non-zero and distinct
    /// - Session references are not blank
    /// - Timeouts, retry budget and queue capacity are non-zero
    /// - The PCM format is one the pipeline understands (mono or stereo, sane rate)
    pub fn validate(&self) -> Result<()> {
        if self.control.port == 0 || self.status.port == 0 {
            return Err(anyhow::anyhow!("Listener ports cannot be 0"));
        }
        if self.control.port == self.status.port && self.control.host == self.status.host {
            return Err(anyhow::anyhow!(
                "Control and status endpoints must listen on different ports"
            ));
        }

        if self.identities.bot.session.trim().is_empty()
            || self.identities.user.session.trim().is_empty()
        {
            return Err(anyhow::anyhow!("Both identities need a session reference"));
        }

        if self.transport.kind == TransportKind::Sidecar && self.transport.command.trim().is_empty() {
            return Err(anyhow::anyhow!("Sidecar transport needs a command"));
        }
        if self.transport.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Transport request timeout must be greater than 0"));
        }

        if !(8_000..=192_000).contains(&self.media.sample_rate) {
            return Err(anyhow::anyhow!(
                "Unsupported sample rate {} (expected 8000..=192000)",
                self.media.sample_rate
            ));
        }
        if self.media.channels == 0 || self.media.channels > 2 {
            return Err(anyhow::anyhow!("Only mono or stereo PCM is supported"));
        }
        if self.media.chunk_ms == 0 {
            return Err(anyhow::anyhow!("Media chunk duration must be greater than 0"));
        }
        if self.media.decoder.program.trim().is_empty() {
            return Err(anyhow::anyhow!("Media decoder program cannot be empty"));
        }

        if self.call.join_timeout_secs == 0 || self.call.leave_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Join and leave timeouts must be greater than 0"));
        }

        if self.queue.max_pending == 0 {
            return Err(anyhow::anyhow!("Audio queue capacity must be greater than 0"));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(anyhow::anyhow!("Reconnect budget must allow at least one attempt"));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(anyhow::anyhow!("Reconnect base delay exceeds the maximum delay"));
        }

        Ok(())
    }

    /// A copy with every field that should not leave the process removed.
    ///
    /// Session references are paths to credential files, so only their file
    /// names are reported.
    pub fn redacted(&self) -> serde_json::Value {
        let file_name = |s: &str| {
            std::path::Path::new(s)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        serde_json::json!({
            "control": { "host": self.control.host, "port": self.control.port },
            "status": { "host": self.status.host, "port": self.status.port },
            "identities": {
                "bot": file_name(&self.identities.bot.session),
                "user": file_name(&self.identities.user.session),
            },
            "transport": { "kind": self.transport.kind },
            "media": {
                "sample_rate": self.media.sample_rate,
                "channels": self.media.channels,
                "chunk_ms": self.media.chunk_ms,
                "inbound_transcoder": self.media.inbound_transcoder.as_ref().map(|c| &c.program),
                "outbound_transcoder": self.media.outbound_transcoder.as_ref().map(|c| &c.program),
                "decoder": self.media.decoder.program,
            },
            "call": self.call,
            "queue": self.queue,
            "reconnect": self.reconnect,
        })
    }
}
