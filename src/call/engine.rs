//! # Call Engine
//!
//! The single owner of call-session state. Control requests, platform events
//! from the user identity, identity health changes, timer expiries and the
//! results of background work all arrive on one mailbox and are handled
//! strictly in arrival order, so a join and its confirmation can never race.
//!
//! The engine never awaits platform or subprocess I/O itself. Effects that
//! need the network (join, leave, opening call audio, re-verifying membership)
//! run in spawned tasks that post their outcome back to the mailbox. Readers
//! get a [`StatusSnapshot`] through a `watch` channel and never touch the
//! engine directly.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::player::{self, Playback};
use super::queue::{AudioJob, AudioQueue, JobStatus};
use super::state::{CallInput, CallMachine, CallState, Effect, Phase};
use super::status::{IdentitiesStatus, StatusSnapshot};
use crate::commands::{Command, CommandOutcome, CommandRequest};
use crate::config::AppConfig;
use crate::error::CallError;
use crate::identity::{ConnectionSlots, IdentityHealth, IdentityKind};
use crate::media::{pcm, MediaHandle, PcmFormat, PipelineFailure, SourceDecoder};
use crate::transport::{CallAudio, CallRef, PlatformEvent};

type Reply = oneshot::Sender<Result<CommandOutcome, CallError>>;

pub(crate) enum EngineMsg {
    Command { request: CommandRequest, reply: Reply },
    Platform(PlatformEvent),
    Identity {
        kind: IdentityKind,
        health: IdentityHealth,
    },
    TimedOut { request_id: Uuid, phase: Phase },
    RequestFailed { request_id: Uuid, error: CallError },
    AudioOpened {
        request_id: Uuid,
        call_id: String,
        result: Result<CallAudio, CallError>,
    },
    Reattached {
        request_id: Uuid,
        result: Result<CallAudio, CallError>,
    },
    JobFinished {
        job_id: String,
        result: Result<(), CallError>,
    },
}

/// Cheap, cloneable access to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineMsg>,
    status: watch::Receiver<Arc<StatusSnapshot>>,
    media: watch::Receiver<Option<MediaHandle>>,
}

impl EngineHandle {
    /// Run a command through the engine mailbox.
    pub async fn execute(&self, command: Command) -> Result<CommandOutcome, CallError> {
        let request = CommandRequest {
            id: Uuid::new_v4(),
            command,
        };
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Command { request, reply })
            .map_err(|_| CallError::EngineUnavailable)?;
        rx.await.map_err(|_| CallError::EngineUnavailable)?
    }

    pub fn platform_event(&self, event: PlatformEvent) {
        let _ = self.tx.send(EngineMsg::Platform(event));
    }

    pub fn identity_changed(&self, kind: IdentityKind, health: IdentityHealth) {
        let _ = self.tx.send(EngineMsg::Identity { kind, health });
    }

    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.status.borrow().clone()
    }

    /// Wait until a play job has finished.
    ///
    /// Resolves with the finished job when it played to the end, otherwise
    /// with the error that stopped it.
    pub async fn wait_for_job(&self, job_id: &str) -> Result<AudioJob, CallError> {
        let mut status = self.status.clone();
        loop {
            let finished = status
                .borrow_and_update()
                .queue
                .history
                .iter()
                .rev()
                .find(|job| job.id == job_id)
                .cloned();
            if let Some(job) = finished {
                return match (&job.status, &job.error) {
                    (JobStatus::Done, _) => Ok(job),
                    (_, Some(error)) => Err(error.to_call_error()),
                    (_, None) => Err(CallError::Cancelled),
                };
            }
            status
                .changed()
                .await
                .map_err(|_| CallError::EngineUnavailable)?;
        }
    }

    /// The media pipeline of the active call, if any.
    pub fn media(&self) -> Option<MediaHandle> {
        self.media.borrow().clone()
    }
}

pub struct CallEngine {
    config: Arc<AppConfig>,
    machine: CallMachine,
    queue: AudioQueue,
    bot: IdentityHealth,
    user: IdentityHealth,
    user_interrupted: bool,
    slots: ConnectionSlots,
    decoder: Arc<dyn SourceDecoder>,
    media: Option<MediaHandle>,
    pending_join: Option<(Uuid, Reply)>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    mailbox: mpsc::UnboundedReceiver<EngineMsg>,
    failures_tx: mpsc::UnboundedSender<PipelineFailure>,
    failures_rx: mpsc::UnboundedReceiver<PipelineFailure>,
    status_tx: watch::Sender<Arc<StatusSnapshot>>,
    media_tx: watch::Sender<Option<MediaHandle>>,
}

impl CallEngine {
    pub fn new(
        config: Arc<AppConfig>,
        slots: ConnectionSlots,
        decoder: Arc<dyn SourceDecoder>,
    ) -> (Self, EngineHandle) {
        let (tx, mailbox) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Arc::new(StatusSnapshot::initial()));
        let (media_tx, media_rx) = watch::channel(None);

        let engine = Self {
            machine: CallMachine::new(config.call.transition_history),
            queue: AudioQueue::new(config.queue.max_pending, config.queue.history),
            config,
            bot: IdentityHealth::Connecting,
            user: IdentityHealth::Connecting,
            user_interrupted: false,
            slots,
            decoder,
            media: None,
            pending_join: None,
            tx: tx.clone(),
            mailbox,
            failures_tx,
            failures_rx,
            status_tx,
            media_tx,
        };
        let handle = EngineHandle {
            tx,
            status: status_rx,
            media: media_rx,
        };
        (engine, handle)
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Call engine started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(msg) = self.mailbox.recv() => self.handle(msg),
                Some(failure) = self.failures_rx.recv() => self.pipeline_failed(failure),
            }
            self.publish();
            self.resolve_pending_join();
        }
        self.shutdown().await;
    }

    fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Command { request, reply } => self.command(request, reply),
            EngineMsg::Platform(event) => self.platform_event(event),
            EngineMsg::Identity { kind, health } => self.identity_changed(kind, health),
            EngineMsg::TimedOut { request_id, phase } => {
                self.drive(CallInput::TimedOut { request_id, phase });
            }
            EngineMsg::RequestFailed { request_id, error } => {
                self.drive(CallInput::TransportError {
                    request_id: Some(request_id),
                    error,
                });
            }
            EngineMsg::AudioOpened {
                request_id,
                call_id,
                result,
            } => self.audio_opened(request_id, call_id, result),
            EngineMsg::Reattached { request_id, result } => self.reattached(request_id, result),
            EngineMsg::JobFinished { job_id, result } => {
                if let Err(e) = &result {
                    debug!(job_id = %job_id, error = %e, "Player stopped with error");
                }
                self.queue.finish(&job_id, result);
                self.pump_queue();
            }
        }
    }

    fn command(&mut self, request: CommandRequest, reply: Reply) {
        debug!(request_id = %request.id, command = ?request.command, "Command received");
        let outcome = match request.command {
            Command::Join { call_ref, wait } => {
                match self.start_join(call_ref, request.id) {
                    Ok(()) if wait => {
                        self.pending_join = Some((request.id, reply));
                        return;
                    }
                    Ok(()) => Ok(CommandOutcome::Accepted {
                        request_id: request.id,
                        status: Arc::new(self.snapshot()),
                    }),
                    Err(e) => Err(e),
                }
            }
            Command::Leave => self
                .machine
                .apply(CallInput::Leave)
                .map(|effects| {
                    self.perform_all(effects);
                    CommandOutcome::Status(Arc::new(self.snapshot()))
                }),
            Command::Play { source } => match self.machine.state() {
                CallState::Joining | CallState::Active => self.queue.enqueue(source).map(|job| {
                    self.pump_queue();
                    CommandOutcome::Job(self.queue.get(&job.id).unwrap_or(job))
                }),
                _ => Err(CallError::NotInCall),
            },
            Command::Cancel { job_id } => self.queue.cancel(&job_id).map(CommandOutcome::Job),
            Command::Capture => match (&self.media, self.machine.state()) {
                (Some(media), CallState::Active) => Ok(CommandOutcome::Media(media.clone())),
                _ => Err(CallError::NotInCall),
            },
            Command::Status => Ok(CommandOutcome::Status(Arc::new(self.snapshot()))),
        };
        let _ = reply.send(outcome);
    }

    fn start_join(&mut self, call_ref: CallRef, request_id: Uuid) -> Result<(), CallError> {
        if self.machine.session().is_some() {
            return Err(CallError::AlreadyInCall);
        }
        if !self.joins_allowed() {
            return Err(CallError::Auth(format!(
                "both identities must be connected (bot {}, user {})",
                self.bot.label(),
                self.user.label()
            )));
        }
        let effects = self.machine.apply(CallInput::Join {
            call_ref,
            request_id,
        })?;
        self.perform_all(effects);
        Ok(())
    }

    fn platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::CallInvited { call_ref, from } => {
                if !self.config.call.auto_accept_invites {
                    info!(call_ref = %call_ref, from = ?from, "Call invite ignored");
                    return;
                }
                match CallRef::parse(&call_ref) {
                    Ok(call_ref) => {
                        info!(call_ref = %call_ref, from = ?from, "Accepting call invite");
                        if let Err(e) = self.start_join(call_ref, Uuid::new_v4()) {
                            info!(error = %e, "Call invite not accepted");
                        }
                    }
                    Err(e) => warn!(error = %e, "Invite with unusable call reference"),
                }
            }
            PlatformEvent::CallConfirmed { call_ref, call_id } => {
                self.drive(CallInput::Confirmed { call_ref, call_id });
            }
            PlatformEvent::CallEnded {
                call_ref,
                call_id,
                reason,
            } => {
                self.drive(CallInput::Ended {
                    call_ref,
                    call_id,
                    reason,
                });
            }
            PlatformEvent::ParticipantChanged {
                call_id,
                participant,
                joined,
            } => {
                self.drive(CallInput::ParticipantChanged {
                    call_id,
                    participant,
                    joined,
                });
            }
            PlatformEvent::ConnectionLost { .. } | PlatformEvent::MessageReceived { .. } => {}
        }
    }

    fn identity_changed(&mut self, kind: IdentityKind, health: IdentityHealth) {
        info!(identity = kind.as_str(), health = health.label(), "Identity health changed");
        let was_connected = match kind {
            IdentityKind::Bot => {
                self.bot = health;
                return;
            }
            IdentityKind::User => {
                let was = self.user.is_connected();
                self.user = health;
                was
            }
        };

        if self.machine.session().is_none() {
            self.user_interrupted = false;
            return;
        }

        match &self.user {
            IdentityHealth::Connected { .. } if !was_connected && self.user_interrupted => {
                self.user_interrupted = false;
                self.reattach();
            }
            IdentityHealth::Connecting | IdentityHealth::Reconnecting { .. } => {
                self.user_interrupted = true;
            }
            IdentityHealth::Degraded { reason, .. } | IdentityHealth::AuthFailed { reason } => {
                let error = CallError::Transport(format!("user identity lost: {}", reason));
                self.drive(CallInput::TransportError {
                    request_id: None,
                    error,
                });
            }
            IdentityHealth::Connected { .. } => {}
        }
    }

    /// Re-verify membership on the new user connection and rebind media.
    fn reattach(&mut self) {
        let Some(session) = self.machine.session() else {
            return;
        };
        let request_id = session.request_id;
        let call_ref = session.call_ref.clone();
        let call_id = match (session.state, session.call_id.clone()) {
            (CallState::Active, Some(call_id)) => call_id,
            _ => return,
        };
        let Some(connection) = self.slots.get(IdentityKind::User) else {
            return;
        };

        info!(call_ref = %call_ref, "Re-verifying call membership after reconnect");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match connection.verify_membership(&call_ref).await {
                Ok(true) => connection.open_audio(&call_id).await,
                Ok(false) => Err(CallError::Transport(format!(
                    "no longer a member of {} after reconnect",
                    call_ref
                ))),
                Err(e) => Err(e),
            };
            let _ = tx.send(EngineMsg::Reattached { request_id, result });
        });
    }

    fn reattached(&mut self, request_id: Uuid, result: Result<CallAudio, CallError>) {
        if !self.is_current(request_id, CallState::Active) {
            return;
        }
        let rebound = match (result, self.media.clone()) {
            (Ok(audio), Some(media)) => media.rebind(audio),
            // Reconnected before the first audio open came back; start on
            // the new connection and let the stale open be dropped
            (Ok(audio), None) => self.start_media(audio),
            (Err(error), _) => Err(error),
        };
        if let Err(error) = rebound {
            self.drive(CallInput::TransportError {
                request_id: Some(request_id),
                error,
            });
        }
    }

    fn audio_opened(
        &mut self,
        request_id: Uuid,
        call_id: String,
        result: Result<CallAudio, CallError>,
    ) {
        if !self.is_current(request_id, CallState::Active) {
            debug!(call_id = %call_id, "Dropping audio of a call that is no longer active");
            return;
        }
        if self.media.is_some() {
            debug!(call_id = %call_id, "Dropping audio opened on a replaced connection");
            return;
        }
        if let Err(error) = result.and_then(|audio| self.start_media(audio)) {
            self.drive(CallInput::TransportError {
                request_id: Some(request_id),
                error,
            });
        }
    }

    fn start_media(&mut self, audio: CallAudio) -> Result<(), CallError> {
        let call_id = self
            .machine
            .session()
            .and_then(|s| s.call_id.clone())
            .ok_or(CallError::NotInCall)?;
        let media = MediaHandle::start(&call_id, audio, &self.config.media, self.failures_tx.clone())?;
        self.prime(&media);
        self.media = Some(media.clone());
        self.media_tx.send_replace(Some(media));
        self.pump_queue();
        Ok(())
    }

    /// Give the platform a moment of silence while the call handshake settles.
    fn prime(&self, media: &MediaHandle) {
        let ms = self.config.media.prime_silence_ms;
        if ms == 0 {
            return;
        }
        let format = PcmFormat::from(&self.config.media);
        let chunk_bytes = self.config.media.chunk_bytes();
        let media = media.clone();
        tokio::spawn(async move {
            let silence = pcm::silence(format, ms);
            for chunk in silence.chunks(chunk_bytes) {
                if media.feed(chunk.to_vec()).await.is_err() {
                    break;
                }
            }
        });
    }

    fn pipeline_failed(&mut self, failure: PipelineFailure) {
        let current = self.media.as_ref().map(|m| m.call_id() == failure.call_id);
        if current != Some(true) {
            return;
        }
        self.drive(CallInput::TransportError {
            request_id: None,
            error: CallError::PipelineFailure(failure.reason),
        });
    }

    fn drive(&mut self, input: CallInput) {
        match self.machine.apply(input) {
            Ok(effects) => self.perform_all(effects),
            Err(e) => debug!(error = %e, "Input rejected by state machine"),
        }
    }

    fn perform_all(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.perform(effect);
        }
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::RequestJoin {
                call_ref,
                request_id,
            } => {
                let tx = self.tx.clone();
                let Some(connection) = self.slots.get(IdentityKind::User) else {
                    let _ = tx.send(EngineMsg::RequestFailed {
                        request_id,
                        error: CallError::Auth("user identity is not connected".to_string()),
                    });
                    return;
                };
                tokio::spawn(async move {
                    if let Err(error) = connection.join_call(&call_ref).await {
                        let _ = tx.send(EngineMsg::RequestFailed { request_id, error });
                    }
                });
            }
            Effect::RequestLeave { call_ref } => {
                let Some(connection) = self.slots.get(IdentityKind::User) else {
                    warn!(call_ref = %call_ref, "Cannot send leave, user identity is not connected");
                    return;
                };
                let leaving = self
                    .machine
                    .session()
                    .filter(|s| s.state == CallState::Leaving)
                    .map(|s| s.request_id);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = connection.leave_call(&call_ref).await {
                        warn!(call_ref = %call_ref, error = %error, "Leave request failed");
                        if let Some(request_id) = leaving {
                            let _ = tx.send(EngineMsg::RequestFailed { request_id, error });
                        }
                    }
                });
            }
            Effect::StartPipeline {
                call_id,
                request_id,
            } => {
                let tx = self.tx.clone();
                let Some(connection) = self.slots.get(IdentityKind::User) else {
                    let _ = tx.send(EngineMsg::RequestFailed {
                        request_id,
                        error: CallError::Transport("user identity is not connected".to_string()),
                    });
                    return;
                };
                tokio::spawn(async move {
                    let result = connection.open_audio(&call_id).await;
                    let _ = tx.send(EngineMsg::AudioOpened {
                        request_id,
                        call_id,
                        result,
                    });
                });
            }
            Effect::DrainQueue => {
                self.queue.drain();
            }
            Effect::ReleasePipeline => {
                if let Some(media) = self.media.take() {
                    media.release();
                    self.media_tx.send_replace(None);
                }
            }
            Effect::ArmTimeout { request_id, phase } => {
                let secs = match phase {
                    Phase::Join => self.config.call.join_timeout_secs,
                    Phase::Leave => self.config.call.leave_timeout_secs,
                };
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    let _ = tx.send(EngineMsg::TimedOut { request_id, phase });
                });
            }
        }
    }

    /// Start the next queued job if the call can take audio.
    fn pump_queue(&mut self) {
        if self.machine.state() != CallState::Active {
            return;
        }
        let Some(media) = self.media.clone() else {
            return;
        };
        let Some((job, cancel)) = self.queue.start_next() else {
            return;
        };

        let pacing = self
            .config
            .media
            .realtime_pacing
            .then(|| Duration::from_millis(self.config.media.chunk_ms as u64));
        let playback = Playback {
            job_id: job.id.clone(),
            source: job.source,
            media,
            decoder: self.decoder.clone(),
            cancel,
            pacing,
        };
        let tx = self.tx.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            let result = player::play(playback).await;
            let _ = tx.send(EngineMsg::JobFinished { job_id, result });
        });
    }

    fn resolve_pending_join(&mut self) {
        let Some((request_id, _)) = &self.pending_join else {
            return;
        };
        let request_id = *request_id;
        let state = self
            .machine
            .session()
            .filter(|s| s.request_id == request_id)
            .map(|s| s.state);

        let outcome = match state {
            Some(CallState::Joining) => return,
            Some(_) => Ok(CommandOutcome::Status(self.status_tx.borrow().clone())),
            None => Err(self
                .machine
                .last_failure()
                .filter(|f| f.request_id == request_id)
                .map(|f| f.error.clone())
                .unwrap_or(CallError::Cancelled)),
        };
        if let Some((_, reply)) = self.pending_join.take() {
            let _ = reply.send(outcome);
        }
    }

    fn is_current(&self, request_id: Uuid, state: CallState) -> bool {
        self.machine
            .session()
            .is_some_and(|s| s.request_id == request_id && s.state == state)
    }

    fn joins_allowed(&self) -> bool {
        self.bot.is_connected() && self.user.is_connected()
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.machine.state(),
            call: self.machine.session().cloned(),
            last_failure: self.machine.last_failure().cloned(),
            identities: IdentitiesStatus {
                bot: self.bot.clone(),
                user: self.user.clone(),
            },
            joins_allowed: self.joins_allowed(),
            queue_depth: self.queue.depth(),
            queue: self.queue.snapshot(),
            media: self.media.as_ref().map(|m| m.stats()),
            transitions: self.machine.transitions().cloned().collect(),
            updated_at: Utc::now(),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(Arc::new(self.snapshot()));
    }

    /// Leave the active call, if any, before the connections go away.
    async fn shutdown(mut self) {
        info!("Call engine stopping");
        if let Some((_, reply)) = self.pending_join.take() {
            let _ = reply.send(Err(CallError::EngineUnavailable));
        }
        self.queue.drain();
        if let Some(media) = self.media.take() {
            media.release();
            self.media_tx.send_replace(None);
        }

        let call_ref = self.machine.session().map(|s| s.call_ref.clone());
        if let (Some(call_ref), Some(connection)) = (call_ref, self.slots.get(IdentityKind::User)) {
            let timeout = Duration::from_secs(self.config.call.leave_timeout_secs);
            match tokio::time::timeout(timeout, connection.leave_call(&call_ref)).await {
                Ok(Ok(())) => info!(call_ref = %call_ref, "Left call on shutdown"),
                Ok(Err(e)) => warn!(call_ref = %call_ref, error = %e, "Leave on shutdown failed"),
                Err(_) => warn!(call_ref = %call_ref, "Leave on shutdown timed out"),
            }
        }
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ChatDispatcher;
    use crate::identity::SessionManager;
    use crate::media::decoder::PcmReader;
    use crate::media::AudioSource;
    use crate::transport::loopback::{LoopbackOptions, LoopbackPlatform};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Decodes every source into `n` chunks of the configured size.
    struct StaticDecoder {
        chunks: usize,
        chunk_bytes: usize,
    }

    #[async_trait]
    impl SourceDecoder for StaticDecoder {
        async fn open(&self, _source: &AudioSource) -> Result<PcmReader, CallError> {
            Ok(PcmReader::from_chunks(vec![vec![1u8; self.chunk_bytes]; self.chunks]))
        }
    }

    struct Harness {
        platform: LoopbackPlatform,
        engine: EngineHandle,
        shutdown: CancellationToken,
        startup: anyhow::Result<()>,
        _dir: TempDir,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn test_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        for (name, identity) in [
            ("bot", &mut config.identities.bot),
            ("user", &mut config.identities.user),
        ] {
            let path = dir.path().join(format!("{}.session", name));
            std::fs::write(&path, b"session-blob").unwrap();
            identity.session = path.to_string_lossy().into_owned();
        }
        config.media.realtime_pacing = false;
        config.media.prime_silence_ms = 0;
        config.call.join_timeout_secs = 1;
        config.call.leave_timeout_secs = 1;
        config.reconnect.base_delay_ms = 10;
        config.reconnect.max_delay_ms = 50;
        config.reconnect.max_attempts = 3;
        config
    }

    async fn start(
        options: LoopbackOptions,
        tweak: impl FnOnce(&mut AppConfig, &LoopbackPlatform),
        chunks: usize,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let platform = LoopbackPlatform::new(options);
        let mut config = test_config(&dir);
        tweak(&mut config, &platform);
        let config = Arc::new(config);

        let slots = ConnectionSlots::default();
        let decoder = Arc::new(StaticDecoder {
            chunks,
            chunk_bytes: config.media.chunk_bytes(),
        });
        let (engine, handle) = CallEngine::new(config.clone(), slots.clone(), decoder);
        let shutdown = CancellationToken::new();
        tokio::spawn(engine.run(shutdown.clone()));

        let dispatcher = ChatDispatcher::new(handle.clone(), slots.clone(), Vec::new());
        let mut sessions = SessionManager::start(
            &config,
            Arc::new(platform.clone()),
            slots,
            handle.clone(),
            dispatcher,
            shutdown.clone(),
        );
        let startup = sessions.wait_for_startup().await;

        Harness {
            platform,
            engine: handle,
            shutdown,
            startup,
            _dir: dir,
        }
    }

    async fn started() -> Harness {
        let harness = start(fast_confirm(), |_, _| {}, 3).await;
        wait_until(&harness.engine, |s| s.joins_allowed).await;
        harness
    }

    fn fast_confirm() -> LoopbackOptions {
        LoopbackOptions {
            auto_confirm: true,
            confirm_delay: Duration::from_millis(10),
        }
    }

    async fn wait_until(
        engine: &EngineHandle,
        predicate: impl Fn(&StatusSnapshot) -> bool,
    ) -> Arc<StatusSnapshot> {
        let mut rx = engine.status.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if predicate(&current) {
                    return current;
                }
                rx.changed().await.expect("engine stopped");
            }
        })
        .await
        .expect("status condition not reached")
    }

    async fn join(engine: &EngineHandle, call_ref: &str) -> Result<CommandOutcome, CallError> {
        engine
            .execute(Command::Join {
                call_ref: CallRef::parse(call_ref).unwrap(),
                wait: true,
            })
            .await
    }

    fn play(source: &str) -> Command {
        Command::Play {
            source: AudioSource::Url(format!("https://media.example/{}", source)),
        }
    }

    #[tokio::test]
    async fn test_join_play_leave() {
        let h = started().await;

        match join(&h.engine, "chat-42").await.unwrap() {
            CommandOutcome::Status(status) => {
                assert_eq!(status.state, CallState::Active);
                assert!(status.call.as_ref().unwrap().call_id.is_some());
            }
            _ => panic!("expected status"),
        }
        let status = wait_until(&h.engine, |s| s.media.is_some()).await;
        let call_id = status.call.as_ref().unwrap().call_id.clone().unwrap();

        let job = match h.engine.execute(play("a.ogg")).await.unwrap() {
            CommandOutcome::Job(job) => job,
            _ => panic!("expected job"),
        };
        assert_eq!(job.id, "q1");
        wait_until(&h.engine, |s| {
            s.queue
                .history
                .iter()
                .any(|j| j.id == "q1" && j.status == JobStatus::Done)
        })
        .await;

        let expected = 3 * AppConfig::default().media.chunk_bytes();
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.platform.sent_audio(&call_id).len() < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("audio never reached the call");

        match h.engine.execute(Command::Leave).await.unwrap() {
            CommandOutcome::Status(status) => assert_eq!(status.state, CallState::Leaving),
            _ => panic!("expected status"),
        }
        let status = wait_until(&h.engine, |s| s.state == CallState::Idle).await;
        assert!(status.call.is_none());
        assert!(status.last_failure.is_none());
        assert!(h.engine.media().is_none());
        assert_eq!(
            h.platform.journal(),
            vec!["join chat-42".to_string(), "leave chat-42".to_string()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_joins_admit_one() {
        let h = started().await;
        let (a, b) = tokio::join!(join(&h.engine, "chat-1"), join(&h.engine, "chat-2"));
        let rejected = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(CallError::AlreadyInCall)))
            .count();
        assert_eq!(rejected, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(h.platform.journal().len(), 1);
    }

    #[tokio::test]
    async fn test_commands_need_a_call() {
        let h = started().await;
        assert!(matches!(
            h.engine.execute(Command::Leave).await,
            Err(CallError::NotInCall)
        ));
        assert!(matches!(
            h.engine.execute(play("a.ogg")).await,
            Err(CallError::NotInCall)
        ));
        assert!(matches!(
            h.engine.execute(Command::Capture).await,
            Err(CallError::NotInCall)
        ));
    }

    #[tokio::test]
    async fn test_confirmation_while_idle_is_ignored() {
        let h = started().await;
        assert!(
            h.platform
                .emit(
                    IdentityKind::User,
                    PlatformEvent::CallConfirmed {
                        call_ref: "chat-9".to_string(),
                        call_id: "call-9".to_string(),
                    },
                )
                .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = h.engine.status();
        assert_eq!(status.state, CallState::Idle);
        assert!(status.call.is_none());
        assert!(h.engine.media().is_none());
    }

    #[tokio::test]
    async fn test_platform_hangup_drains_queue() {
        let h = start(
            fast_confirm(),
            |config, _| config.media.realtime_pacing = true,
            200,
        )
        .await;
        wait_until(&h.engine, |s| s.joins_allowed).await;

        join(&h.engine, "chat-42").await.unwrap();
        wait_until(&h.engine, |s| s.media.is_some()).await;
        let media = h.engine.media().unwrap();

        h.engine.execute(play("a.ogg")).await.unwrap();
        h.engine.execute(play("b.ogg")).await.unwrap();
        wait_until(&h.engine, |s| s.queue.playing.is_some()).await;

        h.platform
            .emit(
                IdentityKind::User,
                PlatformEvent::CallEnded {
                    call_ref: "chat-42".to_string(),
                    call_id: None,
                    reason: "hung up".to_string(),
                },
            )
            .await;

        let status = wait_until(&h.engine, |s| s.state == CallState::Idle).await;
        assert_eq!(status.last_failure.as_ref().unwrap().code, "transport_error");
        assert_eq!(status.queue_depth, 0);
        let ended: Vec<_> = status
            .queue
            .history
            .iter()
            .filter(|j| j.error.as_ref().is_some_and(|e| e.code == "call_ended"))
            .map(|j| j.id.as_str())
            .collect();
        assert_eq!(ended, vec!["q1", "q2"]);
        assert!(matches!(
            media.feed(vec![0u8; 1920]).await,
            Err(CallError::NotInCall)
        ));
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let h = start(
            fast_confirm(),
            |config, _| config.media.realtime_pacing = true,
            200,
        )
        .await;
        wait_until(&h.engine, |s| s.joins_allowed).await;
        join(&h.engine, "chat-42").await.unwrap();
        wait_until(&h.engine, |s| s.media.is_some()).await;

        h.engine.execute(play("a.ogg")).await.unwrap();
        h.engine.execute(play("b.ogg")).await.unwrap();
        match h
            .engine
            .execute(Command::Cancel {
                job_id: "q2".to_string(),
            })
            .await
            .unwrap()
        {
            CommandOutcome::Job(job) => assert_eq!(job.status, JobStatus::Failed),
            _ => panic!("expected job"),
        }
        assert!(matches!(
            h.engine
                .execute(Command::Cancel {
                    job_id: "q7".to_string()
                })
                .await,
            Err(CallError::JobNotFound(_))
        ));
        let status = h.engine.status();
        assert_eq!(status.queue.playing.as_ref().unwrap().id, "q1");
        assert_eq!(status.state, CallState::Active);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_call() {
        let h = started().await;
        join(&h.engine, "chat-42").await.unwrap();
        wait_until(&h.engine, |s| s.media.is_some()).await;

        h.platform.drop_connection(IdentityKind::User);
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.platform.connect_count(IdentityKind::User) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("user identity never reconnected");
        wait_until(&h.engine, |s| s.identities.user.is_connected()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = h.engine.status();
        assert_eq!(status.state, CallState::Active);
        assert!(status.last_failure.is_none());
        assert_eq!(h.platform.connect_count(IdentityKind::User), 2);
    }

    #[tokio::test]
    async fn test_membership_lost_during_reconnect() {
        let h = started().await;
        join(&h.engine, "chat-42").await.unwrap();
        wait_until(&h.engine, |s| s.media.is_some()).await;

        h.platform.forget_membership("chat-42");
        h.platform.drop_connection(IdentityKind::User);

        let status = wait_until(&h.engine, |s| {
            s.state == CallState::Idle && s.last_failure.is_some()
        })
        .await;
        assert!(status
            .last_failure
            .as_ref()
            .unwrap()
            .message
            .contains("no longer a member"));
        assert!(h.engine.media().is_none());
    }

    #[tokio::test]
    async fn test_join_refused_without_user_identity() {
        let h = start(
            fast_confirm(),
            |_, platform| platform.reject(IdentityKind::User, "session revoked"),
            3,
        )
        .await;
        assert!(h.startup.is_ok());
        wait_until(&h.engine, |s| {
            matches!(s.identities.user, IdentityHealth::AuthFailed { .. })
                && s.identities.bot.is_connected()
        })
        .await;

        assert!(matches!(
            join(&h.engine, "chat-42").await,
            Err(CallError::Auth(_))
        ));
        assert!(h.platform.journal().is_empty());
    }

    #[tokio::test]
    async fn test_startup_fails_when_both_identities_rejected() {
        let h = start(
            fast_confirm(),
            |_, platform| {
                platform.reject(IdentityKind::Bot, "bad token");
                platform.reject(IdentityKind::User, "bad session");
            },
            3,
        )
        .await;
        assert!(h.startup.is_err());
    }

    #[tokio::test]
    async fn test_unconfirmed_join_times_out() {
        let h = start(
            LoopbackOptions {
                auto_confirm: false,
                confirm_delay: Duration::from_millis(10),
            },
            |_, _| {},
            3,
        )
        .await;
        wait_until(&h.engine, |s| s.joins_allowed).await;

        assert!(matches!(
            join(&h.engine, "chat-42").await,
            Err(CallError::Timeout(_))
        ));
        let status = h.engine.status();
        assert_eq!(status.state, CallState::Idle);
        assert_eq!(status.last_failure.as_ref().unwrap().code, "timeout");
    }

    #[tokio::test]
    async fn test_chat_status_command_gets_reply() {
        let h = started().await;
        h.platform
            .emit(
                IdentityKind::Bot,
                PlatformEvent::MessageReceived {
                    chat: "chat-7".to_string(),
                    sender: "@alice".to_string(),
                    text: "/status".to_string(),
                },
            )
            .await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while !h
                .platform
                .journal()
                .iter()
                .any(|e| e.starts_with("message chat-7 Call: idle"))
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no chat reply");
    }

    #[tokio::test]
    async fn test_user_identity_degrades_during_call() {
        let h = started().await;
        join(&h.engine, "chat-42").await.unwrap();
        wait_until(&h.engine, |s| s.media.is_some()).await;

        h.platform.fail_next_connects(IdentityKind::User, 10);
        h.platform.drop_connection(IdentityKind::User);

        let status = wait_until(&h.engine, |s| {
            matches!(s.identities.user, IdentityHealth::Degraded { .. })
                && s.state == CallState::Idle
        })
        .await;
        assert!(!status.joins_allowed);
        assert!(status.identities.bot.is_connected());
        assert_eq!(status.last_failure.as_ref().unwrap().code, "transport_error");
        assert!(h.engine.media().is_none());
        // First connection plus the whole retry budget
        assert_eq!(h.platform.connect_count(IdentityKind::User), 4);

        assert!(matches!(
            join(&h.engine, "chat-42").await,
            Err(CallError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_transcoder_crash_fails_call() {
        let h = start(
            fast_confirm(),
            |config, _| {
                config.media.inbound_transcoder = Some(crate::config::CommandSpec {
                    program: "sh".to_string(),
                    args: vec!["-c".to_string(), "exit 1".to_string()],
                });
            },
            3,
        )
        .await;
        wait_until(&h.engine, |s| s.joins_allowed).await;

        join(&h.engine, "chat-42").await.unwrap();
        let status = wait_until(&h.engine, |s| s.last_failure.is_some()).await;
        assert_eq!(status.state, CallState::Idle);
        assert_eq!(status.last_failure.as_ref().unwrap().code, "pipeline_failure");
        assert!(h.engine.media().is_none());

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.platform.journal().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("call was never left");
        assert_eq!(
            h.platform.journal(),
            vec!["join chat-42".to_string(), "leave chat-42".to_string()]
        );
    }

    #[tokio::test]
    async fn test_inbound_audio_reaches_reader() {
        let h = started().await;
        join(&h.engine, "chat-42").await.unwrap();
        let status = wait_until(&h.engine, |s| s.media.is_some()).await;
        let call_id = status.call.as_ref().unwrap().call_id.clone().unwrap();
        let media = h.engine.media().unwrap();

        assert!(h.platform.inject_audio(&call_id, vec![3, 0, 4, 0]).await);
        let frame = tokio::time::timeout(Duration::from_secs(2), media.read())
            .await
            .unwrap();
        assert_eq!(frame, Ok(vec![3, 0, 4, 0]));

        h.engine.execute(Command::Leave).await.unwrap();
        wait_until(&h.engine, |s| s.state == CallState::Idle).await;
        assert_eq!(media.read().await, Err(CallError::NotInCall));
    }

    #[tokio::test]
    async fn test_reconnect_before_audio_opens() {
        let h = started().await;
        h.platform.delay_next_audio_open(Duration::from_millis(300));
        join(&h.engine, "chat-42").await.unwrap();
        h.platform.drop_connection(IdentityKind::User);

        let status = wait_until(&h.engine, |s| s.media.is_some()).await;
        let call_id = status.call.as_ref().unwrap().call_id.clone().unwrap();

        // Let the slow open from the lost connection come back
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.engine.status().state, CallState::Active);
        let media = h.engine.media().unwrap();

        // Inbound audio now only flows on the new connection's channels
        assert!(h.platform.inject_audio(&call_id, vec![7, 0]).await);
        let frame = tokio::time::timeout(Duration::from_secs(2), media.read())
            .await
            .unwrap();
        assert_eq!(frame, Ok(vec![7, 0]));
    }

    #[tokio::test]
    async fn test_prompt_then_record_answer() {
        let h = started().await;
        join(&h.engine, "chat-42").await.unwrap();
        let status = wait_until(&h.engine, |s| s.media.is_some()).await;
        let call_id = status.call.as_ref().unwrap().call_id.clone().unwrap();

        let job = match h.engine.execute(play("prompt.ogg")).await.unwrap() {
            CommandOutcome::Job(job) => job,
            _ => panic!("expected job"),
        };
        let finished = h.engine.wait_for_job(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Done);

        let media = h.engine.media().unwrap();
        let recorder = tokio::spawn(async move { media.record_inbound(1).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.platform.inject_audio(&call_id, vec![5, 0, 6, 0]).await);

        let answer = recorder.await.unwrap().unwrap();
        assert!(!answer.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_on_prompt_sees_hangup() {
        let h = start(
            fast_confirm(),
            |config, _| config.media.realtime_pacing = true,
            200,
        )
        .await;
        wait_until(&h.engine, |s| s.joins_allowed).await;
        join(&h.engine, "chat-42").await.unwrap();
        wait_until(&h.engine, |s| s.media.is_some()).await;

        h.engine.execute(play("prompt.ogg")).await.unwrap();
        let waiter = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.wait_for_job("q1").await })
        };
        wait_until(&h.engine, |s| s.queue.playing.is_some()).await;
        h.platform
            .emit(
                IdentityKind::User,
                PlatformEvent::CallEnded {
                    call_ref: "chat-42".to_string(),
                    call_id: None,
                    reason: "hung up".to_string(),
                },
            )
            .await;

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), CallError::CallEnded);
    }
}
