//! Control endpoint: the mutating half of the HTTP surface.
//!
//! Every handler turns its request into a [`Command`] and sends it through the
//! engine mailbox, so HTTP and chat commands are ordered against each other
//! and against platform events.

use actix_web::{error::JsonPayloadError, web, HttpRequest, HttpResponse, HttpResponseBuilder};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::commands::{Command, CommandOutcome};
use crate::error::{AppError, AppResult, CallError};
use crate::media::{AudioSource, CaptureBuffer, MediaHandle};
use crate::state::AppState;
use crate::transport::CallRef;

/// Extra time a waiting join gets on top of the engine's own join timeout,
/// so the engine's `Timeout` is what the caller normally sees.
const JOIN_WAIT_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_CAPTURE_SECS: u32 = 5;
const DEFAULT_LISTEN_SECS: u32 = 15;

/// Longest a prompt may take to reach the call before `ask` gives up.
const PROMPT_PLAY_LIMIT: Duration = Duration::from_secs(120);

/// Pause between the end of a prompt and the start of listening.
const ANSWER_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub call_ref: String,
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct PlayRequest {
    pub source: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CaptureRequest {
    pub seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub source: String,
    pub listen_seconds: Option<u32>,
}

fn respond(outcome: CommandOutcome) -> HttpResponse {
    match outcome {
        CommandOutcome::Status(status) => HttpResponse::Ok().json(status.as_ref()),
        CommandOutcome::Accepted { request_id, status } => HttpResponse::Accepted().json(json!({
            "request_id": request_id,
            "status": status.as_ref(),
        })),
        CommandOutcome::Job(job) => HttpResponse::Accepted().json(job),
        CommandOutcome::Media(media) => HttpResponse::Ok().json(media.stats()),
    }
}

pub async fn join(state: web::Data<AppState>, body: web::Json<JoinRequest>) -> AppResult<HttpResponse> {
    let JoinRequest { call_ref, wait } = body.into_inner();
    let call_ref = CallRef::parse(&call_ref)?;
    info!(call_ref = %call_ref, wait, "Join requested");

    let limit = Duration::from_secs(state.config.call.join_timeout_secs) + JOIN_WAIT_GRACE;
    let outcome = tokio::time::timeout(limit, state.engine.execute(Command::Join { call_ref, wait }))
        .await
        .map_err(|_| CallError::Timeout("join did not settle in time".to_string()))??;
    Ok(respond(outcome))
}

pub async fn leave(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let outcome = state.engine.execute(Command::Leave).await?;
    Ok(respond(outcome))
}

pub async fn play(state: web::Data<AppState>, body: web::Json<PlayRequest>) -> AppResult<HttpResponse> {
    let source = AudioSource::parse(&body.source)?;
    let outcome = state.engine.execute(Command::Play { source }).await?;
    Ok(respond(outcome))
}

pub async fn cancel_job(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let job_id = path.into_inner();
    match state.engine.execute(Command::Cancel { job_id }).await? {
        CommandOutcome::Job(job) => Ok(HttpResponse::Ok().json(job)),
        other => Ok(respond(other)),
    }
}

pub async fn status(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let outcome = state.engine.execute(Command::Status).await?;
    Ok(respond(outcome))
}

/// Record inbound call audio for a few seconds and return it as a WAV file.
///
/// Recording stops early when the call ends; whatever was captured up to
/// then is returned.
pub async fn capture(
    state: web::Data<AppState>,
    body: Option<web::Json<CaptureRequest>>,
) -> AppResult<HttpResponse> {
    let requested = body
        .map(|b| b.into_inner())
        .unwrap_or_default()
        .seconds
        .unwrap_or(DEFAULT_CAPTURE_SECS);
    let seconds = capture_seconds(&state, requested);

    let media = active_media(&state).await?;
    info!(call_id = %media.call_id(), seconds, "Capturing inbound audio");
    let buffer = media.record_inbound(seconds).await?;
    wav_response(HttpResponse::Ok(), &buffer, "capture.wav")
}

/// Play a prompt into the call, then record the answer.
///
/// The prompt is queued like any other play request, so it waits its turn
/// behind jobs already queued. Listening starts once it has played to the end.
pub async fn ask(state: web::Data<AppState>, body: web::Json<AskRequest>) -> AppResult<HttpResponse> {
    let AskRequest {
        source,
        listen_seconds,
    } = body.into_inner();
    let source = AudioSource::parse(&source)?;
    let seconds = capture_seconds(&state, listen_seconds.unwrap_or(DEFAULT_LISTEN_SECS));

    let job = match state.engine.execute(Command::Play { source }).await? {
        CommandOutcome::Job(job) => job,
        _ => return Err(AppError::Internal("unexpected play outcome".to_string())),
    };
    info!(job_id = %job.id, listen_seconds = seconds, "Asking over the call");

    tokio::time::timeout(PROMPT_PLAY_LIMIT, state.engine.wait_for_job(&job.id))
        .await
        .map_err(|_| CallError::Timeout(format!("prompt {} did not finish playing", job.id)))??;
    tokio::time::sleep(ANSWER_SETTLE).await;

    let media = active_media(&state).await?;
    let buffer = media.record_inbound(seconds).await?;
    let mut builder = HttpResponse::Ok();
    builder.insert_header(("X-Prompt-Job", job.id.as_str()));
    wav_response(builder, &buffer, "answer.wav")
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .route("/join", web::post().to(join))
        .route("/leave", web::post().to(leave))
        .route("/play", web::post().to(play))
        .route("/ask", web::post().to(ask))
        .route("/jobs/{id}", web::delete().to(cancel_job))
        .route("/capture", web::post().to(capture))
        .route("/status", web::get().to(status));
}

/// Malformed request bodies get the same JSON error shape as everything else.
fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::BadRequest(err.to_string()).into()
}

fn capture_seconds(state: &AppState, requested: u32) -> u32 {
    requested.clamp(1, state.config.media.max_capture_secs.max(1))
}

async fn active_media(state: &AppState) -> AppResult<MediaHandle> {
    match state.engine.execute(Command::Capture).await? {
        CommandOutcome::Media(media) => Ok(media),
        _ => Err(AppError::Internal("unexpected capture outcome".to_string())),
    }
}

fn wav_response(
    mut builder: HttpResponseBuilder,
    buffer: &CaptureBuffer,
    filename: &str,
) -> AppResult<HttpResponse> {
    debug!(seconds = buffer.duration_seconds(), "Recording finished");
    let wav = buffer
        .to_wav_bytes()
        .map_err(|e| AppError::Internal(format!("failed to encode recording: {}", e)))?;
    Ok(builder
        .content_type("audio/wav")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", filename),
        ))
        .body(wav))
}
