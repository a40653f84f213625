//! # Audio Queue
//!
//! Strict FIFO of play requests for the current call. At most one job plays
//! at a time; the engine asks for the next job when the call becomes active
//! and whenever the playing job finishes, so an empty queue costs nothing.
//!
//! Cancellation is cooperative: a queued job is removed at once, a playing
//! job has its token cancelled and the player stops between chunks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CallError;
use crate::media::AudioSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Playing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Playing => "playing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    /// The error a caller waiting on the job should see.
    pub fn to_call_error(&self) -> CallError {
        match self.code {
            "call_ended" => CallError::CallEnded,
            "cancelled" => CallError::Cancelled,
            "not_in_call" => CallError::NotInCall,
            _ => CallError::PipelineFailure(self.message.clone()),
        }
    }
}

impl From<&CallError> for JobError {
    fn from(err: &CallError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioJob {
    pub id: String,
    pub source: AudioSource,
    pub position: u64,
    pub status: JobStatus,
    pub error: Option<JobError>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AudioJob {
    fn fail(&mut self, err: &CallError) {
        self.status = JobStatus::Failed;
        self.error = Some(JobError::from(err));
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub playing: Option<AudioJob>,
    pub pending: Vec<AudioJob>,
    pub history: Vec<AudioJob>,
}

struct PlayingJob {
    job: AudioJob,
    cancel: CancellationToken,
}

pub struct AudioQueue {
    pending: VecDeque<AudioJob>,
    playing: Option<PlayingJob>,
    history: VecDeque<AudioJob>,
    max_pending: usize,
    history_limit: usize,
    next_position: u64,
}

impl AudioQueue {
    pub fn new(max_pending: usize, history_limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            playing: None,
            history: VecDeque::new(),
            max_pending,
            history_limit,
            next_position: 1,
        }
    }

    pub fn enqueue(&mut self, source: AudioSource) -> Result<AudioJob, CallError> {
        if self.pending.len() >= self.max_pending {
            return Err(CallError::QueueFull(self.pending.len()));
        }
        let position = self.next_position;
        self.next_position += 1;
        let job = AudioJob {
            id: format!("q{}", position),
            source,
            position,
            status: JobStatus::Queued,
            error: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        info!(job_id = %job.id, source = %job.source, "Audio job queued");
        self.pending.push_back(job.clone());
        Ok(job)
    }

    /// Promote the oldest queued job, unless one is already playing.
    pub fn start_next(&mut self) -> Option<(AudioJob, CancellationToken)> {
        if self.playing.is_some() {
            return None;
        }
        let mut job = self.pending.pop_front()?;
        job.status = JobStatus::Playing;
        job.started_at = Some(Utc::now());
        let cancel = CancellationToken::new();
        info!(job_id = %job.id, "Audio job playing");
        self.playing = Some(PlayingJob {
            job: job.clone(),
            cancel: cancel.clone(),
        });
        Some((job, cancel))
    }

    /// Record the outcome of the playing job and free the slot.
    ///
    /// Outcomes for jobs that are no longer playing (drained or superseded)
    /// are ignored.
    pub fn finish(&mut self, job_id: &str, result: Result<(), CallError>) -> Option<AudioJob> {
        if self.playing.as_ref().map(|p| p.job.id.as_str()) != Some(job_id) {
            debug!(job_id = %job_id, "Ignoring outcome of a job that is not playing");
            return None;
        }
        let PlayingJob { mut job, .. } = self.playing.take()?;
        if job.status == JobStatus::Playing {
            match result {
                Ok(()) => {
                    job.status = JobStatus::Done;
                    job.finished_at = Some(Utc::now());
                }
                Err(err) => job.fail(&err),
            }
        }
        info!(job_id = %job.id, status = job.status.as_str(), "Audio job finished");
        self.remember(job.clone());
        Some(job)
    }

    pub fn cancel(&mut self, job_id: &str) -> Result<AudioJob, CallError> {
        if let Some(index) = self.pending.iter().position(|j| j.id == job_id) {
            if let Some(mut job) = self.pending.remove(index) {
                job.fail(&CallError::Cancelled);
                info!(job_id = %job.id, "Queued audio job cancelled");
                self.remember(job.clone());
                return Ok(job);
            }
        }

        if let Some(playing) = self.playing.as_mut() {
            if playing.job.id == job_id {
                if playing.job.status != JobStatus::Playing {
                    return Err(CallError::JobFinished(job_id.to_string()));
                }
                playing.cancel.cancel();
                playing.job.fail(&CallError::Cancelled);
                info!(job_id = %job_id, "Playing audio job cancelled");
                return Ok(playing.job.clone());
            }
        }

        if self.history.iter().any(|j| j.id == job_id) {
            return Err(CallError::JobFinished(job_id.to_string()));
        }
        Err(CallError::JobNotFound(job_id.to_string()))
    }

    /// Fail every queued and playing job with `CallEnded`.
    pub fn drain(&mut self) -> Vec<AudioJob> {
        let mut drained = Vec::new();
        if let Some(PlayingJob { mut job, cancel }) = self.playing.take() {
            cancel.cancel();
            if job.status == JobStatus::Playing {
                job.fail(&CallError::CallEnded);
            }
            drained.push(job);
        }
        while let Some(mut job) = self.pending.pop_front() {
            job.fail(&CallError::CallEnded);
            drained.push(job);
        }
        for job in &drained {
            self.remember(job.clone());
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Audio queue drained");
        }
        drained
    }

    /// Jobs waiting plus the one playing.
    pub fn depth(&self) -> usize {
        self.pending.len() + usize::from(self.playing.is_some())
    }

    pub fn get(&self, job_id: &str) -> Option<AudioJob> {
        self.playing
            .as_ref()
            .map(|p| &p.job)
            .into_iter()
            .chain(self.pending.iter())
            .chain(self.history.iter().rev())
            .find(|j| j.id == job_id)
            .cloned()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            playing: self.playing.as_ref().map(|p| p.job.clone()),
            pending: self.pending.iter().cloned().collect(),
            history: self.history.iter().cloned().collect(),
        }
    }

    fn remember(&mut self, job: AudioJob) {
        if self.history_limit == 0 {
            return;
        }
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(job);
    }
}
