//! Decoding play sources into raw PCM.
//!
//! A play request names a local file or a stream URL. The configured decoder
//! command (ffmpeg by default) turns it into s16le PCM on stdout, which is
//! read back in whole chunks by [`PcmReader`].

use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use super::pcm::{PcmFormat, Rechunker};
use crate::config::CommandSpec;
use crate::error::CallError;

const STREAM_SCHEMES: [&str; 4] = ["http://", "https://", "rtmp://", "rtmps://"];
const STDERR_TAIL_LINES: usize = 5;

/// Where the audio for a play request comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum AudioSource {
    File(PathBuf),
    Url(String),
}

impl AudioSource {
    /// Accept a stream URL or an existing local file.
    pub fn parse(input: &str) -> Result<Self, CallError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(CallError::InvalidSource("empty source".to_string()));
        }

        let lower = raw.to_ascii_lowercase();
        if STREAM_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return Ok(AudioSource::Url(raw.to_string()));
        }
        if lower.contains("://") {
            return Err(CallError::InvalidSource(format!("unsupported scheme in '{}'", raw)));
        }

        let path = PathBuf::from(raw);
        if path.is_file() {
            Ok(AudioSource::File(path))
        } else {
            Err(CallError::InvalidSource(format!("'{}' is not a readable file", raw)))
        }
    }

    pub fn location(&self) -> String {
        match self {
            AudioSource::File(path) => path.display().to_string(),
            AudioSource::Url(url) => url.clone(),
        }
    }
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location())
    }
}

#[async_trait]
pub trait SourceDecoder: Send + Sync {
    async fn open(&self, source: &AudioSource) -> Result<PcmReader, CallError>;
}

/// A finite stream of PCM chunks.
pub struct PcmReader {
    inner: ReaderInner,
}

enum ReaderInner {
    #[cfg(test)]
    Chunks(VecDeque<Vec<u8>>),
    Process(ProcessReader),
}

struct ProcessReader {
    child: Child,
    stdout: ChildStdout,
    rechunker: Option<Rechunker>,
    pending: VecDeque<Vec<u8>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    done: bool,
}

impl PcmReader {
    /// A reader over pre-decoded chunks.
    #[cfg(test)]
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            inner: ReaderInner::Chunks(chunks.into()),
        }
    }

    /// Next chunk, `None` at the end of the source.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, CallError>> {
        match &mut self.inner {
            #[cfg(test)]
            ReaderInner::Chunks(chunks) => chunks.pop_front().map(Ok),
            ReaderInner::Process(reader) => reader.next_chunk().await,
        }
    }
}

impl ProcessReader {
    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, CallError>> {
        let mut buf = vec![0u8; 8192];
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(Ok(chunk));
            }
            if self.done {
                return None;
            }

            match self.stdout.read(&mut buf).await {
                Ok(0) => {
                    self.done = true;
                    let status = match self.child.wait().await {
                        Ok(status) => status,
                        Err(e) => {
                            return Some(Err(CallError::PipelineFailure(format!(
                                "decoder wait failed: {}",
                                e
                            ))))
                        }
                    };
                    if !status.success() {
                        let tail = self
                            .stderr_tail
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(" | ");
                        return Some(Err(CallError::PipelineFailure(format!(
                            "decoder exited with {}: {}",
                            status, tail
                        ))));
                    }
                    if let Some(rest) = self.rechunker.take().and_then(Rechunker::finish) {
                        self.pending.push_back(rest);
                    }
                }
                Ok(n) => {
                    if let Some(rechunker) = self.rechunker.as_mut() {
                        self.pending.extend(rechunker.push(&buf[..n]));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(CallError::PipelineFailure(format!(
                        "decoder read failed: {}",
                        e
                    ))));
                }
            }
        }
    }
}

/// Runs the configured decoder command once per source.
pub struct CommandDecoder {
    command: CommandSpec,
    format: PcmFormat,
    chunk_bytes: usize,
}

impl CommandDecoder {
    pub fn new(command: CommandSpec, format: PcmFormat, chunk_bytes: usize) -> Self {
        Self {
            command,
            format,
            chunk_bytes,
        }
    }
}

#[async_trait]
impl SourceDecoder for CommandDecoder {
    async fn open(&self, source: &AudioSource) -> Result<PcmReader, CallError> {
        if let AudioSource::File(path) = source {
            if !path.is_file() {
                return Err(CallError::InvalidSource(format!(
                    "'{}' no longer exists",
                    path.display()
                )));
            }
        }

        let location = source.location();
        let args = self.command.render_args(
            Some(&location),
            self.format.sample_rate,
            self.format.channels,
        );
        debug!(program = %self.command.program, source = %location, "Starting decoder");

        let mut child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CallError::PipelineFailure(format!(
                    "failed to spawn decoder '{}': {}",
                    self.command.program, e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallError::PipelineFailure("decoder stdout unavailable".to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        Ok(PcmReader {
            inner: ReaderInner::Process(ProcessReader {
                child,
                stdout,
                rechunker: Some(Rechunker::new(self.format, self.chunk_bytes)),
                pending: VecDeque::new(),
                stderr_tail,
                done: false,
            }),
        })
    }
}
