//! A long-running transcoding subprocess for one direction of a call.
//!
//! Frames written to the returned sender are piped to the child's stdin;
//! whatever the child writes to stdout is re-framed into whole PCM chunks and
//! sent on `output`. Writer, reader and exit monitor are separate tasks so a
//! stalled stdout never blocks stdin and vice versa.

use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pcm::{PcmFormat, Rechunker};
use super::pipeline::{Direction, PipelineFailure};
use crate::config::CommandSpec;
use crate::error::CallError;

pub struct TranscoderParams<'a> {
    pub command: &'a CommandSpec,
    pub direction: Direction,
    pub call_id: &'a str,
    pub format: PcmFormat,
    pub chunk_bytes: usize,
}

/// Spawn the transcoder and return the sender feeding its stdin.
pub fn spawn(
    params: TranscoderParams<'_>,
    output: mpsc::Sender<Vec<u8>>,
    failures: mpsc::UnboundedSender<PipelineFailure>,
    cancel: CancellationToken,
) -> Result<mpsc::Sender<Vec<u8>>, CallError> {
    let args = params
        .command
        .render_args(None, params.format.sample_rate, params.format.channels);
    let mut child = Command::new(&params.command.program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            CallError::PipelineFailure(format!(
                "failed to spawn {} transcoder '{}': {}",
                params.direction.as_str(),
                params.command.program,
                e
            ))
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| CallError::PipelineFailure("transcoder stdin unavailable".to_string()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CallError::PipelineFailure("transcoder stdout unavailable".to_string()))?;

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    let direction = params.direction;
    let call_id = params.call_id.to_string();

    // stdin
    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = input_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = stdin.write_all(&frame).await {
                            debug!(direction = direction.as_str(), "Transcoder stdin closed: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    // stdout
    let reader_cancel = cancel.clone();
    let mut rechunker = Rechunker::new(params.format, params.chunk_bytes);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let read = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                read = stdout.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    for chunk in rechunker.push(&buf[..n]) {
                        if output.send(chunk).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!(direction = direction.as_str(), "Transcoder stdout read failed: {}", e);
                    break;
                }
            }
        }
        if let Some(rest) = rechunker.finish() {
            let _ = output.send(rest).await;
        }
    });

    // exit monitor
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                // kill_on_drop takes the child down with this task
                debug!(call_id = %call_id, direction = direction.as_str(), "Transcoder stopped");
            }
            status = child.wait() => {
                if cancel.is_cancelled() {
                    return;
                }
                let reason = match status {
                    Ok(status) => format!("{} transcoder exited with {}", direction.as_str(), status),
                    Err(e) => format!("{} transcoder wait failed: {}", direction.as_str(), e),
                };
                warn!(call_id = %call_id, "{}", reason);
                let _ = failures.send(PipelineFailure { call_id, reason });
            }
        }
    });

    Ok(input_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const FORMAT: PcmFormat = PcmFormat {
        sample_rate: 8_000,
        channels: 1,
    };

    #[tokio::test]
    async fn test_cat_passes_frames_through() {
        let command = CommandSpec {
            program: "cat".to_string(),
            args: Vec::new(),
        };
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let input = spawn(
            TranscoderParams {
                command: &command,
                direction: Direction::Outbound,
                call_id: "call-1",
                format: FORMAT,
                chunk_bytes: 4,
            },
            out_tx,
            fail_tx,
            cancel.clone(),
        )
        .unwrap();

        input.send(vec![1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, vec![1, 2, 3, 4]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_crash_is_reported() {
        let command = CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
        };
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();

        let _input = spawn(
            TranscoderParams {
                command: &command,
                direction: Direction::Inbound,
                call_id: "call-7",
                format: FORMAT,
                chunk_bytes: 320,
            },
            out_tx,
            fail_tx,
            CancellationToken::new(),
        )
        .unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(2), fail_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.call_id, "call-7");
        assert!(failure.reason.contains("inbound"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let command = CommandSpec {
            program: "/nonexistent/transcoder".to_string(),
            args: Vec::new(),
        };
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let result = spawn(
            TranscoderParams {
                command: &command,
                direction: Direction::Outbound,
                call_id: "c",
                format: FORMAT,
                chunk_bytes: 320,
            },
            out_tx,
            fail_tx,
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(CallError::PipelineFailure(_))));
    }
}
