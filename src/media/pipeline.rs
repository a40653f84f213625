//! # Media Pipeline Adapter
//!
//! Bridges one call's audio channels to raw PCM producers and consumers:
//!
//! ```text
//!  feed() ──► [outbound transcoder] ──► forwarder ──► CallAudio.outbound
//!
//!  CallAudio.inbound ──► source pump ──► [inbound transcoder] ──► fan-out ──► read()
//!                                                                   └──────► tap
//! ```
//!
//! Transcoders are optional; without one the direction passes frames through
//! untouched. Each arrow is its own task, so the two directions never wait on
//! each other. Every task stops when the handle is released.
//!
//! A handle is finite and cannot be restarted: once released, `feed` and
//! `read` fail with `NotInCall` and tap subscribers see their stream close.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pcm::{self, CaptureBuffer, PcmFormat};
use super::transcoder::{self, TranscoderParams};
use crate::config::MediaConfig;
use crate::error::CallError;
use crate::transport::CallAudio;

const READ_BUFFER_FRAMES: usize = 256;
const TAP_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// A PCM frame observed on the tap.
#[derive(Debug, Clone)]
pub struct TapFrame {
    pub direction: Direction,
    pub pcm: Arc<Vec<u8>>,
}

/// A transcoder died underneath an active call.
#[derive(Debug, Clone)]
pub struct PipelineFailure {
    pub call_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaStats {
    pub call_id: String,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub dropped_frames: u64,
    pub inbound_level: f32,
    pub released: bool,
}

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    dropped: AtomicU64,
    reader_attached: AtomicBool,
    // f32 bits
    inbound_level: AtomicU32,
}

struct Inner {
    call_id: String,
    format: PcmFormat,
    released: AtomicBool,
    cancel: CancellationToken,
    feed_tx: mpsc::Sender<Vec<u8>>,
    reader: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    tap: Mutex<Option<broadcast::Sender<TapFrame>>>,
    transport_out: Arc<RwLock<mpsc::Sender<Vec<u8>>>>,
    rebinds: mpsc::UnboundedSender<mpsc::Receiver<Vec<u8>>>,
    counters: Arc<Counters>,
}

/// Shared handle to the pipeline of the active call.
#[derive(Clone)]
pub struct MediaHandle {
    inner: Arc<Inner>,
}

impl MediaHandle {
    /// Start both directions for `call_id`.
    ///
    /// Transcoder crashes are reported on `failures`; the engine decides what
    /// happens to the call.
    pub fn start(
        call_id: &str,
        audio: CallAudio,
        config: &MediaConfig,
        failures: mpsc::UnboundedSender<PipelineFailure>,
    ) -> Result<Self, CallError> {
        let format = PcmFormat::from(config);
        let chunk_bytes = config.chunk_bytes();
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let (tap_tx, _) = broadcast::channel(TAP_CAPACITY);

        // Outbound: feed -> [transcoder] -> forwarder -> transport
        let transport_out = Arc::new(RwLock::new(audio.outbound));
        let (encoded_tx, encoded_rx) = mpsc::channel::<Vec<u8>>(64);
        let feed_tx = match &config.outbound_transcoder {
            Some(command) => transcoder::spawn(
                TranscoderParams {
                    command,
                    direction: Direction::Outbound,
                    call_id,
                    format,
                    chunk_bytes,
                },
                encoded_tx,
                failures.clone(),
                cancel.clone(),
            )?,
            None => encoded_tx,
        };
        tokio::spawn(forward_outbound(
            encoded_rx,
            transport_out.clone(),
            cancel.clone(),
        ));

        // Inbound: transport -> pump -> [transcoder] -> fan-out -> reader + tap
        let (decoded_tx, decoded_rx) = mpsc::channel::<Vec<u8>>(64);
        let pump_sink = match &config.inbound_transcoder {
            Some(command) => {
                let input = transcoder::spawn(
                    TranscoderParams {
                        command,
                        direction: Direction::Inbound,
                        call_id,
                        format,
                        chunk_bytes,
                    },
                    decoded_tx,
                    failures,
                    cancel.clone(),
                );
                match input {
                    Ok(input) => input,
                    Err(e) => {
                        cancel.cancel();
                        return Err(e);
                    }
                }
            }
            None => decoded_tx,
        };
        let (rebind_tx, rebind_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_inbound(audio.inbound, rebind_rx, pump_sink, cancel.clone()));

        let (reader_tx, reader_rx) = mpsc::channel(READ_BUFFER_FRAMES);
        tokio::spawn(fan_out(
            decoded_rx,
            reader_tx,
            tap_tx.clone(),
            counters.clone(),
            cancel.clone(),
        ));

        info!(call_id = %call_id, "Media pipeline started");
        Ok(Self {
            inner: Arc::new(Inner {
                call_id: call_id.to_string(),
                format,
                released: AtomicBool::new(false),
                cancel,
                feed_tx,
                reader: tokio::sync::Mutex::new(reader_rx),
                tap: Mutex::new(Some(tap_tx)),
                transport_out,
                rebinds: rebind_tx,
                counters,
            }),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.inner.call_id
    }

    pub fn format(&self) -> PcmFormat {
        self.inner.format
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Send one chunk of raw PCM towards the call.
    pub async fn feed(&self, chunk: Vec<u8>) -> Result<(), CallError> {
        if self.is_released() {
            return Err(CallError::NotInCall);
        }
        pcm::validate_chunk(&chunk, self.inner.format).map_err(CallError::InvalidAudio)?;

        let len = chunk.len() as u64;
        if let Some(tap) = self.tap_sender() {
            if tap.receiver_count() > 0 {
                let _ = tap.send(TapFrame {
                    direction: Direction::Outbound,
                    pcm: Arc::new(chunk.clone()),
                });
            }
        }

        self.inner.feed_tx.send(chunk).await.map_err(|_| {
            if self.is_released() {
                CallError::NotInCall
            } else {
                CallError::PipelineFailure("outbound pipeline closed".to_string())
            }
        })?;

        self.inner.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        self.inner.counters.bytes_out.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Next chunk of raw PCM from the call.
    ///
    /// Fails with `NotInCall` once the pipeline is released or the call's
    /// audio has ended.
    pub async fn read(&self) -> Result<Vec<u8>, CallError> {
        if self.is_released() {
            return Err(CallError::NotInCall);
        }
        self.inner
            .counters
            .reader_attached
            .store(true, Ordering::Relaxed);
        let mut reader = self.inner.reader.lock().await;
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(CallError::NotInCall),
            frame = reader.recv() => frame.ok_or(CallError::NotInCall),
        }
    }

    /// Observe both directions without taking frames from `read`.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<TapFrame>, CallError> {
        self.tap_sender()
            .map(|tap| tap.subscribe())
            .ok_or(CallError::NotInCall)
    }

    /// Record `seconds` of inbound audio from the tap.
    ///
    /// Stops early when the call ends and returns what was heard so far;
    /// fails with `NotInCall` only if the call was already gone.
    pub async fn record_inbound(&self, seconds: u32) -> Result<CaptureBuffer, CallError> {
        let mut tap = self.subscribe()?;
        let mut buffer = CaptureBuffer::new(self.inner.format, seconds);

        let deadline = tokio::time::sleep(Duration::from_secs(seconds as u64));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                frame = tap.recv() => match frame {
                    Ok(frame) if frame.direction == Direction::Inbound => buffer.append_pcm_data(&frame.pcm),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Recording fell behind the tap"),
                    Err(RecvError::Closed) => break,
                }
            }
        }

        if buffer.is_empty() && self.is_released() {
            return Err(CallError::NotInCall);
        }
        Ok(buffer)
    }

    /// Switch to the audio channels of a new transport connection.
    pub fn rebind(&self, audio: CallAudio) -> Result<(), CallError> {
        if self.is_released() {
            return Err(CallError::NotInCall);
        }
        *self
            .inner
            .transport_out
            .write()
            .unwrap_or_else(PoisonError::into_inner) = audio.outbound;
        self.inner
            .rebinds
            .send(audio.inbound)
            .map_err(|_| CallError::NotInCall)?;
        info!(call_id = %self.inner.call_id, "Media pipeline rebound to new connection");
        Ok(())
    }

    /// Stop every task of the pipeline. Safe to call more than once.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner
            .tap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(call_id = %self.inner.call_id, "Media pipeline released");
    }

    pub fn stats(&self) -> MediaStats {
        let c = &self.inner.counters;
        MediaStats {
            call_id: self.inner.call_id.clone(),
            frames_in: c.frames_in.load(Ordering::Relaxed),
            frames_out: c.frames_out.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            dropped_frames: c.dropped.load(Ordering::Relaxed),
            inbound_level: f32::from_bits(c.inbound_level.load(Ordering::Relaxed)),
            released: self.is_released(),
        }
    }

    fn tap_sender(&self) -> Option<broadcast::Sender<TapFrame>> {
        self.inner
            .tap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn forward_outbound(
    mut encoded: mpsc::Receiver<Vec<u8>>,
    transport_out: Arc<RwLock<mpsc::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = encoded.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let out = transport_out
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // A closed transport drops frames until the next rebind
        if out.send(frame).await.is_err() {
            debug!("Outbound frame dropped, transport channel closed");
        }
    }
}

async fn pump_inbound(
    mut source: mpsc::Receiver<Vec<u8>>,
    mut rebinds: mpsc::UnboundedReceiver<mpsc::Receiver<Vec<u8>>>,
    sink: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut source_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rebinds.recv() => match next {
                Some(next) => {
                    source = next;
                    source_open = true;
                }
                None => break,
            },
            frame = source.recv(), if source_open => match frame {
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("Inbound transport channel closed, waiting for rebind");
                    source_open = false;
                }
            },
        }
    }
}

async fn fan_out(
    mut decoded: mpsc::Receiver<Vec<u8>>,
    reader: mpsc::Sender<Vec<u8>>,
    tap: broadcast::Sender<TapFrame>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = decoded.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        counters.frames_in.fetch_add(1, Ordering::Relaxed);
        counters.bytes_in.fetch_add(frame.len() as u64, Ordering::Relaxed);
        counters
            .inbound_level
            .store(pcm::rms_level(&frame).to_bits(), Ordering::Relaxed);

        let frame = Arc::new(frame);
        let _ = tap.send(TapFrame {
            direction: Direction::Inbound,
            pcm: frame.clone(),
        });

        // A full buffer keeps the oldest frames. Drops only count once
        // someone has started reading.
        if reader.try_send(frame.as_ref().clone()).is_err()
            && counters.reader_attached.load(Ordering::Relaxed)
        {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_config() -> MediaConfig {
        MediaConfig {
            sample_rate: 8_000,
            channels: 1,
            ..crate::config::AppConfig::default().media
        }
    }

    struct FakeCall {
        to_service: mpsc::Sender<Vec<u8>>,
        from_service: mpsc::Receiver<Vec<u8>>,
    }

    fn fake_audio() -> (CallAudio, FakeCall) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        (
            CallAudio {
                inbound: in_rx,
                outbound: out_tx,
            },
            FakeCall {
                to_service: in_tx,
                from_service: out_rx,
            },
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_passthrough_both_directions() {
        let (audio, mut call) = fake_audio();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let handle = MediaHandle::start("call-1", audio, &media_config(), fail_tx).unwrap();
        let mut tap = handle.subscribe().unwrap();

        handle.feed(vec![1, 0, 2, 0]).await.unwrap();
        assert_eq!(recv(&mut call.from_service).await, vec![1, 0, 2, 0]);

        call.to_service.send(vec![9, 0]).await.unwrap();
        assert_eq!(handle.read().await.unwrap(), vec![9, 0]);

        let first = tap.recv().await.unwrap();
        assert_eq!(first.direction, Direction::Outbound);
        let second = tap.recv().await.unwrap();
        assert_eq!(second.direction, Direction::Inbound);
        assert_eq!(handle.stats().frames_in, 1);
    }

    #[tokio::test]
    async fn test_record_inbound_stops_when_released() {
        let (audio, call) = fake_audio();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let handle = MediaHandle::start("call-1", audio, &media_config(), fail_tx).unwrap();

        let recorder = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.record_inbound(30).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        call.to_service.send(vec![1, 0, 2, 0]).await.unwrap();
        handle.feed(vec![9, 0]).await.unwrap();
        wait_for_frames(&handle, 1).await;
        handle.release();

        let buffer = tokio::time::timeout(Duration::from_secs(2), recorder)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        // Outbound audio is not part of the recording
        assert_eq!(buffer.duration_seconds(), 2.0 / 8_000.0);
        assert_eq!(handle.record_inbound(1).await.unwrap_err(), CallError::NotInCall);
    }

    #[tokio::test]
    async fn test_feed_rejects_partial_frames() {
        let (audio, _call) = fake_audio();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let handle = MediaHandle::start("call-1", audio, &media_config(), fail_tx).unwrap();
        assert!(matches!(
            handle.feed(vec![1, 2, 3]).await,
            Err(CallError::InvalidAudio(_))
        ));
    }

    #[tokio::test]
    async fn test_release_ends_everything() {
        let (audio, _call) = fake_audio();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let handle = MediaHandle::start("call-1", audio, &media_config(), fail_tx).unwrap();
        let mut tap = handle.subscribe().unwrap();

        handle.release();
        handle.release();

        assert_eq!(handle.feed(vec![0, 0]).await, Err(CallError::NotInCall));
        assert_eq!(handle.read().await, Err(CallError::NotInCall));
        assert!(handle.subscribe().is_err());
        let closed = tokio::time::timeout(Duration::from_secs(2), tap.recv())
            .await
            .unwrap();
        assert!(matches!(closed, Err(broadcast::error::RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_rebind_switches_channels() {
        let (audio, old_call) = fake_audio();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let handle = MediaHandle::start("call-1", audio, &media_config(), fail_tx).unwrap();
        drop(old_call);

        let (audio, mut new_call) = fake_audio();
        handle.rebind(audio).unwrap();

        handle.feed(vec![5, 0]).await.unwrap();
        assert_eq!(recv(&mut new_call.from_service).await, vec![5, 0]);

        new_call.to_service.send(vec![6, 0]).await.unwrap();
        assert_eq!(handle.read().await.unwrap(), vec![6, 0]);
    }

    async fn wait_for_frames(handle: &MediaHandle, frames: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.stats().frames_in < frames {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unread_audio_is_not_counted_as_dropped() {
        let (audio, call) = fake_audio();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let handle = MediaHandle::start("call-1", audio, &media_config(), fail_tx).unwrap();

        let overflow = READ_BUFFER_FRAMES as u64 + 10;
        for _ in 0..overflow {
            call.to_service.send(vec![1, 0]).await.unwrap();
        }
        wait_for_frames(&handle, overflow).await;
        assert_eq!(handle.stats().dropped_frames, 0);

        // Once a reader shows up, overflow is real loss
        assert_eq!(handle.read().await.unwrap(), vec![1, 0]);
        for _ in 0..2 {
            call.to_service.send(vec![2, 0]).await.unwrap();
        }
        wait_for_frames(&handle, overflow + 2).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.stats().dropped_frames == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.stats().dropped_frames, 1);
    }

    #[tokio::test]
    async fn test_transcoder_crash_reported() {
        let (audio, _call) = fake_audio();
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
        let config = MediaConfig {
            inbound_transcoder: Some(crate::config::CommandSpec {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 1".to_string()],
            }),
            ..media_config()
        };
        let _handle = MediaHandle::start("call-9", audio, &config, fail_tx).unwrap();
        let failure = tokio::time::timeout(Duration::from_secs(2), fail_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.call_id, "call-9");
    }
}
