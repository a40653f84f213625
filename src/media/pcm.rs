//! # Raw PCM Helpers
//!
//! Everything that crosses the media pipeline is signed 16-bit little-endian
//! PCM. This module validates chunks, re-frames arbitrary byte reads into
//! whole-sample chunks, meters levels and turns captured call audio into WAV.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::VecDeque;
use std::io::Cursor;

use crate::config::MediaConfig;

/// Shape of the raw audio exchanged with producers and consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u8,
}

impl PcmFormat {
    /// Size of one frame (one sample per channel) in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * 2
    }

    /// Number of bytes covering `ms` milliseconds of audio.
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        let frames = self.sample_rate as usize * ms as usize / 1000;
        frames * self.frame_bytes()
    }
}

impl From<&MediaConfig> for PcmFormat {
    fn from(config: &MediaConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }
}

/// Check that a chunk is a whole number of frames.
pub fn validate_chunk(data: &[u8], format: PcmFormat) -> Result<(), String> {
    if data.is_empty() {
        return Err("Audio chunk is empty".to_string());
    }
    if data.len() % format.frame_bytes() != 0 {
        return Err(format!(
            "Audio chunk of {} bytes is not a multiple of the {}-byte frame size",
            data.len(),
            format.frame_bytes()
        ));
    }
    Ok(())
}

/// Decode little-endian bytes into samples. A trailing odd byte is ignored.
pub fn decode_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

pub fn silence(format: PcmFormat, ms: u32) -> Vec<u8> {
    vec![0u8; format.bytes_for_ms(ms)]
}

/// Root-mean-square level of a chunk, normalized to `0.0..=1.0`.
pub fn rms_level(data: &[u8]) -> f32 {
    let samples = decode_samples(data);
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Re-frames an arbitrary byte stream into fixed-size chunks.
///
/// Pipes hand out reads of whatever size the kernel had ready; consumers of
/// the pipeline expect whole frames. `push` returns every complete chunk and
/// keeps the remainder, `finish` flushes what is left, trimmed to whole frames.
pub struct Rechunker {
    chunk_bytes: usize,
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl Rechunker {
    pub fn new(format: PcmFormat, chunk_bytes: usize) -> Self {
        let frame_bytes = format.frame_bytes();
        // Never hand out a chunk that splits a frame
        let chunk_bytes = (chunk_bytes / frame_bytes).max(1) * frame_bytes;
        Self {
            chunk_bytes,
            frame_bytes,
            pending: Vec::with_capacity(chunk_bytes * 2),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let mut chunks = Vec::new();
        while self.pending.len() >= self.chunk_bytes {
            let rest = self.pending.split_off(self.chunk_bytes);
            chunks.push(std::mem::replace(&mut self.pending, rest));
        }
        chunks
    }

    pub fn finish(mut self) -> Option<Vec<u8>> {
        let whole = self.pending.len() / self.frame_bytes * self.frame_bytes;
        self.pending.truncate(whole);
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending)
        }
    }
}

/// Bounded recorder for inbound call audio.
///
/// Keeps at most `max_secs` of audio; older samples are discarded as new ones
/// arrive, so a long capture never grows without bound.
#[derive(Debug)]
pub struct CaptureBuffer {
    samples: VecDeque<i16>,
    format: PcmFormat,
    max_samples: usize,
}

impl CaptureBuffer {
    pub fn new(format: PcmFormat, max_secs: u32) -> Self {
        let max_samples = format.sample_rate as usize * format.channels as usize * max_secs as usize;
        Self {
            samples: VecDeque::with_capacity(max_samples.min(1 << 20)),
            format,
            max_samples,
        }
    }

    pub fn append_pcm_data(&mut self, data: &[u8]) {
        for sample in decode_samples(data) {
            self.samples.push_back(sample);
            if self.samples.len() > self.max_samples {
                self.samples.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        let frames = self.samples.len() / self.format.channels.max(1) as usize;
        frames as f64 / self.format.sample_rate as f64
    }

    /// Encode the captured audio as a 16-bit PCM WAV file.
    pub fn to_wav_bytes(&self) -> std::io::Result<Vec<u8>> {
        let header = wav::Header::new(
            wav::header::WAV_FORMAT_PCM,
            self.format.channels as u16,
            self.format.sample_rate,
            16,
        );
        let samples: Vec<i16> = self.samples.iter().copied().collect();
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out)?;
        Ok(out.into_inner())
    }
}
