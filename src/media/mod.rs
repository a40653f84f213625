//! Raw audio plumbing: PCM helpers, transcoding subprocesses, source
//! decoding and the per-call media pipeline.

pub mod decoder;
pub mod pcm;
pub mod pipeline;
pub mod transcoder;

pub use decoder::{AudioSource, CommandDecoder, SourceDecoder};
pub use pcm::{CaptureBuffer, PcmFormat};
pub use pipeline::{Direction, MediaHandle, MediaStats, PipelineFailure, TapFrame};
