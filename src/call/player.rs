//! Feeds one audio job into the active call.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CallError;
use crate::media::{AudioSource, MediaHandle, SourceDecoder};

pub struct Playback {
    pub job_id: String,
    pub source: AudioSource,
    pub media: MediaHandle,
    pub decoder: Arc<dyn SourceDecoder>,
    pub cancel: CancellationToken,
    /// Sleep one chunk duration per chunk when set
    pub pacing: Option<Duration>,
}

/// Decode the source and feed it chunk by chunk until it ends, the job is
/// cancelled or the pipeline goes away.
pub async fn play(playback: Playback) -> Result<(), CallError> {
    let Playback {
        job_id,
        source,
        media,
        decoder,
        cancel,
        pacing,
    } = playback;

    let mut reader = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CallError::Cancelled),
        reader = decoder.open(&source) => reader?,
    };

    let mut ticker = pacing.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    let mut chunks = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
            chunk = reader.next_chunk() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk?;

        if let Some(ticker) = ticker.as_mut() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                _ = ticker.tick() => {}
            }
        }
        media.feed(chunk).await?;
        chunks += 1;
    }

    debug!(job_id = %job_id, chunks, "Playback complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::decoder::PcmReader;
    use crate::transport::CallAudio;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Chunks(usize);

    #[async_trait]
    impl SourceDecoder for Chunks {
        async fn open(&self, _source: &AudioSource) -> Result<PcmReader, CallError> {
            Ok(PcmReader::from_chunks(vec![vec![0u8; 320]; self.0]))
        }
    }

    fn start_media() -> (MediaHandle, mpsc::Receiver<Vec<u8>>) {
        let (_in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::channel(64);
        let (fail_tx, _) = mpsc::unbounded_channel();
        let config = crate::config::AppConfig::default().media;
        let media = MediaHandle::start(
            "call-1",
            CallAudio {
                inbound: in_rx,
                outbound: out_tx,
            },
            &config,
            fail_tx,
        )
        .unwrap();
        (media, out_rx)
    }

    #[tokio::test]
    async fn test_plays_every_chunk() {
        let (media, mut out_rx) = start_media();
        play(Playback {
            job_id: "q1".to_string(),
            source: AudioSource::Url("https://media.example/a.ogg".to_string()),
            media,
            decoder: Arc::new(Chunks(5)),
            cancel: CancellationToken::new(),
            pacing: None,
        })
        .await
        .unwrap();

        let mut received = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(200), out_rx.recv()).await
        {
            received += 1;
            if received == 5 {
                break;
            }
        }
        assert_eq!(received, 5);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (media, _out_rx) = start_media();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = play(Playback {
            job_id: "q1".to_string(),
            source: AudioSource::Url("https://media.example/a.ogg".to_string()),
            media,
            decoder: Arc::new(Chunks(5)),
            cancel,
            pacing: Some(Duration::from_millis(20)),
        })
        .await;
        assert_eq!(result, Err(CallError::Cancelled));
    }

    #[tokio::test]
    async fn test_released_pipeline_stops_playback() {
        let (media, _out_rx) = start_media();
        media.release();
        let result = play(Playback {
            job_id: "q1".to_string(),
            source: AudioSource::Url("https://media.example/a.ogg".to_string()),
            media,
            decoder: Arc::new(Chunks(5)),
            cancel: CancellationToken::new(),
            pacing: None,
        })
        .await;
        assert_eq!(result, Err(CallError::NotInCall));
    }
}
