use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, error};
use serde_json::json;
use tokio::sync::mpsc;

use super::{LocalTranscriber, RecognitionBackend};
use crate::types::AudioSegment;
use crate::wav;

/// Adapter dispatching a segment's decoded PCM to an injected black-box
/// `LocalTranscriber`. Decoding and transcription run on a blocking task so
/// the caller (typically the capture/segmenter task) is never blocked.
pub struct FastLocalBackend {
    transcriber: Arc<dyn LocalTranscriber>,
    language: String,
    result_sender: mpsc::UnboundedSender<(String, Instant)>,
}

impl FastLocalBackend {
    pub fn new(
        transcriber: Arc<dyn LocalTranscriber>,
        language: String,
        result_sender: mpsc::UnboundedSender<(String, Instant)>,
    ) -> Self {
        Self {
            transcriber,
            language,
            result_sender,
        }
    }
}

#[async_trait]
impl RecognitionBackend for FastLocalBackend {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn dispatch(&self, segment: AudioSegment) -> anyhow::Result<()> {
        let transcriber = self.transcriber.clone();
        let language = self.language.clone();
        let path = segment.file_path.clone();
        let seq = segment.sequence_number;
        let is_last = segment.is_last;

        let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
            let (samples, _rate) = wav::decode_file(&path)?;
            transcriber.transcribe(&samples, &language)
        })
        .await;

        let text = match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                error!("fast-local transcription failed for segment {}: {}", seq, e);
                return Err(e);
            }
            Err(join_err) => {
                error!("fast-local transcription task panicked for segment {}: {}", seq, join_err);
                return Err(join_err.into());
            }
        };

        debug!("fast-local produced {} chars for segment {}", text.len(), seq);
        let payload = json!({
            "text": text,
            "sequence": seq,
            "is_last": is_last,
        })
        .to_string();

        let _ = self.result_sender.send((payload, Instant::now()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct EchoTranscriber;
    impl LocalTranscriber for EchoTranscriber {
        fn transcribe(&self, pcm: &[f32], _language: &str) -> anyhow::Result<String> {
            Ok(format!("{} samples", pcm.len()))
        }
    }

    #[tokio::test]
    async fn dispatch_sends_result_for_valid_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wav");
        wav::encode_to_file(&vec![0.1f32; 1600], &path).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = FastLocalBackend::new(Arc::new(EchoTranscriber), "auto".into(), tx);

        let segment = AudioSegment {
            file_path: path,
            sequence_number: 3,
            timestamp: Instant::now(),
            duration_ms: 100.0,
            is_last: false,
            has_overlap: false,
            overlap_ms: 0,
        };
        backend.dispatch(segment).await.unwrap();

        let (payload, _ts) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(payload.contains("\"sequence\":3"));
    }
}
