pub mod fast_local;
pub mod openai;
pub mod precise;

use async_trait::async_trait;

use crate::types::AudioSegment;

/// Shared dispatch contract over the three recognition backends. Routing to
/// the active backend is a single match at the orchestrator's
/// segment-ready site.
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn dispatch(&self, segment: AudioSegment) -> anyhow::Result<()>;
}

/// Black-box local transcription function, injected by the caller. Keeps
/// the actual recognition model (whisper-rs or any other engine) out of the
/// dispatch/adapter code's concern.
pub trait LocalTranscriber: Send + Sync {
    fn transcribe(&self, pcm_16k_mono: &[f32], language: &str) -> anyhow::Result<String>;
}
