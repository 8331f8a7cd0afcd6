//! Streaming speech recognition pipeline: capture, voice-activity gating,
//! bounded-duration segmentation, and parallel dispatch to one of several
//! recognition backends with sequence-ordered result merging.

pub mod backends;
pub mod capture;
pub mod config;
pub mod dedup;
pub mod error;
pub mod file_input;
pub mod merger;
pub mod orchestrator;
pub mod preprocessor;
pub mod queue;
pub mod segment_handler;
pub mod types;
pub mod vad;
pub mod wav;
pub mod whisper_transcriber;

pub use config::{PipelineConfig, RecognitionMode};
pub use error::PipelineError;
pub use orchestrator::AudioProcessor;
pub use types::{AudioFrame, AudioSegment, AudioSource, PipelineEvent, RecognitionResult};
