use std::time::Instant;

use serde::{Deserialize, Serialize};

/// One quantum of captured audio, mono f32 samples in [-1.0, 1.0].
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u8,
    pub timestamp: Instant,
    pub is_last: bool,
    pub is_silence: bool,
    pub voice_end: bool,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
            timestamp: Instant::now(),
            is_last: false,
            is_silence: false,
            voice_end: false,
        }
    }

    pub fn sentinel() -> Self {
        Self {
            samples: Vec::new(),
            sample_rate: 16_000,
            channels: 1,
            timestamp: Instant::now(),
            is_last: true,
            is_silence: false,
            voice_end: false,
        }
    }
}

/// A bounded recognition unit: a WAV file on disk plus its ordering metadata.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    pub file_path: std::path::PathBuf,
    pub sequence_number: u64,
    pub timestamp: Instant,
    pub duration_ms: f64,
    pub is_last: bool,
    pub has_overlap: bool,
    pub overlap_ms: i32,
}

/// A finalized recognition result for one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub text: String,
    #[serde(default = "default_sequence")]
    pub sequence_number: i64,
    #[serde(skip, default = "Instant::now")]
    pub timestamp: Instant,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub is_last: bool,
    #[serde(default)]
    pub has_overlap: bool,
    #[serde(default)]
    pub overlap_ms: i32,
}

fn default_sequence() -> i64 {
    -1
}

impl RecognitionResult {
    pub fn parse(json_text: &str, timestamp: Instant) -> Self {
        match serde_json::from_str::<serde_json::Value>(json_text) {
            Ok(value) => {
                let text = value
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or(json_text)
                    .to_string();
                let sequence_number = value
                    .get("sequence")
                    .or_else(|| value.get("sequence_number"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(-1);
                let duration_ms = value.get("duration_ms").and_then(|v| v.as_i64()).unwrap_or(0);
                let is_last = value
                    .get("is_last")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let has_overlap = value
                    .get("has_overlap")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let overlap_ms = value
                    .get("overlap_ms")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as i32;
                Self {
                    text,
                    sequence_number,
                    timestamp,
                    duration_ms,
                    is_last,
                    has_overlap,
                    overlap_ms,
                }
            }
            Err(_) => Self {
                text: json_text.to_string(),
                sequence_number: -1,
                timestamp,
                duration_ms: 0,
                is_last: false,
                has_overlap: false,
                overlap_ms: 0,
            },
        }
    }
}

/// Source of the audio fed into the pipeline for one session.
#[derive(Debug, Clone)]
pub enum AudioSource {
    Microphone { device_name: Option<String> },
    AudioFile { path: std::path::PathBuf },
    VideoFile { path: std::path::PathBuf },
}

/// Outward notification emitted by the orchestrator, replacing the
/// GUI event-emitter back-edge the desktop shell would otherwise need.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Started,
    SegmentReady {
        sequence_number: u64,
    },
    ResultReady {
        text: String,
    },
    MergedTextReady {
        text: String,
    },
    Error(String),
    Stopped,
}
