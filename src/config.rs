use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

fn default_precise_server_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_openai_server_url() -> String {
    "http://127.0.0.1:8082".to_string()
}

fn default_openai_model() -> String {
    "whisper-1".to_string()
}

fn default_language() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    FastLocal,
    PreciseHttp,
    CloudHttp,
}

impl Default for RecognitionMode {
    fn default() -> Self {
        RecognitionMode::FastLocal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    #[serde(default = "default_precise_server_url")]
    pub precise_server_url: String,
    #[serde(default = "default_openai_server_url")]
    pub openai_server_url: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_language")]
    pub language: String,
    pub target_language: Option<String>,
    pub dual_language: bool,
    pub mode: RecognitionMode,
    pub use_gpu: bool,
    pub vad_threshold: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            precise_server_url: default_precise_server_url(),
            openai_server_url: default_openai_server_url(),
            openai_model: default_openai_model(),
            language: default_language(),
            target_language: None,
            dual_language: false,
            mode: RecognitionMode::default(),
            use_gpu: false,
            vad_threshold: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub segment_size_ms: u64,
    pub segment_overlap_ms: u64,
    pub min_speech_segment_ms: u64,
    pub max_silence_ms: u64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            segment_size_ms: 3500,
            segment_overlap_ms: 0,
            min_speech_segment_ms: 3000,
            max_silence_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub use_pre_emphasis: bool,
    pub pre_emphasis_coef: f32,
    pub use_high_pass: bool,
    pub high_pass_cutoff: f32,
    pub use_agc: bool,
    pub target_level: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub attack_time: f32,
    pub release_time: f32,
    pub use_compression: bool,
    pub compression_threshold: f32,
    pub compression_ratio: f32,
    pub use_noise_suppression: bool,
    pub noise_suppression_strength: f32,
    pub noise_suppression_mix_ratio: f32,
    pub use_adaptive_suppression: bool,
    pub vad_energy_threshold: f32,
    pub use_final_gain: bool,
    pub final_gain_factor: f32,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            use_pre_emphasis: true,
            pre_emphasis_coef: 0.97,
            use_high_pass: true,
            high_pass_cutoff: 80.0,
            use_agc: true,
            target_level: 0.2,
            min_gain: 0.5,
            max_gain: 4.0,
            attack_time: 0.01,
            release_time: 0.2,
            use_compression: false,
            compression_threshold: 0.5,
            compression_ratio: 2.0,
            use_noise_suppression: true,
            noise_suppression_strength: 0.7,
            noise_suppression_mix_ratio: 0.3,
            use_adaptive_suppression: false,
            vad_energy_threshold: 0.01,
            use_final_gain: false,
            final_gain_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub mode: u8,
    pub min_voice_frames: u32,
    pub voice_hold_frames: u32,
    pub required_silence_frames: u32,
    pub use_adaptive_threshold: bool,
    pub adaptive_collector_secs: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            mode: 2,
            min_voice_frames: 2,
            voice_hold_frames: 8,
            required_silence_frames: 15,
            use_adaptive_threshold: false,
            adaptive_collector_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub max_parallel_requests: u32,
    pub batch_processing_enabled: bool,
    pub batch_interval_ms: u64,
    pub batch_size: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_parallel_requests: 16,
            batch_processing_enabled: false,
            batch_interval_ms: 500,
            batch_size: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    pub sequential_mode: bool,
    pub max_wait_time_ms: u64,
    pub max_results_before_merge: usize,
    pub merge_delay_ms: u64,
    pub merge_interval_ms: u64,
    pub use_timer_merge: bool,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            sequential_mode: true,
            max_wait_time_ms: 5000,
            max_results_before_merge: 5,
            merge_delay_ms: 2000,
            merge_interval_ms: 500,
            use_timer_merge: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub recognition: RecognitionConfig,
    pub segmentation: SegmentationConfig,
    pub preprocessing: PreprocessingConfig,
    pub vad: VadConfig,
    pub processor: ProcessorConfig,
    pub merger: MergerConfig,
}

impl PipelineConfig {
    /// Load defaults, overlay an optional JSON config file, then overlay
    /// `TRANSCRIBE_<SECTION>_<KEY>` environment variables, and validate.
    pub fn load(file_path: Option<&Path>) -> Result<Self> {
        let mut config = PipelineConfig::default();

        if let Some(path) = file_path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                config = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                log::info!("loaded pipeline config from {}", path.display());
            } else {
                log::warn!("config file {} not found, using defaults", path.display());
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($section:expr, $key:expr, $field:expr, $parse:expr) => {
                if let Ok(raw) = std::env::var(format!("TRANSCRIBE_{}_{}", $section, $key)) {
                    match $parse(&raw) {
                        Ok(value) => $field = value,
                        Err(_) => log::warn!(
                            "ignoring malformed env override TRANSCRIBE_{}_{}={}",
                            $section,
                            $key,
                            raw
                        ),
                    }
                }
            };
        }

        env_override!(
            "SEGMENTATION",
            "SEGMENT_SIZE_MS",
            self.segmentation.segment_size_ms,
            |s: &str| s.parse::<u64>()
        );
        env_override!(
            "SEGMENTATION",
            "MAX_SILENCE_MS",
            self.segmentation.max_silence_ms,
            |s: &str| s.parse::<u64>()
        );
        env_override!(
            "PROCESSOR",
            "MAX_PARALLEL_REQUESTS",
            self.processor.max_parallel_requests,
            |s: &str| s.parse::<u32>()
        );
        env_override!(
            "MERGER",
            "MAX_WAIT_TIME_MS",
            self.merger.max_wait_time_ms,
            |s: &str| s.parse::<u64>()
        );
        env_override!(
            "RECOGNITION",
            "OPENAI_SERVER_URL",
            self.recognition.openai_server_url,
            |s: &str| Ok::<_, std::convert::Infallible>(s.to_string())
        );
        env_override!(
            "RECOGNITION",
            "PRECISE_SERVER_URL",
            self.recognition.precise_server_url,
            |s: &str| Ok::<_, std::convert::Infallible>(s.to_string())
        );
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.processor.max_parallel_requests == 0 {
            return Err(PipelineError::Configuration(
                "processor.max_parallel_requests must be >= 1".into(),
            )
            .into());
        }
        self.processor.max_parallel_requests = self.processor.max_parallel_requests.clamp(1, 20);

        if self.vad.mode > 3 {
            return Err(PipelineError::Configuration(format!(
                "vad.mode must be in 0..=3, got {}",
                self.vad.mode
            ))
            .into());
        }

        if self.segmentation.segment_size_ms == 0 {
            return Err(
                PipelineError::Configuration("segmentation.segment_size_ms must be > 0".into())
                    .into(),
            );
        }
        // Overlap is disabled by design; see the segmentation contract.
        self.segmentation.segment_overlap_ms = 0;

        if self.recognition.openai_server_url.is_empty() {
            return Err(PipelineError::Configuration(
                "recognition.openai_server_url must not be empty".into(),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut config = PipelineConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn max_parallel_requests_clamped() {
        let mut config = PipelineConfig::default();
        config.processor.max_parallel_requests = 99;
        config.validate().unwrap();
        assert_eq!(config.processor.max_parallel_requests, 20);
    }

    #[test]
    fn invalid_vad_mode_rejected() {
        let mut config = PipelineConfig::default();
        config.vad.mode = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overlap_always_forced_zero() {
        let mut config = PipelineConfig::default();
        config.segmentation.segment_overlap_ms = 250;
        config.validate().unwrap();
        assert_eq!(config.segmentation.segment_overlap_ms, 0);
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("TRANSCRIBE_SEGMENTATION_SEGMENT_SIZE_MS", "4200");
        let mut config = PipelineConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.segmentation.segment_size_ms, 4200);
        std::env::remove_var("TRANSCRIBE_SEGMENTATION_SEGMENT_SIZE_MS");
    }
}
