use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::backends::LocalTranscriber;

/// In-process whisper.cpp transcription, the default `LocalTranscriber` for
/// fast-local mode. A single model is loaded eagerly at construction time;
/// `whisper_rs::WhisperState` isn't `Sync`, so each call takes an exclusive
/// lock rather than sharing a state across concurrent dispatches.
pub struct WhisperTranscriber {
    context: WhisperContext,
    beam_size: i32,
    lock: Mutex<()>,
}

impl WhisperTranscriber {
    pub fn load(model_path: &Path, use_gpu: bool) -> Result<Self> {
        if !model_path.exists() {
            return Err(anyhow!("whisper model not found at {}", model_path.display()));
        }
        info!("loading whisper model from {}", model_path.display());

        let params = WhisperContextParameters {
            use_gpu,
            gpu_device: 0,
            flash_attn: false,
            ..Default::default()
        };
        let context = WhisperContext::new_with_params(&model_path.to_string_lossy(), params)
            .with_context(|| format!("loading whisper model {}", model_path.display()))?;

        Ok(Self {
            context,
            beam_size: 5,
            lock: Mutex::new(()),
        })
    }

    pub fn default_model_dir() -> PathBuf {
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxstream")
            .join("models")
    }
}

impl LocalTranscriber for WhisperTranscriber {
    fn transcribe(&self, pcm_16k_mono: &[f32], language: &str) -> Result<String> {
        let _guard = self.lock.lock().unwrap();

        let mut params = FullParams::new(SamplingStrategy::BeamSearch {
            beam_size: self.beam_size,
            patience: 1.0,
        });
        if language != "auto" {
            params.set_language(Some(language));
        }
        params.set_translate(false);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_suppress_blank(true);
        params.set_suppress_nst(true);
        params.set_temperature(0.4);
        params.set_entropy_thold(2.4);
        params.set_logprob_thold(-1.0);
        params.set_no_speech_thold(0.6);
        params.set_max_len(224);
        params.set_single_segment(false);

        let mut state = self.context.create_state().context("creating whisper decode state")?;
        state
            .full(params, pcm_16k_mono)
            .context("running whisper inference")?;

        let num_segments = state.full_n_segments().context("reading segment count")?;
        let mut text = String::new();
        for i in 0..num_segments {
            let segment = state.full_get_segment_text(i).context("reading segment text")?;
            let trimmed = segment.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(trimmed);
        }

        debug!("whisper produced {} chars across {} segments", text.len(), num_segments);
        Ok(text.trim().to_string())
    }
}
