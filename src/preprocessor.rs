use log::{debug, warn};
use nnnoiseless::DenoiseState;
use realfft::num_complex::Complex32;
use realfft::RealFftPlanner;

use crate::config::PreprocessingConfig;

/// Single-pass DSP chain applied in place to one frame at a time. Persistent
/// per-stage state (high-pass memory, AGC gain) lives on this struct so one
/// instance can be reused across an entire session.
pub struct AudioPreprocessor {
    config: PreprocessingConfig,
    pre_emphasis_prev: f32,
    high_pass_prev_in: f32,
    high_pass_prev_out: f32,
    agc_gain: f32,
    denoiser: Option<Box<DenoiseState<'static>>>,
}

impl AudioPreprocessor {
    pub fn new(config: PreprocessingConfig) -> Self {
        let denoiser = if config.use_noise_suppression {
            Some(DenoiseState::new())
        } else {
            None
        };
        Self {
            config,
            pre_emphasis_prev: 0.0,
            high_pass_prev_in: 0.0,
            high_pass_prev_out: 0.0,
            agc_gain: 1.0,
            denoiser,
        }
    }

    /// Clear all persistent filter state without discarding configuration.
    pub fn reset(&mut self) {
        self.pre_emphasis_prev = 0.0;
        self.high_pass_prev_in = 0.0;
        self.high_pass_prev_out = 0.0;
        self.agc_gain = 1.0;
        if self.config.use_noise_suppression {
            self.denoiser = Some(DenoiseState::new());
        }
    }

    pub fn process(&mut self, samples: &mut [f32], sample_rate: u32) {
        if self.config.use_pre_emphasis {
            self.apply_pre_emphasis(samples);
        }
        if self.config.use_high_pass {
            self.apply_high_pass(samples, sample_rate);
        }
        if self.config.use_agc {
            self.apply_agc(samples);
        }
        if self.config.use_compression {
            self.apply_compression(samples);
        }
        if self.config.use_noise_suppression {
            self.apply_noise_suppression(samples);
        }
        if self.config.use_final_gain {
            apply_final_gain(samples, self.config.final_gain_factor);
        }
    }

    fn apply_pre_emphasis(&mut self, samples: &mut [f32]) {
        let alpha = self.config.pre_emphasis_coef.clamp(0.0, 0.99);
        let input_rms = rms(samples);

        let mut prev = self.pre_emphasis_prev;
        for sample in samples.iter_mut() {
            let current = *sample;
            *sample = current - alpha * prev;
            prev = current;
        }
        self.pre_emphasis_prev = prev;

        // Compensate energy loss: keep output RMS within [0.5x, 2x] of input RMS.
        if input_rms > 1e-6 {
            let output_rms = rms(samples);
            if output_rms > 1e-6 {
                let ratio = input_rms / output_rms;
                let scale = ratio.clamp(0.5, 2.0);
                if (scale - 1.0).abs() > 1e-3 {
                    for sample in samples.iter_mut() {
                        *sample = (*sample * scale).clamp(-1.0, 1.0);
                    }
                }
            }
        }
    }

    fn apply_high_pass(&mut self, samples: &mut [f32], sample_rate: u32) {
        let cutoff = self.config.high_pass_cutoff.max(1.0);
        let dt = 1.0 / sample_rate as f32;
        let rc = 1.0 / (std::f32::consts::TAU * cutoff);
        let alpha = rc / (rc + dt);

        let mut prev_in = self.high_pass_prev_in;
        let mut prev_out = self.high_pass_prev_out;
        for sample in samples.iter_mut() {
            let input = *sample;
            let output = alpha * (prev_out + input - prev_in);
            *sample = output;
            prev_in = input;
            prev_out = output;
        }
        self.high_pass_prev_in = prev_in;
        self.high_pass_prev_out = prev_out;
    }

    fn apply_agc(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }
        let level = rms(samples).max(1e-6);
        let desired_gain = (self.config.target_level / level)
            .clamp(self.config.min_gain, self.config.max_gain);

        let smoothing = if desired_gain > self.agc_gain {
            self.config.attack_time
        } else {
            self.config.release_time
        }
        .clamp(0.0, 1.0);

        self.agc_gain = smoothing * desired_gain + (1.0 - smoothing) * self.agc_gain;

        for sample in samples.iter_mut() {
            *sample = (*sample * self.agc_gain).clamp(-1.0, 1.0);
        }
    }

    fn apply_compression(&self, samples: &mut [f32]) {
        let threshold = self.config.compression_threshold;
        let ratio = self.config.compression_ratio.max(1.0);
        for sample in samples.iter_mut() {
            let sign = sample.signum();
            let magnitude = sample.abs();
            if magnitude > threshold {
                let excess = magnitude - threshold;
                *sample = sign * (threshold + excess / ratio);
            }
        }
    }

    fn apply_noise_suppression(&mut self, samples: &mut [f32]) {
        let Some(denoiser) = self.denoiser.as_mut() else {
            return;
        };
        let frame_size = DenoiseState::FRAME_SIZE;
        let mut mix_ratio = self.config.noise_suppression_mix_ratio.clamp(0.0, 1.0);
        let original_rms = rms(samples);

        // nnnoiseless's native frame is 480 samples at 48kHz; resample in and back out.
        let resampled = match crate::capture::resample_to(samples, 16_000, 48_000) {
            Ok(out) => out,
            Err(e) => {
                warn!("noise suppression resample to 48kHz failed, skipping stage: {}", e);
                return;
            }
        };
        let mut processed = vec![0.0f32; resampled.len()];
        let mut chunk_in = vec![0.0f32; frame_size];
        let mut chunk_out = vec![0.0f32; frame_size];
        let mut vad_prob_sum = 0.0f32;
        let mut vad_prob_count = 0u32;

        for (chunk_idx, chunk) in resampled.chunks(frame_size).enumerate() {
            // nnnoiseless expects 16-bit PCM range, not normalized [-1.0, 1.0].
            for (i, &sample) in chunk.iter().enumerate() {
                chunk_in[i] = sample * 32767.0;
            }
            for slot in chunk_in[chunk.len()..].iter_mut() {
                *slot = 0.0;
            }

            let vad_prob = denoiser.process_frame(&mut chunk_out, &chunk_in);
            vad_prob_sum += vad_prob;
            vad_prob_count += 1;

            let start = chunk_idx * frame_size;
            let end = (start + chunk.len()).min(processed.len());
            for (i, dst) in processed[start..end].iter_mut().enumerate() {
                *dst = (chunk_out[i] / 32767.0).clamp(-1.0, 1.0);
            }
        }
        let back = match crate::capture::resample_to(&processed, 48_000, 16_000) {
            Ok(out) => out,
            Err(e) => {
                warn!("noise suppression resample to 16kHz failed, skipping stage: {}", e);
                return;
            }
        };
        let len = samples.len().min(back.len());

        if self.config.use_adaptive_suppression && vad_prob_count > 0 {
            // Lower average speech probability -> trust the denoised signal more.
            let avg_prob = vad_prob_sum / vad_prob_count as f32;
            mix_ratio = (mix_ratio * avg_prob).clamp(0.0, 1.0);
        }

        for i in 0..len {
            let mut mixed = mix_ratio * samples[i] + (1.0 - mix_ratio) * back[i];
            // Bias toward the original if suppression drove level below a VAD-relevant floor.
            if original_rms > self.config.vad_energy_threshold && mixed.abs() < original_rms * 0.1 {
                mixed = 0.5 * mixed + 0.5 * samples[i];
            }
            samples[i] = mixed.clamp(-1.0, 1.0);
        }
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
}

fn apply_final_gain(samples: &mut [f32], factor: f32) {
    for sample in samples.iter_mut() {
        *sample = (*sample * factor).clamp(-1.0, 1.0);
    }
}

/// Spectral-subtraction noise suppression path, used when the neural
/// denoiser is disabled or unavailable. Grounded in the FFT-domain
/// subtraction approach applied to fixed 100ms windows at 16kHz.
pub fn spectral_subtraction(audio: &[f32], strength: f32) -> anyhow::Result<Vec<f32>> {
    if audio.is_empty() {
        return Ok(Vec::new());
    }
    let window_size = 1600usize;
    let mut planner = RealFftPlanner::<f32>::new();

    let processed = if audio.len() > window_size {
        warn!(
            "spectral_subtraction: input {} samples exceeds window {}, truncating",
            audio.len(),
            window_size
        );
        &audio[..window_size]
    } else {
        audio
    };

    let r2c = planner.plan_fft_forward(window_size);
    let mut spectrum = r2c.make_output_vec();
    let mut padded = processed.to_vec();
    padded.resize(window_size, 0.0);
    r2c.process(&mut padded, &mut spectrum)?;

    let noise_floor = estimate_noise_floor(&spectrum);
    for bin in spectrum.iter_mut() {
        let magnitude = bin.norm();
        let reduced = (magnitude - strength * noise_floor).max(0.0);
        if magnitude > 1e-9 {
            *bin = *bin * (reduced / magnitude);
        }
    }

    let c2r = planner.plan_fft_inverse(window_size);
    let mut output = c2r.make_output_vec();
    c2r.process(&mut spectrum, &mut output)?;
    let norm = 1.0 / window_size as f32;
    for sample in output.iter_mut() {
        *sample *= norm;
    }
    output.truncate(audio.len().min(window_size));
    debug!("spectral_subtraction produced {} samples", output.len());
    Ok(output)
}

fn estimate_noise_floor(spectrum: &[Complex32]) -> f32 {
    if spectrum.is_empty() {
        return 0.0;
    }
    let mut magnitudes: Vec<f32> = spectrum.iter().map(|c| c.norm()).collect();
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap());
    magnitudes[magnitudes.len() / 4]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_tone(len: usize, freq: f32, sample_rate: f32, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin() * amplitude)
            .collect()
    }

    #[test]
    fn pre_emphasis_keeps_rms_in_bounds() {
        let mut config = PreprocessingConfig::default();
        config.use_high_pass = false;
        config.use_agc = false;
        config.use_compression = false;
        config.use_noise_suppression = false;
        config.use_final_gain = false;
        let mut pre = AudioPreprocessor::new(config);

        let mut samples = sine_tone(1600, 440.0, 16_000.0, 0.5);
        let input_rms = rms(&samples);
        pre.process(&mut samples, 16_000);
        let output_rms = rms(&samples);

        assert!(output_rms >= 0.5 * input_rms);
        assert!(output_rms <= 2.0 * input_rms);
    }

    #[test]
    fn reset_clears_persistent_state() {
        let mut config = PreprocessingConfig::default();
        config.use_noise_suppression = false;
        let mut pre = AudioPreprocessor::new(config);
        let mut samples = sine_tone(320, 200.0, 16_000.0, 0.8);
        pre.process(&mut samples, 16_000);
        assert_ne!(pre.agc_gain, 1.0);
        pre.reset();
        assert_eq!(pre.agc_gain, 1.0);
        assert_eq!(pre.high_pass_prev_in, 0.0);
    }

    #[test]
    fn high_pass_attenuates_dc_offset() {
        let mut config = PreprocessingConfig::default();
        config.use_pre_emphasis = false;
        config.use_agc = false;
        config.use_compression = false;
        config.use_noise_suppression = false;
        config.use_final_gain = false;
        let mut pre = AudioPreprocessor::new(config);

        let mut samples = vec![0.3f32; 800];
        pre.process(&mut samples, 16_000);
        // After settling, a 1-pole high-pass should drive a constant input toward zero.
        assert!(samples.last().unwrap().abs() < 0.3);
    }

    #[test]
    fn spectral_subtraction_preserves_length() {
        let samples = sine_tone(1600, 300.0, 16_000.0, 0.3);
        let out = spectral_subtraction(&samples, 1.0).unwrap();
        assert_eq!(out.len(), samples.len());
    }
}
