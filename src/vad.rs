use std::collections::VecDeque;

use crate::config::VadConfig;

const WINDOW_SAMPLES: usize = 320; // 20ms at 16kHz

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Voice,
}

/// Classifies short frames as voice/silence with hysteresis, tracks a
/// one-shot voice-end edge, and optionally adapts its energy threshold from
/// a rolling collection window.
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: State,
    voice_counter: u32,
    silence_counter: u32,
    window_history: VecDeque<bool>,
    voice_end_pending: bool,
    threshold: f32,
    adaptive_ready: bool,
    adaptive_energy_sum: f64,
    adaptive_samples_seen: u64,
    adaptive_target_samples: u64,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let initial_threshold = mode_threshold(config.mode);
        let adaptive_target_samples = config.adaptive_collector_secs * 16_000;
        Self {
            config,
            state: State::Idle,
            voice_counter: 0,
            silence_counter: 0,
            window_history: VecDeque::with_capacity(64),
            voice_end_pending: false,
            threshold: initial_threshold,
            adaptive_ready: false,
            adaptive_energy_sum: 0.0,
            adaptive_samples_seen: 0,
            adaptive_target_samples,
        }
    }

    /// Classify a frame (any length, resampled to 16kHz by the caller) and
    /// update internal hysteresis state. Returns the latched voice/silence
    /// state, not the raw windowed classification.
    pub fn detect(&mut self, frame: &[f32]) -> bool {
        self.accumulate_adaptive_threshold(frame);

        let mut any_voice_window = false;
        for window in frame.chunks(WINDOW_SAMPLES) {
            let is_voice_window = energy(window) >= self.threshold;
            any_voice_window |= is_voice_window;
            self.push_window_history(is_voice_window);
        }

        if any_voice_window {
            self.voice_counter += 1;
            self.silence_counter = 0;
        } else {
            self.silence_counter += 1;
            self.voice_counter = 0;
        }

        match self.state {
            State::Idle => {
                if self.voice_counter >= self.config.min_voice_frames {
                    self.state = State::Voice;
                }
            }
            State::Voice => {
                if self.silence_counter > self.config.voice_hold_frames {
                    self.state = State::Idle;
                }
            }
        }

        let is_voice = self.state == State::Voice;
        self.update_voice_end_detection(is_voice);
        is_voice
    }

    fn push_window_history(&mut self, is_voice_window: bool) {
        self.window_history.push_back(is_voice_window);
        let cap = (self.config.required_silence_frames as usize + 8).max(16);
        while self.window_history.len() > cap {
            self.window_history.pop_front();
        }
    }

    fn update_voice_end_detection(&mut self, is_voice: bool) {
        if is_voice {
            return;
        }
        let required = self.config.required_silence_frames as usize;
        if self.window_history.len() < required {
            return;
        }
        let trailing_silent = self
            .window_history
            .iter()
            .rev()
            .take(required)
            .all(|&w| !w);
        let has_prior_voice = self
            .window_history
            .iter()
            .rev()
            .skip(required)
            .take(3)
            .any(|&w| w);
        if trailing_silent && has_prior_voice {
            self.voice_end_pending = true;
        }
    }

    /// One-shot edge read: true once per voice->silence transition meeting
    /// the configured silence run length, then auto-resets.
    pub fn has_voice_ended_detected(&mut self) -> bool {
        let fired = self.voice_end_pending;
        self.voice_end_pending = false;
        fired
    }

    pub fn reset_voice_end_detection(&mut self) {
        self.voice_end_pending = false;
    }

    /// Clear frame counters, rolling silence history, and the one-shot
    /// voice-end flag. Does not discard an already-computed adaptive threshold.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.voice_counter = 0;
        self.silence_counter = 0;
        self.window_history.clear();
        self.voice_end_pending = false;
    }

    fn accumulate_adaptive_threshold(&mut self, frame: &[f32]) {
        if !self.config.use_adaptive_threshold || self.adaptive_ready {
            return;
        }
        self.adaptive_energy_sum += frame.iter().map(|&s| (s * s) as f64).sum::<f64>();
        self.adaptive_samples_seen += frame.len() as u64;
        if self.adaptive_samples_seen >= self.adaptive_target_samples {
            let mean_energy = (self.adaptive_energy_sum / self.adaptive_samples_seen as f64).sqrt();
            self.threshold = (0.8 * mean_energy as f32).clamp(0.005, 0.1);
            self.adaptive_ready = true;
            log::info!(
                "VAD adaptive threshold ready after {} samples: {:.5}",
                self.adaptive_samples_seen,
                self.threshold
            );
        }
    }
}

fn mode_threshold(mode: u8) -> f32 {
    match mode {
        0 => 0.04,
        1 => 0.025,
        2 => 0.015,
        _ => 0.008,
    }
}

fn energy(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    (window.iter().map(|&x| x * x).sum::<f32>() / window.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_frame(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 0.3).sin() * amplitude)
            .collect()
    }

    fn silence_frame(len: usize) -> Vec<f32> {
        vec![0.0; len]
    }

    #[test]
    fn transitions_idle_to_voice_after_min_frames() {
        let mut config = VadConfig::default();
        config.min_voice_frames = 2;
        let mut vad = VoiceActivityDetector::new(config);

        assert!(!vad.detect(&tone_frame(WINDOW_SAMPLES, 0.3)));
        assert!(vad.detect(&tone_frame(WINDOW_SAMPLES, 0.3)));
    }

    #[test]
    fn returns_to_idle_after_hold_frames_of_silence() {
        let mut config = VadConfig::default();
        config.min_voice_frames = 1;
        config.voice_hold_frames = 2;
        let mut vad = VoiceActivityDetector::new(config);

        assert!(vad.detect(&tone_frame(WINDOW_SAMPLES, 0.3)));
        assert!(vad.detect(&silence_frame(WINDOW_SAMPLES))); // still within hold
        assert!(vad.detect(&silence_frame(WINDOW_SAMPLES))); // still within hold
        assert!(!vad.detect(&silence_frame(WINDOW_SAMPLES))); // exceeded hold
    }

    #[test]
    fn voice_end_is_one_shot() {
        let mut config = VadConfig::default();
        config.min_voice_frames = 1;
        config.voice_hold_frames = 1;
        config.required_silence_frames = 2;
        let mut vad = VoiceActivityDetector::new(config);

        vad.detect(&tone_frame(WINDOW_SAMPLES, 0.3));
        vad.detect(&silence_frame(WINDOW_SAMPLES));
        vad.detect(&silence_frame(WINDOW_SAMPLES));

        assert!(vad.has_voice_ended_detected());
        assert!(!vad.has_voice_ended_detected());
    }

    #[test]
    fn reset_clears_counters_but_keeps_threshold() {
        let mut config = VadConfig::default();
        config.use_adaptive_threshold = false;
        let mut vad = VoiceActivityDetector::new(config);
        vad.detect(&tone_frame(WINDOW_SAMPLES, 0.3));
        let threshold_before = vad.threshold;
        vad.reset();
        assert_eq!(vad.state, State::Idle);
        assert_eq!(vad.threshold, threshold_before);
    }
}
