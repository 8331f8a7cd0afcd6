use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::types::AudioFrame;
use crate::wav;

const SAMPLE_RATE: usize = 16_000;
const NATURAL_PAUSE_MS: usize = 100;
const LONG_SILENCE_MS: usize = 300;
const PADDING_MS: usize = 200;
const STALL_FORCE_MS: u128 = 5000;
const PARTIAL_FORCE_MS: u128 = 2500;
const PARTIAL_FORCE_FRACTION: f64 = 0.5;

/// A segment emitted by the handler, ready for dispatch to a recognition backend.
pub type SegmentReadyCallback = Box<dyn FnMut(crate::types::AudioSegment) + Send>;

/// Converts a stream of `AudioFrame`s into bounded `AudioSegment`s written to
/// disk, under hybrid length/silence/timeout emission rules.
pub struct RealtimeSegmentHandler {
    temp_dir: PathBuf,
    own_temp_dir: bool,
    target_samples: usize,
    running: bool,
    current_frames: Vec<f32>,
    silence_frames: Vec<f32>,
    total_samples: usize,
    last_segment_time: Instant,
    sequence_counter: u64,
    callback: Option<SegmentReadyCallback>,
    buffer_pool_size: usize,
    immediate_processing: bool,
    openai_mode: bool,
}

impl RealtimeSegmentHandler {
    pub fn new(segment_size_ms: u64, temp_dir: Option<PathBuf>) -> Result<Self> {
        let (temp_dir, own_temp_dir) = match temp_dir {
            Some(dir) => (dir, false),
            None => {
                let dir = std::env::temp_dir().join(format!("openai_segments_{}", Uuid::new_v4()));
                std::fs::create_dir_all(&dir)?;
                (dir, true)
            }
        };

        Ok(Self {
            temp_dir,
            own_temp_dir,
            target_samples: (segment_size_ms as usize) * SAMPLE_RATE / 1000,
            running: false,
            current_frames: Vec::new(),
            silence_frames: Vec::new(),
            total_samples: 0,
            last_segment_time: Instant::now(),
            sequence_counter: 0,
            callback: None,
            buffer_pool_size: 3,
            immediate_processing: false,
            openai_mode: false,
        })
    }

    pub fn set_segment_ready_callback(&mut self, callback: SegmentReadyCallback) {
        self.callback = Some(callback);
    }

    /// `overlap_ms` is accepted for API compatibility but always forced to 0.
    pub fn set_segment_size(&mut self, segment_size_ms: u64, _overlap_ms: u64) {
        self.target_samples = (segment_size_ms as usize) * SAMPLE_RATE / 1000;
    }

    pub fn set_buffer_pool_size(&mut self, size: usize) {
        self.buffer_pool_size = size.max(1);
    }

    pub fn set_immediate_processing(&mut self, enable: bool) {
        self.immediate_processing = enable;
    }

    pub fn set_openai_mode(&mut self, enable: bool) {
        self.openai_mode = enable;
    }

    /// Accepted for API compatibility; overlap processing is not implemented.
    pub fn set_use_overlap_processing(&mut self, _enable: bool) {}

    pub fn start(&mut self) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        self.last_segment_time = Instant::now();
        info!("segment handler started (temp dir: {})", self.temp_dir.display());
        true
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        if !self.current_frames.is_empty() || !self.silence_frames.is_empty() {
            self.emit_segment(true);
        }
        self.running = false;
        if self.own_temp_dir {
            if let Err(e) = std::fs::remove_dir_all(&self.temp_dir) {
                warn!("failed to remove temp dir {}: {}", self.temp_dir.display(), e);
            }
        }
        info!("segment handler stopped after {} segments", self.sequence_counter);
    }

    pub fn temp_directory(&self) -> &Path {
        &self.temp_dir
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn flush_current_segment(&mut self) {
        if self.current_frames.is_empty() && self.silence_frames.is_empty() {
            return;
        }
        self.emit_segment(false);
    }

    /// Non-blocking ingestion of one frame. Processed synchronously: the
    /// segment-ready callback, if any, is invoked on this call stack.
    pub fn add_buffer(&mut self, frame: AudioFrame) {
        if !self.running {
            return;
        }

        if frame.is_last {
            self.current_frames.append(&mut self.silence_frames);
            if !frame.samples.is_empty() {
                self.current_frames.extend_from_slice(&frame.samples);
                self.total_samples += frame.samples.len();
            }
            self.emit_segment(true);
            return;
        }

        if frame.is_silence {
            self.silence_frames.extend_from_slice(&frame.samples);
            let silence_ms = self.silence_frames.len() * 1000 / SAMPLE_RATE;
            if silence_ms > LONG_SILENCE_MS {
                let keep_samples = (NATURAL_PAUSE_MS * SAMPLE_RATE / 1000).min(self.silence_frames.len());
                let keep: Vec<f32> = self.silence_frames[..keep_samples].to_vec();
                self.current_frames.extend_from_slice(&keep);
                self.total_samples += keep.len();
                self.silence_frames.clear();
                self.emit_segment(false);
            }
            return;
        }

        // Voiced frame: flush cached short silences to preserve natural cadence.
        if !self.silence_frames.is_empty() {
            self.total_samples += self.silence_frames.len();
            self.current_frames.append(&mut self.silence_frames);
        }
        self.current_frames.extend_from_slice(&frame.samples);
        self.total_samples += frame.samples.len();

        if frame.voice_end {
            self.emit_segment(false);
            return;
        }
        if self.total_samples >= self.target_samples {
            self.emit_segment(false);
            return;
        }
        if self.should_force_emit() {
            self.emit_segment(false);
        }
    }

    fn should_force_emit(&self) -> bool {
        if self.current_frames.is_empty() {
            return false;
        }
        let elapsed = self.last_segment_time.elapsed().as_millis();
        if elapsed >= STALL_FORCE_MS {
            return true;
        }
        let half_target = (self.target_samples as f64 * PARTIAL_FORCE_FRACTION) as usize;
        self.total_samples >= half_target && elapsed >= PARTIAL_FORCE_MS
    }

    fn emit_segment(&mut self, is_last: bool) {
        if self.current_frames.is_empty() && !is_last {
            return;
        }

        // Append trailing padding to avoid tail truncation by the recognizer.
        let padding_samples = PADDING_MS * SAMPLE_RATE / 1000;
        self.current_frames.extend(std::iter::repeat(0.0f32).take(padding_samples));

        let duration_ms = (self.total_samples as f64) * 1000.0 / SAMPLE_RATE as f64;
        self.sequence_counter += 1;
        let seq = self.sequence_counter;
        let file_name = format!(
            "segment_{}_{}ms_{}.wav",
            seq,
            duration_ms as u64,
            chrono::Utc::now().timestamp_millis()
        );
        let path = self.temp_dir.join(file_name);

        match wav::encode_to_file(&self.current_frames, &path) {
            Ok(()) => {
                let segment = crate::types::AudioSegment {
                    file_path: path,
                    sequence_number: seq,
                    timestamp: Instant::now(),
                    duration_ms,
                    is_last,
                    has_overlap: false,
                    overlap_ms: 0,
                };
                debug!(
                    "emitting segment {} ({:.0}ms, is_last={})",
                    seq, duration_ms, is_last
                );
                if let Some(callback) = self.callback.as_mut() {
                    callback(segment);
                }
            }
            Err(e) => {
                warn!("failed to encode segment {}: {}", seq, e);
            }
        }

        self.current_frames.clear();
        self.silence_frames.clear();
        self.total_samples = 0;
        self.last_segment_time = Instant::now();
    }
}

impl Drop for RealtimeSegmentHandler {
    fn drop(&mut self) {
        if self.running {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn voiced_frame(samples: usize) -> AudioFrame {
        let mut frame = AudioFrame::new(vec![0.2; samples], SAMPLE_RATE as u32);
        frame.is_silence = false;
        frame
    }

    fn silence_frame(samples: usize) -> AudioFrame {
        let mut frame = AudioFrame::new(vec![0.0; samples], SAMPLE_RATE as u32);
        frame.is_silence = true;
        frame
    }

    fn make_handler() -> (RealtimeSegmentHandler, Arc<Mutex<Vec<crate::types::AudioSegment>>>) {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut handler = RealtimeSegmentHandler::new(3500, Some(dir)).unwrap();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = captured.clone();
        handler.set_segment_ready_callback(Box::new(move |segment| {
            captured_clone.lock().unwrap().push(segment);
        }));
        handler.start();
        (handler, captured)
    }

    #[test]
    fn emits_one_terminal_segment_on_is_last() {
        let (mut handler, captured) = make_handler();
        handler.add_buffer(voiced_frame(1600));
        handler.add_buffer(AudioFrame::sentinel());
        assert_eq!(captured.lock().unwrap().len(), 1);
        assert!(captured.lock().unwrap()[0].is_last);
    }

    #[test]
    fn sequence_numbers_increase_strictly() {
        let (mut handler, captured) = make_handler();
        for _ in 0..4 {
            handler.add_buffer(voiced_frame(SAMPLE_RATE * 4)); // forces size-based emission
        }
        handler.add_buffer(AudioFrame::sentinel());
        let segments = captured.lock().unwrap();
        let sequences: Vec<u64> = segments.iter().map(|s| s.sequence_number).collect();
        let mut sorted = sequences.clone();
        sorted.sort();
        assert_eq!(sequences, sorted);
        for w in sequences.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn short_silence_does_not_force_emission() {
        let (mut handler, captured) = make_handler();
        handler.add_buffer(voiced_frame(1600));
        handler.add_buffer(silence_frame(SAMPLE_RATE / 10)); // 100ms, below 300ms threshold
        assert_eq!(captured.lock().unwrap().len(), 0);
    }

    #[test]
    fn long_silence_forces_emission_with_bounded_trailing_silence() {
        let (mut handler, captured) = make_handler();
        handler.add_buffer(voiced_frame(SAMPLE_RATE * 2));
        handler.add_buffer(silence_frame(SAMPLE_RATE)); // 1000ms silence > 300ms threshold
        assert_eq!(captured.lock().unwrap().len(), 1);
    }

    #[test]
    fn size_based_forced_cut_on_continuous_voice() {
        let (mut handler, captured) = make_handler();
        for _ in 0..7 {
            handler.add_buffer(voiced_frame(SAMPLE_RATE)); // 1s chunks, target is 3.5s
        }
        handler.add_buffer(AudioFrame::sentinel());
        assert!(captured.lock().unwrap().len() >= 2);
    }
}
