use std::time::{Duration, Instant};

use log::{debug, info, warn};
use regex::Regex;
use serde_json::json;

use crate::config::MergerConfig;
use crate::types::RecognitionResult;

struct Pending {
    result: RecognitionResult,
    received_at: Instant,
}

/// Gathers out-of-order recognition results, restores sequence order, removes
/// text overlap between consecutive segments, and emits merged output.
///
/// Timeout-sensitive operations take an explicit `Instant` rather than
/// reading the wall clock internally, so the merge/timeout logic is a pure
/// function of its inputs and can be driven directly from tests.
pub struct ResultMerger {
    config: MergerConfig,
    pending: Vec<Pending>,
    next_sequence_number: i64,
    last_emitted_sequence: i64,
    previous_text: Option<String>,
}

/// Output of one merge pass: ordered plain text lines plus the JSON array of
/// the underlying results, in emission order.
#[derive(Debug, Default)]
pub struct MergeOutput {
    pub text_lines: Vec<String>,
    pub results: Vec<serde_json::Value>,
}

impl ResultMerger {
    pub fn new(config: MergerConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            next_sequence_number: 1,
            last_emitted_sequence: -1,
            previous_text: None,
        }
    }

    /// Parse and store one result. `now` is the caller-supplied logical time
    /// used for timeout bookkeeping.
    pub fn add_result(&mut self, json_text: &str, now: Instant) {
        let mut result = RecognitionResult::parse(json_text, now);

        if result.has_overlap && result.overlap_ms > 0 {
            if let Some(prev) = &self.previous_text {
                result.text = remove_overlapping_text(prev, &result.text, result.overlap_ms);
            }
        }
        self.previous_text = Some(result.text.clone());

        self.pending.push(Pending {
            result,
            received_at: now,
        });
    }

    /// Drain everything currently mergeable, in order, given logical time `now`.
    ///
    /// In non-sequential mode, nothing is drained until the pending count
    /// reaches `max_results_before_merge`, unless the stream's final result
    /// has already arrived (in which case whatever is pending is flushed).
    pub fn merge_and_emit(&mut self, now: Instant) -> MergeOutput {
        let mut output = MergeOutput::default();
        if !self.config.sequential_mode {
            let stream_ending = self.pending.iter().any(|p| p.result.is_last);
            if self.pending.len() < self.config.max_results_before_merge && !stream_ending {
                return output;
            }
            self.pending
                .sort_by(|a, b| a.result.timestamp.cmp(&b.result.timestamp));
            for pending in self.pending.drain(..) {
                self.last_emitted_sequence = self.last_emitted_sequence.max(pending.result.sequence_number);
                output.text_lines.push(pending.result.text.clone());
                output.results.push(self.to_json(&pending.result));
            }
            return output;
        }

        self.pending.sort_by(|a, b| {
            a.result
                .sequence_number
                .cmp(&b.result.sequence_number)
                .then(a.result.timestamp.cmp(&b.result.timestamp))
        });

        loop {
            let mut progressed = false;

            while let Some(pos) = self
                .pending
                .iter()
                .position(|p| p.result.sequence_number == self.next_sequence_number)
            {
                let pending = self.pending.remove(pos);
                output.text_lines.push(pending.result.text.clone());
                output.results.push(self.to_json(&pending.result));
                self.last_emitted_sequence = self.next_sequence_number;
                self.next_sequence_number += 1;
                progressed = true;
            }

            if progressed {
                continue;
            }

            // No contiguous result is present. If the oldest pending item has
            // waited long enough, skip the missing sequence and retry.
            if let Some(oldest_wait) = self
                .pending
                .iter()
                .map(|p| now.saturating_duration_since(p.received_at))
                .max()
            {
                if !self.pending.is_empty()
                    && oldest_wait >= Duration::from_millis(self.config.max_wait_time_ms)
                {
                    warn!(
                        "result merger: sequence {} timed out after {}ms, skipping",
                        self.next_sequence_number, self.config.max_wait_time_ms
                    );
                    self.next_sequence_number += 1;
                    continue;
                }
            }

            break;
        }

        output
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.next_sequence_number = 1;
        self.last_emitted_sequence = -1;
        self.previous_text = None;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_emitted_sequence(&self) -> i64 {
        self.last_emitted_sequence
    }

    fn to_json(&self, result: &RecognitionResult) -> serde_json::Value {
        json!({
            "text": result.text,
            "sequence": result.sequence_number,
            "duration_ms": result.duration_ms,
            "is_last": result.is_last,
        })
    }
}

/// Estimate an overlap character count from `overlap_ms`, find the longest
/// suffix of `previous` that recurs as a prefix region of `current`, and
/// strip it from `current`. Falls back to a CJK/punctuation boundary trim
/// when no textual match is found.
fn remove_overlapping_text(previous: &str, current: &str, overlap_ms: i32) -> String {
    if previous.is_empty() || current.is_empty() {
        return current.to_string();
    }

    let prev_chars: Vec<char> = previous.chars().collect();
    let cur_chars: Vec<char> = current.chars().collect();

    let estimated = (overlap_ms as f32 / 1000.0 * 15.0).round() as usize;
    let max_overlap = (prev_chars.len().min(cur_chars.len()) / 2).max(5);
    let overlap_chars = estimated.clamp(5, max_overlap);

    let search_window = (overlap_chars * 3).min(cur_chars.len());

    for suffix_len in (4..=overlap_chars.min(prev_chars.len())).rev() {
        if suffix_len > search_window {
            continue;
        }
        let suffix_lower: String = prev_chars[prev_chars.len() - suffix_len..]
            .iter()
            .flat_map(|c| c.to_lowercase())
            .collect();
        for start in 0..=(search_window - suffix_len) {
            let window_lower: String = cur_chars[start..start + suffix_len]
                .iter()
                .flat_map(|c| c.to_lowercase())
                .collect();
            if window_lower == suffix_lower {
                let byte_end: usize = cur_chars[..start + suffix_len]
                    .iter()
                    .map(|c| c.len_utf8())
                    .sum();
                return current[byte_end..].to_string();
            }
        }
    }

    // Fallback: trim up to the first CJK or punctuation boundary within 2x overlap_chars.
    let fallback_window = (overlap_chars * 2).min(cur_chars.len());
    let boundary_re = Regex::new(r"[\u{4e00}-\u{9fff}\u{3040}-\u{30ff},.!?;:，。！？；：]").unwrap();
    for (idx, ch) in cur_chars.iter().enumerate().take(fallback_window) {
        if boundary_re.is_match(&ch.to_string()) {
            return cur_chars[idx + 1..].iter().collect();
        }
    }

    current.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_json(text: &str, sequence: i64) -> String {
        json!({"text": text, "sequence": sequence}).to_string()
    }

    #[test]
    fn out_of_order_results_emit_in_sequence() {
        let mut merger = ResultMerger::new(MergerConfig::default());
        let t0 = Instant::now();
        merger.add_result(&result_json("three", 3), t0);
        merger.add_result(&result_json("one", 1), t0);
        merger.add_result(&result_json("two", 2), t0);

        let output = merger.merge_and_emit(t0);
        assert_eq!(output.text_lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn missing_sequence_is_skipped_after_timeout() {
        let mut config = MergerConfig::default();
        config.max_wait_time_ms = 100;
        let mut merger = ResultMerger::new(config);

        let t0 = Instant::now();
        merger.add_result(&result_json("one", 1), t0);
        merger.add_result(&result_json("three", 3), t0);

        let output_immediate = merger.merge_and_emit(t0);
        assert_eq!(output_immediate.text_lines, vec!["one"]);

        let t1 = t0 + Duration::from_millis(150);
        let output_after_timeout = merger.merge_and_emit(t1);
        assert_eq!(output_after_timeout.text_lines, vec!["three"]);
    }

    #[test]
    fn overlap_removal_strips_repeated_suffix() {
        let previous = "the quick brown fox jumps";
        let current = "jumps over the lazy dog";
        let cleaned = remove_overlapping_text(previous, current, 400);
        assert!(!cleaned.starts_with("jumps"));
        assert!(cleaned.contains("over the lazy dog"));
    }

    #[test]
    fn overlap_removal_handles_case_folding_that_changes_byte_length() {
        let previous = "bir gün İstanbul";
        let current = "i̇stanbul güzeldir";
        let cleaned = remove_overlapping_text(previous, current, 400);
        assert!(cleaned.contains("güzeldir"));
    }

    #[test]
    fn non_sequential_mode_waits_for_batch_threshold() {
        let mut config = MergerConfig::default();
        config.sequential_mode = false;
        config.max_results_before_merge = 3;
        let mut merger = ResultMerger::new(config);
        let t0 = Instant::now();

        merger.add_result(&result_json("a", 0), t0);
        merger.add_result(&result_json("b", 1), t0);
        let too_early = merger.merge_and_emit(t0);
        assert!(too_early.text_lines.is_empty());

        merger.add_result(&result_json("c", 2), t0);
        let batched = merger.merge_and_emit(t0);
        assert_eq!(batched.text_lines.len(), 3);
    }

    #[test]
    fn non_sequential_mode_flushes_early_on_final_result() {
        let mut config = MergerConfig::default();
        config.sequential_mode = false;
        config.max_results_before_merge = 5;
        let mut merger = ResultMerger::new(config);
        let t0 = Instant::now();

        merger.add_result(&result_json("a", 0), t0);
        let mut last = RecognitionResult::parse(&result_json("b", 1), t0);
        last.is_last = true;
        merger.add_result(&serde_json::to_string(&last).unwrap(), t0);

        let output = merger.merge_and_emit(t0);
        assert_eq!(output.text_lines.len(), 2);
    }

    #[test]
    fn clear_resets_ordering_state() {
        let mut merger = ResultMerger::new(MergerConfig::default());
        let t0 = Instant::now();
        merger.add_result(&result_json("one", 1), t0);
        merger.merge_and_emit(t0);
        assert_eq!(merger.last_emitted_sequence(), 1);
        merger.clear();
        assert_eq!(merger.last_emitted_sequence(), -1);
        assert_eq!(merger.pending_count(), 0);
    }
}
