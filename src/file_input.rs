use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;

use crate::capture::resample_to;
use crate::types::AudioFrame;

const TARGET_SAMPLE_RATE: u32 = 16_000;
const CHUNK_MS: usize = 20;

/// Decode an audio or video file with Symphonia, downmix to mono, resample
/// to 16kHz, and push fixed-size frames onto `frame_tx` followed by one
/// sentinel frame. Runs synchronously; callers typically invoke this inside
/// `spawn_blocking`.
pub fn decode_file_to_frames(path: &Path, frame_tx: mpsc::UnboundedSender<AudioFrame>) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &Default::default())
        .with_context(|| format!("probing format of {}", path.display()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.sample_rate.is_some())
        .ok_or_else(|| anyhow!("no decodable audio track in {}", path.display()))?;
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap();
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &Default::default())
        .context("constructing decoder")?;

    debug!(
        "decoding {} at {} Hz, {} channel(s)",
        path.display(),
        source_rate,
        channels
    );

    let mut mono_accum: Vec<f32> = Vec::new();
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(e) => {
                warn!("skipping undecodable packet: {}", e);
                continue;
            }
        };
        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        mono_accum.extend(downmix(buf.samples(), channels));
    }

    let resampled = if source_rate == TARGET_SAMPLE_RATE {
        mono_accum
    } else {
        resample_to(&mono_accum, source_rate, TARGET_SAMPLE_RATE)?
    };

    let chunk_samples = TARGET_SAMPLE_RATE as usize * CHUNK_MS / 1000;
    for chunk in resampled.chunks(chunk_samples.max(1)) {
        if frame_tx
            .send(AudioFrame::new(chunk.to_vec(), TARGET_SAMPLE_RATE))
            .is_err()
        {
            return Ok(());
        }
    }
    let _ = frame_tx.send(AudioFrame::sentinel());
    Ok(())
}

fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels as usize)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_stereo_pairs() {
        let stereo = vec![1.0, 0.0, -1.0, 1.0];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.0]);
    }

    #[test]
    fn downmix_mono_is_identity() {
        let mono = vec![0.1, 0.2];
        assert_eq!(downmix(&mono, 1), mono);
    }
}
