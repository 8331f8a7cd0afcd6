use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, SupportedStreamConfig};
use log::{error, info, warn};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use tokio::sync::mpsc;

use crate::types::AudioFrame;

const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Live microphone capture feeding mono 16kHz `AudioFrame`s to an unbounded
/// channel. The underlying `cpal::Stream` isn't `Send`; capture runs to
/// completion on the thread that created it and is only ever torn down by
/// dropping the handle.
pub struct MicrophoneCapture {
    stream: Stream,
    device_name: String,
}

// The callback closures capturing `frame_tx` don't touch the stream itself
// across threads; only teardown (drop) happens from another thread.
unsafe impl Send for MicrophoneCapture {}

impl MicrophoneCapture {
    pub fn start(device_name: Option<&str>, frame_tx: mpsc::UnboundedSender<AudioFrame>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .with_context(|| format!("input device '{}' not found", name))?,
            None => host
                .default_input_device()
                .context("no default input device available")?,
        };

        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let config = device.default_input_config().context("no supported input config")?;
        info!(
            "capturing from '{}' at {} Hz, {} channel(s), format {:?}",
            name,
            config.sample_rate().0,
            config.channels(),
            config.sample_format()
        );

        let stream = build_stream(&device, &config, frame_tx)?;
        stream.play().context("starting input stream")?;

        Ok(Self { stream, device_name: name })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn stop(self) {
        info!("stopping capture from '{}'", self.device_name);
        drop(self.stream);
    }
}

fn build_stream(
    device: &Device,
    config: &SupportedStreamConfig,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
) -> Result<Stream> {
    let channels = config.channels();
    let source_rate = config.sample_rate().0;
    let stream_config = config.clone().into();

    let err_fn = |err| error!("audio input stream error: {}", err);

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                emit_frame(data.to_vec(), channels, source_rate, &frame_tx);
            },
            err_fn,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                emit_frame(samples, channels, source_rate, &frame_tx);
            },
            err_fn,
            None,
        )?,
        SampleFormat::I32 => device.build_input_stream(
            &stream_config,
            move |data: &[i32], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / i32::MAX as f32).collect();
                emit_frame(samples, channels, source_rate, &frame_tx);
            },
            err_fn,
            None,
        )?,
        other => {
            return Err(anyhow::anyhow!("unsupported sample format: {:?}", other));
        }
    };

    Ok(stream)
}

fn emit_frame(raw: Vec<f32>, channels: u16, source_rate: u32, frame_tx: &mpsc::UnboundedSender<AudioFrame>) {
    let mono = audio_to_mono(&raw, channels);
    let resampled = if source_rate == TARGET_SAMPLE_RATE {
        mono
    } else {
        match resample_to(&mono, source_rate, TARGET_SAMPLE_RATE) {
            Ok(out) => out,
            Err(e) => {
                warn!("resampling failed, dropping chunk: {}", e);
                return;
            }
        }
    };

    if frame_tx.send(AudioFrame::new(resampled, TARGET_SAMPLE_RATE)).is_err() {
        warn!("frame channel closed, capture callback has nowhere to send");
    }
}

fn audio_to_mono(audio: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return audio.to_vec();
    }
    audio
        .chunks(channels as usize)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Sinc-interpolated resampling shared with the file-input decode path.
pub(crate) fn resample_to(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        2.0,
        params,
        input.len(),
        1,
    )?;

    let waves_in = vec![input.to_vec()];
    let waves_out = resampler.process(&waves_in, None)?;
    Ok(waves_out.into_iter().next().unwrap_or_default())
}

/// List input device names for CLI device selection.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().context("enumerating input devices")?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_downmix_averages_channels() {
        let stereo = vec![1.0, -1.0, 0.5, 0.5];
        let mono = audio_to_mono(&stereo, 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn mono_passthrough_when_already_mono() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(audio_to_mono(&samples, 1), samples);
    }

    #[test]
    fn resample_preserves_roughly_the_expected_length() {
        let input = vec![0.0f32; 1600];
        let out = resample_to(&input, 16_000, 48_000).unwrap();
        assert!((out.len() as i64 - 4800).abs() < 200);
    }
}
