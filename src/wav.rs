use std::io::{Cursor, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

const SAMPLE_RATE: u32 = 16_000;
const BITS_PER_SAMPLE: u16 = 16;
const CHANNELS: u16 = 1;

/// Encode mono f32 PCM in [-1.0, 1.0] to a 16-bit PCM WAV file at `path`.
pub fn encode_to_file(samples: &[f32], path: &Path) -> Result<()> {
    let bytes = encode_to_bytes(samples);
    std::fs::write(path, &bytes).with_context(|| format!("writing wav file {}", path.display()))?;
    Ok(())
}

/// Encode mono f32 PCM to an in-memory RIFF/WAVE byte buffer.
pub fn encode_to_bytes(samples: &[f32]) -> Vec<u8> {
    let data_size = samples.len() * 2;
    let byte_rate = SAMPLE_RATE * (CHANNELS as u32) * (BITS_PER_SAMPLE as u32) / 8;
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;

    let mut buf = Vec::with_capacity(44 + data_size);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&((36 + data_size) as u32).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    buf.extend_from_slice(&CHANNELS.to_le_bytes());
    buf.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_size as u32).to_le_bytes());
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let quantized = (clamped * i16::MAX as f32) as i16;
        buf.extend_from_slice(&quantized.to_le_bytes());
    }

    buf
}

/// Decode a WAV file to mono f32 PCM at its native sample rate, returning
/// `(samples, sample_rate)`. Stereo input is downmixed by averaging channels.
pub fn decode_file(path: &Path) -> Result<(Vec<f32>, u32)> {
    let bytes = std::fs::read(path).with_context(|| format!("reading wav file {}", path.display()))?;
    decode_bytes(&bytes)
}

pub fn decode_bytes(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut cursor = Cursor::new(bytes);

    let mut riff_tag = [0u8; 4];
    cursor.read_exact(&mut riff_tag)?;
    if &riff_tag != b"RIFF" {
        bail!("not a RIFF file");
    }
    let mut skip4 = [0u8; 4];
    cursor.read_exact(&mut skip4)?; // chunk size, unused

    let mut wave_tag = [0u8; 4];
    cursor.read_exact(&mut wave_tag)?;
    if &wave_tag != b"WAVE" {
        bail!("not a WAVE file");
    }

    let mut sample_rate = SAMPLE_RATE;
    let mut channels = CHANNELS;
    let mut bits_per_sample = BITS_PER_SAMPLE;
    let mut samples: Vec<f32> = Vec::new();

    loop {
        let mut chunk_id = [0u8; 4];
        if cursor.read_exact(&mut chunk_id).is_err() {
            break;
        }
        let mut chunk_size_bytes = [0u8; 4];
        cursor.read_exact(&mut chunk_size_bytes)?;
        let chunk_size = u32::from_le_bytes(chunk_size_bytes) as usize;

        match &chunk_id {
            b"fmt " => {
                let mut fmt_buf = vec![0u8; chunk_size];
                cursor.read_exact(&mut fmt_buf)?;
                channels = u16::from_le_bytes([fmt_buf[2], fmt_buf[3]]);
                sample_rate = u32::from_le_bytes([fmt_buf[4], fmt_buf[5], fmt_buf[6], fmt_buf[7]]);
                bits_per_sample = u16::from_le_bytes([fmt_buf[14], fmt_buf[15]]);
            }
            b"data" => {
                let mut data_buf = vec![0u8; chunk_size];
                cursor.read_exact(&mut data_buf)?;
                samples = decode_pcm(&data_buf, bits_per_sample, channels);
            }
            _ => {
                let mut skip_buf = vec![0u8; chunk_size];
                cursor.read_exact(&mut skip_buf)?;
            }
        }
        // Chunks are word-aligned.
        if chunk_size % 2 == 1 {
            let mut pad = [0u8; 1];
            let _ = cursor.read_exact(&mut pad);
        }
    }

    Ok((samples, sample_rate))
}

fn decode_pcm(data: &[u8], bits_per_sample: u16, channels: u16) -> Vec<f32> {
    let bytes_per_sample = (bits_per_sample / 8) as usize;
    let frame_size = bytes_per_sample * channels as usize;
    if frame_size == 0 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(data.len() / frame_size);
    for frame in data.chunks_exact(frame_size) {
        let mut acc = 0.0f32;
        for ch in 0..channels as usize {
            let start = ch * bytes_per_sample;
            let sample = match bits_per_sample {
                16 => i16::from_le_bytes([frame[start], frame[start + 1]]) as f32 / i16::MAX as f32,
                32 => i32::from_le_bytes([
                    frame[start],
                    frame[start + 1],
                    frame[start + 2],
                    frame[start + 3],
                ]) as f32
                    / i32::MAX as f32,
                8 => (frame[start] as f32 - 128.0) / 128.0,
                _ => 0.0,
            };
            acc += sample;
        }
        out.push(acc / channels as f32);
    }
    out
}

/// Encode to bytes, writing a canonical 44-byte header, for callers that need
/// the raw buffer (e.g. multipart upload) without touching disk.
pub fn encode_to_writer<W: Write>(samples: &[f32], mut writer: W) -> Result<()> {
    writer.write_all(&encode_to_bytes(samples))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_samples_within_quantization() {
        let samples: Vec<f32> = (0..1600)
            .map(|i| (i as f32 / 1600.0 * std::f32::consts::TAU).sin() * 0.5)
            .collect();
        let bytes = encode_to_bytes(&samples);
        let (decoded, rate) = decode_bytes(&bytes).unwrap();
        assert_eq!(rate, SAMPLE_RATE);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() <= 1.0 / 32767.0 + 1e-6);
        }
    }

    #[test]
    fn header_layout_is_canonical_44_bytes() {
        let bytes = encode_to_bytes(&[0.0; 10]);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(bytes.len(), 44 + 20);
    }

    #[test]
    fn empty_samples_produce_valid_empty_wav() {
        let bytes = encode_to_bytes(&[]);
        let (decoded, _) = decode_bytes(&bytes).unwrap();
        assert!(decoded.is_empty());
    }
}
