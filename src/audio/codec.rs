//! # Audio Codec
//!
//! Stateless conversions between the client's capture/playback formats and the
//! wire format the conversational endpoint expects.
//!
//! ## Functions:
//! - **resample**: linear interpolation between sample rates (speech quality)
//! - **encode_pcm16 / decode_pcm16**: float samples ⇄ 16-bit little-endian PCM
//! - **to_base64 / from_base64**: text-safe framing for JSON transports
//! - **downmix_to_mono**: average interleaved channels into one

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Full-scale value used for both directions of the PCM16 conversion.
pub const PCM16_SCALE: f32 = 32767.0;

/// Errors raised by codec functions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("sample rate must be greater than zero (from {from}, to {to})")]
    InvalidRate { from: u32, to: u32 },

    #[error("PCM16 payload length must be even, got {0} bytes")]
    OddLength(usize),

    #[error("channel count must be greater than zero")]
    InvalidChannels,

    #[error("invalid base64 payload: {0}")]
    Base64(String),
}

/// Resample `samples` from `from_rate` to `to_rate` using linear interpolation.
///
/// The output holds `round(len * to_rate / from_rate)` samples. Each output
/// sample maps back to position `i * from_rate / to_rate` in the input and is
/// interpolated between its two neighbours; positions past the last input
/// sample hold the last value.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, CodecError> {
    if from_rate == 0 || to_rate == 0 {
        return Err(CodecError::InvalidRate { from: from_rate, to: to_rate });
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let output_len = resampled_len(samples.len(), from_rate, to_rate);
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = samples.len() - 1;

    let output = (0..output_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = position.floor() as usize;
            if index >= last {
                return samples[last];
            }
            let frac = (position - index as f64) as f32;
            samples[index] + (samples[index + 1] - samples[index]) * frac
        })
        .collect();

    Ok(output)
}

/// Number of samples `resample` produces for an input of `len` samples.
pub fn resampled_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    (len as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize
}

/// Pack float samples as little-endian signed 16-bit PCM.
///
/// Samples are clamped to `[-1.0, 1.0]` and scaled by 32767. NaN encodes as silence.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let value = (clamped * PCM16_SCALE).round() as i16;
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(value);
    }
    bytes
}

/// Unpack little-endian signed 16-bit PCM into float samples in `[-1.0, 1.0]`.
///
/// `i16::MIN` decodes slightly below -1.0 and is clamped.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(value) = cursor.read_i16::<LittleEndian>() {
        samples.push((f32::from(value) / PCM16_SCALE).max(-1.0));
    }
    Ok(samples)
}

pub fn to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn from_base64(encoded: &str) -> Result<Vec<u8>, CodecError> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| CodecError::Base64(e.to_string()))
}

/// Average interleaved frames of `channels` samples down to a single channel.
///
/// A trailing partial frame is averaged over the samples it has.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Result<Vec<f32>, CodecError> {
    match channels {
        0 => Err(CodecError::InvalidChannels),
        1 => Ok(samples.to_vec()),
        n => Ok(samples
            .chunks(usize::from(n))
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, rate: u32, freq: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.8)
            .collect()
    }

    #[test]
    fn test_pcm16_round_trip_within_one_lsb() {
        let mut samples = sine(480, 48000, 440.0);
        samples.extend_from_slice(&[0.0, 1.0, -1.0, 0.5, -0.5, 1.0 / 32767.0, 0.123_456]);

        let decoded = decode_pcm16(&encode_pcm16(&samples)).unwrap();
        assert_eq!(decoded.len(), samples.len());
        for (original, restored) in samples.iter().zip(&decoded) {
            assert!(
                (original - restored).abs() <= 1.0 / 32767.0,
                "sample drifted: {} vs {}",
                original,
                restored
            );
        }
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let bytes = encode_pcm16(&[2.0, -3.5, f32::NAN]);
        let decoded = decode_pcm16(&bytes).unwrap();
        assert_eq!(decoded, vec![1.0, -1.0, 0.0]);
        assert_eq!(&bytes[0..2], &32767i16.to_le_bytes());
        assert_eq!(&bytes[2..4], &(-32767i16).to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        assert_eq!(decode_pcm16(&[0u8; 5]), Err(CodecError::OddLength(5)));
        assert!(decode_pcm16(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_resample_length_matches_rounding_rule() {
        let cases = [
            (4800usize, 48000u32, 16000u32),
            (1000, 44100, 16000),
            (333, 16000, 24000),
            (7, 3, 2),
            (1, 8000, 48000),
        ];
        for (len, from, to) in cases {
            let input = vec![0.25f32; len];
            let output = resample(&input, from, to).unwrap();
            let expected = (len as f64 * to as f64 / from as f64).round() as usize;
            assert_eq!(output.len(), expected, "len {} {} -> {}", len, from, to);
        }
    }

    #[test]
    fn test_resample_rejects_zero_rate() {
        assert!(matches!(
            resample(&[0.1, 0.2], 0, 16000),
            Err(CodecError::InvalidRate { .. })
        ));
        assert!(resample(&[0.1, 0.2], 16000, 0).is_err());
    }

    #[test]
    fn test_resample_round_trip_has_bounded_error() {
        let original = sine(2400, 24000, 200.0);
        let down = resample(&original, 24000, 16000).unwrap();
        let back = resample(&down, 16000, 24000).unwrap();
        assert_eq!(back.len(), original.len());

        // Skip the tail where interpolation holds the last value.
        let max_error = original
            .iter()
            .zip(&back)
            .take(original.len() - 4)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_error < 0.05, "max error too large: {}", max_error);
    }

    #[test]
    fn test_resample_interpolates_between_neighbours() {
        let output = resample(&[0.0, 1.0], 1, 2).unwrap();
        assert_eq!(output.len(), 4);
        assert!((output[1] - 0.5).abs() < 1e-6);
        assert_eq!(output[3], 1.0);
    }

    #[test]
    fn test_base64_framing() {
        let payload = encode_pcm16(&[0.1, -0.2, 0.3]);
        let encoded = to_base64(&payload);
        assert_eq!(from_base64(&encoded).unwrap(), payload);
        assert!(matches!(from_base64("not base64!!"), Err(CodecError::Base64(_))));
    }

    #[test]
    fn test_downmix_averages_frames() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix_to_mono(&stereo, 2).unwrap(), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix_to_mono(&stereo, 0), Err(CodecError::InvalidChannels));
    }
}
