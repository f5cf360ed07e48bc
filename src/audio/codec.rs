//! # Audio Frame Codec
//!
//! Pure conversions between wire byte buffers and PCM sample sequences.
//! No I/O happens here.
//!
//! ## Wire Format:
//! - **Encoding**: signed 16-bit little-endian, mono, no header
//! - **Client → server**: 16 kHz
//! - **Server → client**: 24 kHz
//!
//! A frame is whatever one transport message carries; frames have no sequence
//! numbers and no framing of their own.

use crate::error::RelayError;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

/// Sample rate of captured audio sent from the client.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio produced by the upstream service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Encode samples as little-endian PCM16 bytes.
pub fn encode(samples: &[i16]) -> Bytes {
    let mut buf = vec![0u8; samples.len() * BYTES_PER_SAMPLE];
    LittleEndian::write_i16_into(samples, &mut buf);
    Bytes::from(buf)
}

/// Decode little-endian PCM16 bytes into samples.
///
/// Fails with `MalformedFrame` on odd-length input without producing any
/// partial output.
pub fn decode(bytes: &[u8]) -> Result<Vec<i16>, RelayError> {
    let count = sample_count(bytes)?;
    let mut samples = vec![0i16; count];
    LittleEndian::read_i16_into(bytes, &mut samples);
    Ok(samples)
}

/// Number of whole samples in a frame, or `MalformedFrame`.
pub fn sample_count(bytes: &[u8]) -> Result<usize, RelayError> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(RelayError::MalformedFrame { len: bytes.len() });
    }
    Ok(bytes.len() / BYTES_PER_SAMPLE)
}

/// Convert a signed sample to a float in `[-1.0, 1.0)`.
#[inline]
pub fn sample_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Convert a sample read as an *unsigned* 16-bit word to a float.
///
/// Words at or above 32768 are the negative half and are shifted down by 65536
/// before scaling. This gives exactly the same result as [`sample_to_f32`] on
/// the signed reading of the same bytes; decoding paths should prefer the
/// signed form.
#[inline]
pub fn unsigned_sample_to_f32(word: u16) -> f32 {
    let value = if word >= 0x8000 {
        word as i32 - 0x1_0000
    } else {
        word as i32
    };
    value as f32 / 32768.0
}

/// Convert a float sample back to PCM16, clamping out-of-range input.
#[inline]
pub fn f32_to_sample(value: f32) -> i16 {
    (value * 32768.0).clamp(-32768.0, 32767.0) as i16
}

/// Decode a frame straight to float samples ready for an output device.
pub fn decode_to_f32(bytes: &[u8]) -> Result<Vec<f32>, RelayError> {
    Ok(decode(bytes)?.into_iter().map(sample_to_f32).collect())
}

/// Root-mean-square level of a block, scaled to `[0.0, 1.0]`.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = sample_to_f32(s) as f64;
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_little_endian() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x00, 0x80, 0xff, 0x7f];
        assert_eq!(decode(&bytes).unwrap(), vec![1, -1, i16::MIN, i16::MAX]);
    }

    #[test]
    fn test_odd_length_is_malformed() {
        let err = decode(&[0u8; 7]).unwrap_err();
        assert_eq!(err, RelayError::MalformedFrame { len: 7 });
        assert!(sample_count(&[0u8; 1]).is_err());
        assert_eq!(sample_count(&[]).unwrap(), 0);
    }

    #[test]
    fn test_signed_and_unsigned_conversions_agree() {
        for sample in [i16::MIN, -16384, -1, 0, 1, 16384, i16::MAX] {
            let word = sample as u16;
            assert_eq!(sample_to_f32(sample), unsigned_sample_to_f32(word));
        }
        assert_eq!(sample_to_f32(i16::MIN), -1.0);
        assert!(sample_to_f32(i16::MAX) < 1.0);
    }

    #[test]
    fn test_float_roundtrip_is_close() {
        for sample in [0i16, 16384, -16384, 32767, -32768] {
            let back = f32_to_sample(sample_to_f32(sample));
            assert!((back as i32 - sample as i32).abs() <= 1);
        }
        assert_eq!(f32_to_sample(2.0), i16::MAX);
        assert_eq!(f32_to_sample(-2.0), i16::MIN);
    }

    #[test]
    fn test_rms_level() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0; 64]), 0.0);
        let loud = rms_level(&[i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
        assert!(loud > 0.99);
    }

    proptest! {
        #[test]
        fn prop_even_buffers_roundtrip(words in proptest::collection::vec(any::<u16>(), 0..512)) {
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            let samples = decode(&bytes).unwrap();
            let encoded = encode(&samples);
            prop_assert_eq!(encoded.as_ref(), bytes.as_slice());
        }

        #[test]
        fn prop_odd_buffers_fail(mut bytes in proptest::collection::vec(any::<u8>(), 0..511)) {
            if bytes.len() % 2 == 0 {
                bytes.push(0);
            }
            prop_assert_eq!(decode(&bytes), Err(RelayError::MalformedFrame { len: bytes.len() }));
        }

        #[test]
        fn prop_float_paths_agree(word in any::<u16>()) {
            let signed = i16::from_le_bytes(word.to_le_bytes());
            prop_assert_eq!(sample_to_f32(signed), unsigned_sample_to_f32(word));
        }
    }
}
