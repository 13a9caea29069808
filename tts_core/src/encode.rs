use base64::{engine::general_purpose, Engine as _};

const I16_MAX_F32: f32 = i16::MAX as f32;

/// Quantize one sample to 16-bit PCM, rounding to the nearest step.
///
/// Out-of-range and infinite values clip to the nearest bound. NaN has no
/// nearest bound and becomes silence.
#[inline]
pub fn quantize_sample(s: f32) -> i16 {
    if s.is_nan() {
        return 0;
    }
    (s.clamp(-1.0, 1.0) * I16_MAX_F32).round() as i16
}

/// Encode f32 samples as raw 16-bit little-endian mono PCM and return Base64.
/// No WAV header: the chunk message already carries the sample rate.
pub fn encode_pcm16_base64(samples: &[f32]) -> String {
    let mut pcm = Vec::<u8>::with_capacity(samples.len() * 2);
    for &s in samples {
        pcm.extend_from_slice(&quantize_sample(s).to_le_bytes());
    }
    general_purpose::STANDARD.encode(pcm)
}

/// Inverse of [`encode_pcm16_base64`], for clients and tests.
pub fn decode_pcm16_base64(encoded: &str) -> anyhow::Result<Vec<f32>> {
    let bytes = general_purpose::STANDARD.decode(encoded)?;
    if bytes.len() % 2 != 0 {
        return Err(anyhow::anyhow!("PCM16 payload has odd length {}", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / I16_MAX_F32)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_clips_and_handles_non_finite() {
        assert_eq!(quantize_sample(0.0), 0);
        assert_eq!(quantize_sample(1.0), i16::MAX);
        assert_eq!(quantize_sample(-1.0), -i16::MAX);
        assert_eq!(quantize_sample(3.5), i16::MAX);
        assert_eq!(quantize_sample(-7.0), -i16::MAX);
        assert_eq!(quantize_sample(f32::INFINITY), i16::MAX);
        assert_eq!(quantize_sample(f32::NEG_INFINITY), -i16::MAX);
        assert_eq!(quantize_sample(f32::NAN), 0);
    }

    #[test]
    fn test_encoding_is_little_endian() {
        let encoded = encode_pcm16_base64(&[1.0, -1.0]);
        let bytes = general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(bytes, vec![0xff, 0x7f, 0x01, 0x80]);
    }

    #[test]
    fn test_empty_frame() {
        assert_eq!(encode_pcm16_base64(&[]), "");
        assert!(decode_pcm16_base64("").unwrap().is_empty());
    }

    #[test]
    fn test_reconstruction_within_quantization_error() {
        let original: Vec<f32> = (0..2400)
            .map(|i| (i as f32 * 0.013).sin() * 0.9)
            .collect();
        let decoded = decode_pcm16_base64(&encode_pcm16_base64(&original)).unwrap();
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert!((a - b).abs() <= 1.0 / 32767.0, "{a} vs {b}");
        }
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let odd = general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert!(decode_pcm16_base64(&odd).is_err());
    }
}
