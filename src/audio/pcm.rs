// pcm.rs: wire codec between base64 little-endian PCM16 and f32 samples.
//
// Decode divides by 32768 so every i16 maps into [-1.0, 1.0). Encode uses the
// same factor and truncates toward zero; +1.0 saturates at i16::MAX. Any
// sample in [-1, 1] therefore survives encode/decode within 1/32768.
//
// Negatives are scaled by 32768 as well, not 32767. The two differ by at most
// one PCM step for any sample in [-1, 0), and the single factor is what keeps
// the round-trip bound above at the positive end.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::AudioError;

const PCM16_SCALE: f32 = 32768.0;

/// Decode base64-wrapped PCM16 (little-endian) into f32 samples.
pub fn decode(encoded: &str) -> Result<Vec<f32>, AudioError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| AudioError::MalformedAudioData(format!("bad base64: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(AudioError::MalformedAudioData(format!(
            "odd PCM16 byte length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

/// Encode f32 samples as base64-wrapped PCM16 (little-endian).
pub fn encode(samples: &[f32]) -> String {
    BASE64.encode(samples_to_pcm16_bytes(samples))
}

/// Quantise one sample to i16, clamping out-of-range (and NaN) input.
pub fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    // `as` saturates, so 1.0 * 32768 lands on i16::MAX
    (sample.clamp(-1.0, 1.0) * PCM16_SCALE) as i16
}

fn samples_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| quantize(s).to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUANTIZATION_FLOOR: f32 = 1.0 / 32768.0;

    #[test]
    fn negative_samples_stay_within_one_step_of_32767_scaling() {
        for s in [-1.0f32, -0.999, -0.5, -0.25, -1.0 / 3.0, -0.0001, -QUANTIZATION_FLOOR] {
            let asymmetric = (s * 32767.0) as i16;
            let diff = (quantize(s) as i32 - asymmetric as i32).abs();
            assert!(diff <= 1, "{s}: {} vs {asymmetric}", quantize(s));
        }
        assert_eq!(quantize(-1.0), i16::MIN);
    }

    #[test]
    fn decode_little_endian_pairs() {
        // 0x4000 = 16384 -> 0.5, 0xC000 = -16384 -> -0.5
        let b64 = BASE64.encode([0x00, 0x40, 0x00, 0xC0]);
        let samples = decode(&b64).unwrap();
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn decode_extremes() {
        let b64 = BASE64.encode([0x00, 0x80, 0xFF, 0x7F]);
        let samples = decode(&b64).unwrap();
        assert_eq!(samples[0], -1.0);
        assert!((samples[1] - 32767.0 / 32768.0).abs() < f32::EPSILON);
    }

    #[test]
    fn decode_odd_length_is_malformed() {
        let b64 = BASE64.encode([0x01, 0x02, 0x03]);
        match decode(&b64) {
            Err(AudioError::MalformedAudioData(msg)) => assert!(msg.contains("odd")),
            other => panic!("expected MalformedAudioData, got: {other:?}"),
        }
    }

    #[test]
    fn decode_invalid_base64_is_malformed() {
        assert!(matches!(
            decode("not base64!!"),
            Err(AudioError::MalformedAudioData(_))
        ));
    }

    #[test]
    fn decode_empty_payload_is_empty() {
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn encode_clamps_out_of_range() {
        let bytes = BASE64.decode(encode(&[2.0, -3.0, f32::NAN])).unwrap();
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MIN, 0]);
    }

    #[test]
    fn encode_produces_even_byte_length() {
        let bytes = BASE64.decode(encode(&[0.0; 4096])).unwrap();
        assert_eq!(bytes.len(), 8192);
    }

    #[test]
    fn decoded_samples_stay_within_quantization_floor() {
        let samples: Vec<f32> = (0..2001).map(|i| (i as f32 - 1000.0) / 1000.0).collect();
        let decoded = decode(&encode(&samples)).unwrap();
        assert_eq!(decoded.len(), samples.len());
        for (orig, back) in samples.iter().zip(&decoded) {
            assert!(
                (orig - back).abs() <= QUANTIZATION_FLOOR,
                "{orig} came back as {back}"
            );
        }
    }
}
