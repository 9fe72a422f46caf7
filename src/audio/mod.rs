/// The `audio` module owns everything that touches samples: the PCM wire
/// codec, microphone capture, and gapless playback scheduling.
pub mod capture;
pub mod output;
pub mod pcm;
pub mod playback;

/// Microphone capture rate sent to the remote session (Hz).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Samples per capture frame handed to the pipeline.
pub const CAPTURE_FRAME_SIZE: usize = 4096;
/// Rate of the audio the remote session speaks back with (Hz).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// An immutable run of mono f32 samples plus the rate they were recorded at.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioChunk {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels.max(1) as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Error type for capture, codec and playback operations
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("Malformed audio data: {0}")]
    MalformedAudioData(String),
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Failed to release audio resource: {0}")]
    ResourceTeardownFailure(String),
}

/// Down-mix interleaved multi-channel audio to mono by averaging channels.
pub(crate) fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample audio using simple linear interpolation.
/// Good enough for speech; not audiophile-grade.
pub(crate) fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = ((input.len() as f64) / ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < input.len() {
            input[idx] as f64 * (1.0 - frac) + input[idx + 1] as f64 * frac
        } else {
            input.get(idx).copied().unwrap_or(0.0) as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Linear resampler for a continuous stream cut into arbitrary buffers.
///
/// The fractional read position and the last input sample carry over between
/// calls, so the output matches resampling the whole stream at once and the
/// long-run rate is exact.
pub(crate) struct StreamResampler {
    step: f64,
    /// Next output position in input samples, counted from `prev` when set.
    phase: f64,
    prev: Option<f32>,
    passthrough: bool,
}

impl StreamResampler {
    pub(crate) fn new(from_rate: u32, to_rate: u32) -> Self {
        let passthrough = from_rate == to_rate || from_rate == 0 || to_rate == 0;
        Self {
            step: if passthrough { 1.0 } else { from_rate as f64 / to_rate as f64 },
            phase: 0.0,
            prev: None,
            passthrough,
        }
    }

    pub(crate) fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.passthrough {
            out.extend_from_slice(input);
            return;
        }
        if input.is_empty() {
            return;
        }

        let offset = usize::from(self.prev.is_some());
        let prev = self.prev.unwrap_or(0.0);
        let len = input.len() + offset;
        let sample_at = |i: usize| if i < offset { prev } else { input[i - offset] };

        loop {
            let idx = self.phase as usize;
            if idx + 1 >= len {
                break;
            }
            let frac = self.phase - idx as f64;
            let a = sample_at(idx) as f64;
            let b = sample_at(idx + 1) as f64;
            out.push((a + (b - a) * frac) as f32);
            self.phase += self.step;
        }

        // Re-base on the last input sample, which becomes `prev`.
        self.phase -= (len - 1) as f64;
        self.prev = input.last().copied();
    }
}
