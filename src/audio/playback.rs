// playback.rs: gapless scheduling of inbound speech on the output clock.
//
// Chunks are placed back-to-back using a cursor that only moves forward.
// A chunk that arrives after the cursor has passed starts "now", leaving a
// gap; chunks never overlap.

use super::{AudioChunk, AudioError, OUTPUT_SAMPLE_RATE};

/// Fired once the output device has rendered the last frame of a buffer.
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Slack when comparing the output clock with the cursor (seconds).
/// Well under one output sample at 24 kHz.
const CLOCK_TOLERANCE: f64 = 1e-6;

/// Factory for output contexts.
pub trait Speaker: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioOutput>, AudioError>;
}

/// An open output context with a readable clock.
pub trait AudioOutput: Send {
    /// Output clock in seconds. Monotonic.
    fn current_time(&self) -> f64;

    /// Start `chunk` at `start_at` on the output clock.
    fn schedule(
        &mut self,
        chunk: AudioChunk,
        start_at: f64,
        on_ended: EndedCallback,
    ) -> Result<(), AudioError>;

    /// Whether playback has finished everything scheduled to end by `time`.
    /// Outputs that place audio on a coarser grid than `f64` seconds
    /// override this with their own notion of position.
    fn reached(&self, time: f64) -> bool {
        self.current_time() + CLOCK_TOLERANCE >= time
    }

    /// Release the device. Pending buffers are discarded.
    fn close(&mut self) -> Result<(), AudioError>;
}

/// Where a chunk landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Owns the output context and the playback cursor.
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    sample_rate: u32,
    cursor: Option<f64>,
    speaking: bool,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self::with_sample_rate(output, OUTPUT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(output: Box<dyn AudioOutput>, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            cursor: None,
            speaking: false,
            closed: false,
        }
    }

    /// Move the cursor to the current output time. Called once per session start.
    pub fn reset(&mut self) {
        let now = self.output.current_time();
        self.cursor = Some(now);
        self.speaking = false;
        log::debug!("Playback cursor reset to {now:.3}s");
    }

    /// Schedule decoded samples right after everything already queued.
    pub fn enqueue(
        &mut self,
        samples: Vec<f32>,
        on_ended: EndedCallback,
    ) -> Result<ScheduledChunk, AudioError> {
        if self.closed {
            return Err(AudioError::Device("output context is closed".into()));
        }

        let now = self.output.current_time();
        let cursor = match self.cursor {
            Some(c) => c,
            None => {
                log::warn!("Playback scheduler used before reset; resetting now");
                self.reset();
                now
            }
        };

        let chunk = AudioChunk::mono(samples, self.sample_rate);
        let start_at = now.max(cursor);
        let duration = chunk.duration();

        if chunk.is_empty() {
            return Ok(ScheduledChunk { start_at, duration });
        }

        if start_at > cursor {
            log::debug!(
                "Playback stalled: {:.1}ms gap before next chunk",
                (start_at - cursor) * 1000.0
            );
        }

        self.output.schedule(chunk, start_at, on_ended)?;
        self.cursor = Some(start_at + duration);
        self.speaking = true;

        Ok(ScheduledChunk { start_at, duration })
    }

    /// Record that one scheduled buffer finished. Returns whether audio is
    /// still playing; only clears once the clock has reached the cursor.
    pub fn buffer_ended(&mut self) -> bool {
        if let Some(cursor) = self.cursor {
            if self.output.reached(cursor) {
                self.speaking = false;
            }
        }
        self.speaking
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Earliest time the next chunk may start.
    pub fn cursor(&self) -> Option<f64> {
        self.cursor
    }

    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    /// Close the output context. Idempotent.
    pub fn close(&mut self) -> Result<(), AudioError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.speaking = false;
        self.output.close()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Output context release failed: {e}");
        }
    }
}
