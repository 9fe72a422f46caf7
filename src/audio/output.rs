// output.rs: speaker output via cpal.
//
// Scheduled buffers sit on a frame-indexed timeline. The device callback
// renders whatever overlaps the current block and advances the clock; buffers
// whose last frame has been rendered fire their `on_ended` callback after the
// timeline lock is released.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::playback::{AudioOutput, EndedCallback, Speaker};
use super::{resample, AudioChunk, AudioError};

// ─── Timeline ──────────────────────────────────────────────────────────────────

struct TimelineEntry {
    start_frame: u64,
    samples: Vec<f32>,
    on_ended: Option<EndedCallback>,
}

impl TimelineEntry {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Device frame nearest to `seconds` on a clock running at `rate` Hz.
pub fn frame_at(seconds: f64, rate: u32) -> u64 {
    (seconds.max(0.0) * rate as f64).round() as u64
}

/// Mono buffers positioned on an output clock counted in device frames.
pub struct Timeline {
    sample_rate: u32,
    position: u64,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            position: 0,
            entries: Vec::new(),
        }
    }

    /// Clock in seconds: frames rendered so far over the device rate.
    pub fn current_time(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    /// Frames rendered so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Buffers not yet fully rendered.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Queue device-rate mono `samples` at `start_frame`.
    ///
    /// If the device already played past `start_frame`, the late head of the
    /// buffer is dropped rather than shifting it, so the buffer still ends on
    /// its own frame and never runs into the next one.
    pub fn insert(&mut self, start_frame: u64, mut samples: Vec<f32>, on_ended: EndedCallback) {
        let mut start_frame = start_frame;
        if start_frame < self.position {
            let late = ((self.position - start_frame) as usize).min(samples.len());
            samples.drain(..late);
            start_frame = self.position;
        }
        self.entries.push(TimelineEntry {
            start_frame,
            samples,
            on_ended: Some(on_ended),
        });
    }

    /// Fill `out` (interleaved, `channels` wide) and advance the clock.
    /// Returns the callbacks of buffers that finished within this block.
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<EndedCallback> {
        let channels = channels.max(1);
        out.fill(0.0);

        let frames = (out.len() / channels) as u64;
        let block_start = self.position;
        let block_end = block_start + frames;

        for entry in &self.entries {
            let from = entry.start_frame.max(block_start);
            let to = entry.end_frame().min(block_end);
            for frame in from..to {
                let sample = entry.samples[(frame - entry.start_frame) as usize];
                let base = (frame - block_start) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }

        self.position = block_end;

        let mut ended = Vec::new();
        self.entries.retain_mut(|entry| {
            if entry.end_frame() <= block_end {
                if let Some(cb) = entry.on_ended.take() {
                    ended.push(cb);
                }
                false
            } else {
                true
            }
        });
        ended
    }
}

// ─── TimelineOutput ────────────────────────────────────────────────────────────

/// [`AudioOutput`] over a shared [`Timeline`], independent of any device.
///
/// A chunk scheduled for `[start_at, start_at + duration)` occupies exactly
/// the device frames `frame_at(start_at)..frame_at(start_at + duration)`.
/// Back-to-back chunks share a boundary value, so they tile with no overlap
/// whatever the ratio between chunk and device rate.
pub struct TimelineOutput {
    timeline: Arc<Mutex<Timeline>>,
    chunk_rate: u32,
    device_rate: u32,
}

impl TimelineOutput {
    pub fn new(timeline: Arc<Mutex<Timeline>>, chunk_rate: u32) -> Self {
        let device_rate = lock_timeline(&timeline).sample_rate();
        Self {
            timeline,
            chunk_rate,
            device_rate,
        }
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }
}

impl AudioOutput for TimelineOutput {
    fn current_time(&self) -> f64 {
        lock_timeline(&self.timeline).current_time()
    }

    fn schedule(
        &mut self,
        chunk: AudioChunk,
        start_at: f64,
        on_ended: EndedCallback,
    ) -> Result<(), AudioError> {
        let from_rate = if chunk.sample_rate == 0 { self.chunk_rate } else { chunk.sample_rate };
        let start_frame = frame_at(start_at, self.device_rate);
        let end_frame = frame_at(start_at + chunk.duration(), self.device_rate).max(start_frame);

        let samples = fit_to_frames(
            resample(&chunk.samples, from_rate, self.device_rate),
            (end_frame - start_frame) as usize,
        );
        lock_timeline(&self.timeline).insert(start_frame, samples, on_ended);
        Ok(())
    }

    fn reached(&self, time: f64) -> bool {
        let timeline = lock_timeline(&self.timeline);
        timeline.pending() == 0 || timeline.position() >= frame_at(time, self.device_rate)
    }

    fn close(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

fn lock_timeline(timeline: &Mutex<Timeline>) -> MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pad (holding the last sample) or truncate to exactly `frames`.
fn fit_to_frames(mut samples: Vec<f32>, frames: usize) -> Vec<f32> {
    let hold = samples.last().copied().unwrap_or(0.0);
    samples.resize(frames, hold);
    samples
}

// ─── CpalSpeaker ───────────────────────────────────────────────────────────────

/// The system default output device via cpal.
///
/// Chunks arrive at the session's output rate and are resampled to whatever
/// rate the device runs at. The stream is owned by a dedicated OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSpeaker;

impl Speaker for CpalSpeaker {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioOutput>, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Arc<Mutex<Timeline>>, AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("ecosnap-speaker".into())
            .spawn(move || {
                let (stream, timeline) = match build_output_stream() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::Device(format!(
                        "start output stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(timeline));

                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Speaker released");
            })
            .map_err(|e| AudioError::Device(format!("spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(timeline)) => {
                let inner = TimelineOutput::new(timeline, sample_rate);
                log::info!(
                    "Output context opened ({sample_rate} Hz chunks, device {} Hz)",
                    inner.device_rate()
                );
                Ok(Box::new(CpalOutput {
                    inner,
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Device(
                    "output thread exited before the stream started".into(),
                ))
            }
        }
    }
}

struct CpalOutput {
    inner: TimelineOutput,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    fn schedule(
        &mut self,
        chunk: AudioChunk,
        start_at: f64,
        on_ended: EndedCallback,
    ) -> Result<(), AudioError> {
        if self.thread.is_none() {
            return Err(AudioError::Device("output context is closed".into()));
        }
        self.inner.schedule(chunk, start_at, on_ended)
    }

    fn reached(&self, time: f64) -> bool {
        self.inner.reached(time)
    }

    fn close(&mut self) -> Result<(), AudioError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| {
                AudioError::ResourceTeardownFailure("output thread panicked".into())
            })?;
        }
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("{e}");
        }
    }
}

fn build_output_stream() -> Result<(cpal::Stream, Arc<Mutex<Timeline>>), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no output device found".into()))?;

    log::info!(
        "Speaker device: {}",
        device.name().unwrap_or_else(|_| "<unnamed>".into())
    );

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Device(format!("output config: {e}")))?;
    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let timeline = Arc::new(Mutex::new(Timeline::new(device_rate)));
    let render_timeline = Arc::clone(&timeline);
    let err_fn = |err: cpal::StreamError| log::error!("Speaker stream error: {err}");

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render_block(&render_timeline, data, channels);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    render_block(&render_timeline, &mut scratch, channels);
                    for (out, &s) in data.iter_mut().zip(&scratch) {
                        *out = super::pcm::quantize(s);
                    }
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(AudioError::Device(format!(
                "Unsupported sample format: {other:?}"
            )))
        }
    }
    .map_err(|e| AudioError::Device(format!("build output stream: {e}")))?;

    Ok((stream, timeline))
}

/// Render one device block and fire finished callbacks outside the lock.
fn render_block(timeline: &Mutex<Timeline>, data: &mut [f32], channels: usize) {
    let ended = match timeline.lock() {
        Ok(mut t) => t.render(data, channels),
        Err(_) => {
            data.fill(0.0);
            return;
        }
    };
    for cb in ended {
        cb();
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::PlaybackScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, EndedCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn clock_advances_with_rendered_frames() {
        let mut timeline = Timeline::new(1000);
        let mut out = vec![0.0; 250];
        timeline.render(&mut out, 1);
        assert_eq!(timeline.current_time(), 0.25);
    }

    #[test]
    fn buffer_starts_at_its_scheduled_frame() {
        let mut timeline = Timeline::new(10);
        let (_, cb) = counter();
        timeline.insert(3, vec![1.0, 2.0], cb);

        let mut out = vec![0.0; 6];
        timeline.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0, 2.0, 0.0]);
    }

    #[test]
    fn back_to_back_buffers_render_contiguously_across_blocks() {
        let mut timeline = Timeline::new(10);
        let (_, a) = counter();
        let (_, b) = counter();
        timeline.insert(0, vec![1.0, 1.0, 1.0], a);
        timeline.insert(3, vec![2.0, 2.0], b);

        let mut first = vec![0.0; 2];
        let mut second = vec![0.0; 4];
        timeline.render(&mut first, 1);
        timeline.render(&mut second, 1);
        assert_eq!(first, vec![1.0, 1.0]);
        assert_eq!(second, vec![1.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn stereo_output_duplicates_mono_samples() {
        let mut timeline = Timeline::new(10);
        let (_, cb) = counter();
        timeline.insert(0, vec![0.5], cb);
        let mut out = vec![0.0; 4];
        timeline.render(&mut out, 2);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn ended_fires_once_after_last_frame() {
        let mut timeline = Timeline::new(10);
        let (count, cb) = counter();
        timeline.insert(0, vec![1.0; 5], cb);

        let mut out = vec![0.0; 3];
        for cb in timeline.render(&mut out, 1) {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timeline.pending(), 1);

        for cb in timeline.render(&mut out, 1) {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timeline.pending(), 0);

        for cb in timeline.render(&mut out, 1) {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_buffer_loses_its_head_but_keeps_its_end() {
        let mut timeline = Timeline::new(10);
        let mut out = vec![0.0; 5];
        timeline.render(&mut out, 1);

        let (_, cb) = counter();
        timeline.insert(3, vec![1.0, 2.0, 3.0, 4.0], cb);
        timeline.render(&mut out, 1);
        assert_eq!(out, vec![3.0, 4.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn frame_at_rounds_to_nearest_frame() {
        assert_eq!(frame_at(0.0, 44_100), 0);
        assert_eq!(frame_at(4.0 / 24_000.0, 44_100), 7);
        assert_eq!(frame_at(5.0 / 24_000.0, 44_100), 9);
        assert_eq!(frame_at(-1.0, 44_100), 0);
    }

    #[test]
    fn short_chunks_tile_on_the_device_grid() {
        let timeline = Arc::new(Mutex::new(Timeline::new(44_100)));
        let mut output = TimelineOutput::new(Arc::clone(&timeline), 24_000);

        let first = AudioChunk::mono(vec![0.1; 4], 24_000);
        let first_end = first.duration();
        output.schedule(first, 0.0, Box::new(|| {})).unwrap();
        output
            .schedule(AudioChunk::mono(vec![0.1; 1], 24_000), first_end, Box::new(|| {}))
            .unwrap();

        let mut out = vec![0.0; 12];
        timeline.lock().unwrap().render(&mut out, 1);
        // 4 + 1 samples at 24 kHz end on frame 9 at 44.1 kHz.
        assert!(out[..9].iter().all(|&s| (s - 0.1).abs() < 1e-6), "{out:?}");
        assert!(out[9..].iter().all(|&s| s == 0.0), "{out:?}");
    }

    /// Drives the scheduler over the device timeline at 44.1 kHz, one frame
    /// per block: no frame may be doubled or silent, and speaking must
    /// clear once the last buffer ends.
    #[test]
    fn scheduler_over_timeline_is_gapless_and_clears_speaking() {
        let timeline = Arc::new(Mutex::new(Timeline::new(44_100)));
        let output = TimelineOutput::new(Arc::clone(&timeline), 24_000);
        let mut scheduler = PlaybackScheduler::new(Box::new(output));
        scheduler.reset();

        let sizes = [4usize, 1, 1001, 960, 2400, 7, 333];
        let ended = Arc::new(AtomicUsize::new(0));
        for &n in &sizes {
            let e = Arc::clone(&ended);
            scheduler
                .enqueue(
                    vec![0.1; n],
                    Box::new(move || {
                        e.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        let total = frame_at(scheduler.cursor().unwrap(), 44_100) as usize;

        let mut rendered = Vec::with_capacity(total + 16);
        let mut handled = 0;
        let mut frame = [0.0f32; 1];
        for _ in 0..total + 16 {
            render_block(&timeline, &mut frame, 1);
            rendered.push(frame[0]);
            while handled < ended.load(Ordering::SeqCst) {
                handled += 1;
                let speaking = scheduler.buffer_ended();
                assert_eq!(speaking, handled < sizes.len(), "after buffer {handled}");
            }
        }

        assert_eq!(ended.load(Ordering::SeqCst), sizes.len());
        assert!(!scheduler.is_speaking());
        for (i, &s) in rendered[..total].iter().enumerate() {
            assert!((s - 0.1).abs() < 1e-6, "frame {i} = {s}");
        }
        assert!(rendered[total..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn reached_uses_device_frames() {
        let timeline = Arc::new(Mutex::new(Timeline::new(44_100)));
        let mut output = TimelineOutput::new(Arc::clone(&timeline), 24_000);
        let chunk = AudioChunk::mono(vec![0.1; 5], 24_000);
        let end = chunk.duration();
        output.schedule(chunk, 0.0, Box::new(|| {})).unwrap();
        assert!(!output.reached(end));

        let mut out = vec![0.0; 9];
        timeline.lock().unwrap().render(&mut out, 1);
        // Clock is 9/44100 s, a little short of `end` in seconds.
        assert!(output.current_time() < end);
        assert!(output.reached(end));
    }

    #[test]
    fn render_block_runs_callbacks_without_holding_lock() {
        let timeline = Arc::new(Mutex::new(Timeline::new(10)));
        let reentry = Arc::clone(&timeline);
        let relocked = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&relocked);
        timeline.lock().unwrap().insert(
            0,
            vec![1.0],
            Box::new(move || {
                // Would deadlock if the timeline were still locked.
                if reentry.try_lock().is_ok() {
                    flag.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        let mut out = vec![0.0; 2];
        render_block(&timeline, &mut out, 1);
        assert_eq!(relocked.load(Ordering::SeqCst), 1);
    }
}
