// capture.rs: microphone capture for the live session.
//
// The device delivers fixed-size mono frames at the capture rate; the
// pipeline encodes each frame to base64 PCM16 and hands it to the transport
// in capture order. Frames are never retained after encoding.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{
    downmix_to_mono, pcm, AudioError, StreamResampler, CAPTURE_FRAME_SIZE, CAPTURE_SAMPLE_RATE,
};

/// Invoked once per captured frame with exactly `frame_size` samples.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Source of microphone frames.
pub trait Microphone: Send + Sync {
    /// Acquire the device and start delivering frames to `on_frame`.
    fn open(
        &self,
        sample_rate: u32,
        frame_size: usize,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn InputStream>, AudioError>;
}

/// An acquired input device. Dropping or stopping it releases the device.
pub trait InputStream: Send {
    fn stop(&mut self) -> Result<(), AudioError>;
}

// ─── CapturePipeline ───────────────────────────────────────────────────────────

/// Frames the microphone and forwards encoded chunks to a sink.
///
/// # Usage
/// ```ignore
/// let pipeline = CapturePipeline::default();
/// let mut capture = pipeline.start(&CpalMicrophone, move |chunk| {
///     let _ = tx.try_send(chunk);
/// })?;
/// // ...
/// capture.stop()?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CapturePipeline {
    sample_rate: u32,
    frame_size: usize,
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new(CAPTURE_SAMPLE_RATE, CAPTURE_FRAME_SIZE)
    }
}

impl CapturePipeline {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            sample_rate,
            frame_size,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Open the microphone and start streaming encoded frames to `on_chunk`.
    ///
    /// Fails with [`AudioError::PermissionDenied`] when no usable microphone
    /// is available.
    pub fn start<F>(&self, mic: &dyn Microphone, mut on_chunk: F) -> Result<ScopedCapture, AudioError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(AtomicU64::new(0));

        let active_flag = Arc::clone(&active);
        let frame_counter = Arc::clone(&frames);
        let on_frame: FrameCallback = Box::new(move |frame: &[f32]| {
            // Disconnected: drop anything the device still hands us.
            if !active_flag.load(Ordering::SeqCst) {
                return;
            }
            let encoded = pcm::encode(frame);
            frame_counter.fetch_add(1, Ordering::SeqCst);
            on_chunk(encoded);
        });

        let stream = mic.open(self.sample_rate, self.frame_size, on_frame)?;
        log::info!(
            "Microphone capture started ({} Hz, {} samples/frame)",
            self.sample_rate,
            self.frame_size
        );

        Ok(ScopedCapture {
            stream: Some(stream),
            active,
            frames,
        })
    }
}

// ─── ScopedCapture ─────────────────────────────────────────────────────────────

/// Owns the live input stream; released on `stop()` or drop.
pub struct ScopedCapture {
    stream: Option<Box<dyn InputStream>>,
    active: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl ScopedCapture {
    /// Disconnect the frame callback and release the device. Idempotent.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        self.active.store(false, Ordering::SeqCst);
        match self.stream.take() {
            Some(mut stream) => {
                let result = stream.stop();
                log::info!(
                    "Microphone capture stopped after {} frames",
                    self.frames_delivered()
                );
                result
            }
            None => Ok(()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

impl Drop for ScopedCapture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Microphone release failed: {e}");
        }
    }
}

// ─── Framer ────────────────────────────────────────────────────────────────────

/// Turns arbitrary device buffers into fixed-size mono frames at the target rate.
pub struct Framer {
    channels: usize,
    resampler: StreamResampler,
    frame_size: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(device_rate: u32, channels: usize, target_rate: u32, frame_size: usize) -> Self {
        Self {
            channels: channels.max(1),
            resampler: StreamResampler::new(device_rate, target_rate),
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Feed interleaved device samples; `emit` runs once per completed frame.
    pub fn push<F>(&mut self, interleaved: &[f32], mut emit: F)
    where
        F: FnMut(&[f32]),
    {
        let mono = downmix_to_mono(interleaved, self.channels);
        self.resampler.process(&mono, &mut self.pending);

        let mut start = 0;
        while self.pending.len() - start >= self.frame_size {
            emit(&self.pending[start..start + self.frame_size]);
            start += self.frame_size;
        }
        self.pending.drain(..start);
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ─── CpalMicrophone ────────────────────────────────────────────────────────────

/// The system default input device via cpal.
///
/// The cpal stream lives on a dedicated OS thread because streams are `!Send`
/// on some backends; the returned handle signals that thread to drop it.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl Microphone for CpalMicrophone {
    fn open(
        &self,
        sample_rate: u32,
        frame_size: usize,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn InputStream>, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("ecosnap-mic".into())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, frame_size, on_frame) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::Device(format!(
                        "start input stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Parked until stop() or the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Microphone released");
            })
            .map_err(|e| AudioError::Device(format!("spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalInputStream {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Device(
                    "capture thread exited before the stream started".into(),
                ))
            }
        }
    }
}

struct CpalInputStream {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputStream for CpalInputStream {
    fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| {
                AudioError::ResourceTeardownFailure("capture thread panicked".into())
            })?;
        }
        Ok(())
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("{e}");
        }
    }
}

fn build_input_stream(
    target_rate: u32,
    frame_size: usize,
    mut on_frame: FrameCallback,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::PermissionDenied("no microphone found".into()))?;

    log::info!(
        "Microphone device: {}",
        device.name().unwrap_or_else(|_| "<unnamed>".into())
    );

    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            AudioError::PermissionDenied("microphone is not available".into())
        }
        other => AudioError::Device(format!("input config: {other}")),
    })?;

    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    log::info!("Microphone config: {device_rate}Hz, {channels} ch, {sample_format:?}");

    let config: cpal::StreamConfig = supported.into();
    let mut framer = Framer::new(device_rate, channels, target_rate, frame_size);
    let err_fn = |err: cpal::StreamError| log::error!("Microphone stream error: {err}");

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                framer.push(data, &mut on_frame);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                framer.push(&floats, &mut on_frame);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data
                    .iter()
                    .map(|&s| (s as f32 / u16::MAX as f32) * 2.0 - 1.0)
                    .collect();
                framer.push(&floats, &mut on_frame);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(AudioError::Device(format!(
                "Unsupported sample format: {other:?}"
            )))
        }
    };

    stream.map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::PermissionDenied("microphone is not available".into())
        }
        other => AudioError::Device(format!("build input stream: {other}")),
    })
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Holds the frame callback so tests can drive it by hand.
    #[derive(Default)]
    struct ManualMic {
        callback: Arc<Mutex<Option<FrameCallback>>>,
        releases: Arc<AtomicU64>,
        deny: bool,
    }

    struct ManualStream {
        callback: Arc<Mutex<Option<FrameCallback>>>,
        releases: Arc<AtomicU64>,
    }

    impl InputStream for ManualStream {
        fn stop(&mut self) -> Result<(), AudioError> {
            self.callback.lock().unwrap().take();
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Microphone for ManualMic {
        fn open(
            &self,
            _sample_rate: u32,
            _frame_size: usize,
            on_frame: FrameCallback,
        ) -> Result<Box<dyn InputStream>, AudioError> {
            if self.deny {
                return Err(AudioError::PermissionDenied("user declined".into()));
            }
            *self.callback.lock().unwrap() = Some(on_frame);
            Ok(Box::new(ManualStream {
                callback: Arc::clone(&self.callback),
                releases: Arc::clone(&self.releases),
            }))
        }
    }

    impl ManualMic {
        fn emit(&self, frame: &[f32]) {
            if let Some(cb) = self.callback.lock().unwrap().as_mut() {
                cb(frame);
            }
        }
    }

    #[test]
    fn framer_emits_exact_frames_and_keeps_remainder() {
        let mut framer = Framer::new(16_000, 1, 16_000, 4);
        let mut frames = Vec::new();
        framer.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![1.0, 2.0, 3.0, 4.0]]);
        assert_eq!(framer.pending(), 2);

        framer.push(&[7.0, 8.0], |f| frames.push(f.to_vec()));
        assert_eq!(frames[1], vec![5.0, 6.0, 7.0, 8.0]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn framer_does_not_drift_across_device_buffers() {
        // Two seconds of 44.1 kHz audio in 512-frame buffers is 32000 samples
        // at 16 kHz; resampling each buffer on its own would produce 32042.
        let mut framer = Framer::new(44_100, 1, 16_000, 1000);
        let input = vec![0.1f32; 88_200];
        let mut frames = 0;
        for buf in input.chunks(512) {
            framer.push(buf, |_| frames += 1);
        }
        let produced = frames * 1000 + framer.pending();
        assert!((produced as i64 - 32_000).abs() <= 1, "got {produced}");
    }

    #[test]
    fn framer_downmixes_and_resamples() {
        // 48 kHz stereo -> 16 kHz mono: 3 stereo frames become 1 sample.
        let mut framer = Framer::new(48_000, 2, 16_000, 4096);
        let interleaved = vec![0.5f32; 4800 * 2];
        let mut count = 0;
        framer.push(&interleaved, |f| {
            assert_eq!(f.len(), 4096);
            assert!(f.iter().all(|&s| (s - 0.5).abs() < 1e-6));
            count += 1;
        });
        assert_eq!(count, 0);
        assert_eq!(framer.pending(), 1600);
    }

    #[test]
    fn pipeline_encodes_frames_in_order() {
        let mic = ManualMic::default();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let mut capture = CapturePipeline::default()
            .start(&mic, move |chunk| sink.lock().unwrap().push(chunk))
            .unwrap();

        mic.emit(&[0.0; 4]);
        mic.emit(&[0.5; 4]);
        mic.emit(&[-0.5; 4]);

        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(pcm::decode(&sent[1]).unwrap(), vec![0.5; 4]);
        assert_eq!(pcm::decode(&sent[2]).unwrap(), vec![-0.5; 4]);
        assert_eq!(capture.frames_delivered(), 3);
        capture.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent_and_releases_once() {
        let mic = ManualMic::default();
        let mut capture = CapturePipeline::default().start(&mic, |_| {}).unwrap();
        assert!(capture.is_active());

        capture.stop().unwrap();
        capture.stop().unwrap();
        drop(capture);

        assert_eq!(mic.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frames_after_stop_are_not_delivered() {
        let mic = ManualMic::default();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let mut capture = CapturePipeline::default()
            .start(&mic, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Grab the callback before stop clears it, as a device thread would.
        let mut cb = mic.callback.lock().unwrap().take().unwrap();
        capture.stop().unwrap();
        cb(&[0.0; 4]);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_releases_microphone() {
        let mic = ManualMic::default();
        {
            let _capture = CapturePipeline::default().start(&mic, |_| {}).unwrap();
        }
        assert_eq!(mic.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn denied_microphone_surfaces_permission_error() {
        let mic = ManualMic {
            deny: true,
            ..Default::default()
        };
        let result = CapturePipeline::default().start(&mic, |_| {});
        assert!(matches!(result, Err(AudioError::PermissionDenied(_))));
    }
}
