// live_session.rs: lifecycle of one live Eco-Coach voice session.
//
//   Idle -> Connecting -> Listening <-> Speaking -> Closed
//                 \______________\__________\____-> Error
//
// A run owns the output context, the playback scheduler, the microphone
// capture and (via the shared slot) the remote connection. Every run carries
// an epoch; callbacks belonging to an older run are ignored. All device and
// cursor state is serialised through one mutex, while three pump tasks move
// data between the microphone, the connection and the speaker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch, Mutex as TokioMutex};

use crate::ai::{AiError, InboundRx, LiveConfig, LiveConnection, LiveProvider, MediaChunk, ServerEvent};
use crate::audio::capture::{CapturePipeline, Microphone, ScopedCapture};
use crate::audio::playback::{PlaybackScheduler, Speaker};
use crate::audio::{pcm, AudioError, OUTPUT_SAMPLE_RATE};

/// Capture frames allowed to wait for the transport before new ones are dropped.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 32;

/// User-visible lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Listening,
    /// Connection open and the coach's audio is playing
    Speaking,
    Closed,
    Error(String),
}

impl SessionState {
    /// A run exists (or is being set up); `start` is rejected.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Listening | SessionState::Speaking
        )
    }

    /// The connection is up.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Closed => "closed",
            SessionState::Error(_) => "error",
        }
    }
}

/// Errors surfaced by `LiveSession::start`
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A live session is already running")]
    AlreadyActive,
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Connection(#[from] AiError),
    #[error(transparent)]
    Audio(AudioError),
}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
            other => SessionError::Audio(other),
        }
    }
}

struct ActiveRun {
    epoch: u64,
    scheduler: Option<PlaybackScheduler>,
    capture: Option<ScopedCapture>,
    shutdown: watch::Sender<bool>,
}

struct Core {
    state: SessionState,
    epoch: u64,
    run: Option<ActiveRun>,
}

struct Shared {
    core: Mutex<Core>,
    state_tx: watch::Sender<SessionState>,
    connection: TokioMutex<Option<(u64, Box<dyn LiveConnection>)>>,
}

/// A restartable duplex voice session.
pub struct LiveSession {
    provider: Arc<dyn LiveProvider>,
    microphone: Arc<dyn Microphone>,
    speaker: Arc<dyn Speaker>,
    config: LiveConfig,
    pipeline: CapturePipeline,
    outbound_queue: usize,
    shared: Arc<Shared>,
}

impl LiveSession {
    pub fn new(
        provider: Arc<dyn LiveProvider>,
        microphone: Arc<dyn Microphone>,
        speaker: Arc<dyn Speaker>,
        config: LiveConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let pipeline = CapturePipeline::new(
            config.input_sample_rate,
            crate::audio::CAPTURE_FRAME_SIZE,
        );
        Self {
            provider,
            microphone,
            speaker,
            config,
            pipeline,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: SessionState::Idle,
                    epoch: 0,
                    run: None,
                }),
                state_tx,
                connection: TokioMutex::new(None),
            }),
        }
    }

    pub fn with_outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock_core().state.clone()
    }

    /// Watch lifecycle changes (UI feedback).
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_speaking(&self) -> bool {
        self.state() == SessionState::Speaking
    }

    /// Playback cursor of the current run, in output-clock seconds.
    pub fn playback_cursor(&self) -> Option<f64> {
        self.shared
            .lock_core()
            .run
            .as_ref()
            .and_then(|run| run.scheduler.as_ref())
            .and_then(|scheduler| scheduler.cursor())
    }

    /// Frames the microphone has delivered during the current run.
    pub fn frames_captured(&self) -> u64 {
        self.shared
            .lock_core()
            .run
            .as_ref()
            .and_then(|run| run.capture.as_ref())
            .map(|c| c.frames_delivered())
            .unwrap_or(0)
    }

    /// Open the output, connect, then start the microphone.
    ///
    /// Rejects with [`SessionError::AlreadyActive`] while a run is in
    /// progress; nothing is opened in that case. Any failure leaves the
    /// session in `Error` with every acquired resource released. Device
    /// opens run on the blocking pool.
    pub async fn start(&self) -> Result<(), SessionError> {
        let epoch = {
            let mut core = self.shared.lock_core();
            if core.state.is_active() {
                log::warn!(
                    "Live session start rejected: already {}",
                    core.state.as_str()
                );
                return Err(SessionError::AlreadyActive);
            }

            core.epoch += 1;
            let epoch = core.epoch;
            let (shutdown, _) = watch::channel(false);
            core.run = Some(ActiveRun {
                epoch,
                scheduler: None,
                capture: None,
                shutdown,
            });
            self.shared.transition(&mut core, SessionState::Connecting);
            epoch
        };

        let speaker = Arc::clone(&self.speaker);
        let opened = tokio::task::spawn_blocking(move || speaker.open(OUTPUT_SAMPLE_RATE))
            .await
            .unwrap_or_else(|e| Err(AudioError::Device(format!("output open task failed: {e}"))));
        let output = match opened {
            Ok(output) => output,
            Err(e) => {
                log::error!("Live session: cannot open output context: {e}");
                self.shared
                    .teardown(Some(epoch), SessionState::Error(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };
        let mut scheduler = PlaybackScheduler::new(output);
        scheduler.reset();
        let late = {
            let mut core = self.shared.lock_core();
            match core.run.as_mut().filter(|run| run.epoch == epoch) {
                Some(run) => {
                    run.scheduler = Some(scheduler);
                    None
                }
                None => Some(scheduler),
            }
        };
        if let Some(scheduler) = late {
            log::info!("Live session stopped while opening output");
            release_blocking(scheduler).await;
            return Ok(());
        }

        log::info!("Live session: connecting via {}", self.provider.name());
        let (mut connection, inbound) = match self.provider.connect(&self.config).await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Live session connect failed: {e}");
                self.shared
                    .teardown(Some(epoch), SessionState::Error(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };

        {
            // Teardown takes the slot after dropping the run, so checking the
            // epoch under the slot lock means it either sees this connection
            // or the run is already gone.
            let mut slot = self.shared.connection.lock().await;
            if self.shared.is_current(epoch) {
                *slot = Some((epoch, connection));
            } else {
                drop(slot);
                log::info!("Live session stopped while connecting; closing late connection");
                if let Err(e) = connection.close().await {
                    log::warn!("Late connection close failed: {e}");
                }
                return Ok(());
            }
        }

        let (chunk_tx, chunk_rx) = mpsc::channel::<String>(self.outbound_queue);
        let microphone = Arc::clone(&self.microphone);
        let pipeline = self.pipeline;
        let capture = tokio::task::spawn_blocking(move || {
            pipeline.start(microphone.as_ref(), move |encoded| {
                match chunk_tx.try_send(encoded) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("Outbound audio queue full; dropping capture frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::debug!("Outbound audio queue closed; dropping capture frame");
                    }
                }
            })
        })
        .await
        .unwrap_or_else(|e| Err(AudioError::Device(format!("capture start task failed: {e}"))));
        let capture = match capture {
            Ok(capture) => capture,
            Err(e) => {
                log::error!("Live session: microphone unavailable: {e}");
                self.shared
                    .teardown(Some(epoch), SessionState::Error(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };

        let installed = {
            let mut core = self.shared.lock_core();
            let installed = match core.run.as_mut().filter(|run| run.epoch == epoch) {
                Some(run) => {
                    run.capture = Some(capture);
                    Ok(run.shutdown.subscribe())
                }
                None => Err(capture),
            };
            if installed.is_ok() {
                self.shared.transition(&mut core, SessionState::Listening);
            }
            installed
        };
        let shutdown = match installed {
            Ok(shutdown) => shutdown,
            Err(capture) => {
                log::info!("Live session stopped before capture started");
                release_blocking(capture).await;
                self.shared.close_connection(epoch).await;
                return Ok(());
            }
        };

        let (ended_tx, ended_rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(outbound_pump(
            Arc::clone(&self.shared),
            epoch,
            chunk_rx,
            self.config.input_sample_rate,
            shutdown.clone(),
        ));
        tokio::spawn(inbound_pump(
            Arc::clone(&self.shared),
            epoch,
            inbound,
            ended_tx,
            shutdown.clone(),
        ));
        tokio::spawn(playback_pump(
            Arc::clone(&self.shared),
            epoch,
            ended_rx,
            shutdown,
        ));

        log::info!("Live session started");
        Ok(())
    }

    /// Tear down the current run. No-op when nothing is running.
    pub async fn stop(&self) {
        if self.shared.teardown(None, SessionState::Closed).await {
            log::info!("Live session stopped");
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let run = self.shared.lock_core().run.take();
        if let Some(run) = run {
            release_devices(run);
        }
    }
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, core: &mut Core, next: SessionState) {
        if core.state == next {
            return;
        }
        match &next {
            SessionState::Error(msg) => {
                log::info!("Live session: {} -> error ({msg})", core.state.as_str())
            }
            _ => log::info!(
                "Live session: {} -> {}",
                core.state.as_str(),
                next.as_str()
            ),
        }
        core.state = next.clone();
        self.state_tx.send_replace(next);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock_core()
            .run
            .as_ref()
            .is_some_and(|run| run.epoch == epoch)
    }

    /// Release everything the run holds. `epoch: None` targets whatever run
    /// is current. Returns `false` when there was nothing to tear down.
    async fn teardown(&self, epoch: Option<u64>, final_state: SessionState) -> bool {
        let run = {
            let mut core = self.lock_core();
            let current = core.run.as_ref().map(|run| run.epoch);
            if current.is_none() || (epoch.is_some() && epoch != current) {
                return false;
            }
            let Some(run) = core.run.take() else {
                return false;
            };
            self.transition(&mut core, final_state);
            run
        };

        let epoch = run.epoch;
        if let Err(e) = tokio::task::spawn_blocking(move || release_devices(run)).await {
            log::warn!("Teardown: device release task failed: {e}");
        }
        self.close_connection(epoch).await;

        log::debug!("Live session run {epoch} torn down");
        true
    }

    /// Close the connection if `epoch` still owns the slot.
    async fn close_connection(&self, epoch: u64) {
        let connection = {
            let mut slot = self.connection.lock().await;
            let owned = matches!(slot.as_ref(), Some((owner, _)) if *owner == epoch);
            if owned {
                slot.take()
            } else {
                None
            }
        };
        if let Some((_, mut connection)) = connection {
            if let Err(e) = connection.close().await {
                log::warn!("Teardown: connection close failed: {e}");
            }
        }
    }

    /// Decode an inbound chunk and queue it for playback.
    /// A bad chunk is dropped; the session keeps going.
    fn play(&self, epoch: u64, data: &str, ended_tx: &mpsc::UnboundedSender<()>) {
        let samples = match pcm::decode(data) {
            Ok(samples) => samples,
            Err(e) => {
                log::warn!("Dropping inbound audio chunk: {e}");
                return;
            }
        };

        let mut core = self.lock_core();
        if !core.state.is_open() {
            return;
        }
        let Some(scheduler) = core
            .run
            .as_mut()
            .filter(|run| run.epoch == epoch)
            .and_then(|run| run.scheduler.as_mut())
        else {
            return;
        };

        let tx = ended_tx.clone();
        let scheduled = scheduler.enqueue(
            samples,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        let speaking = scheduler.is_speaking();

        match scheduled {
            Ok(slot) => log::debug!(
                "Scheduled {:.0}ms of coach audio at {:.3}s",
                slot.duration * 1000.0,
                slot.start_at
            ),
            Err(e) => log::warn!("Dropping inbound audio chunk: {e}"),
        }

        if speaking && core.state == SessionState::Listening {
            self.transition(&mut core, SessionState::Speaking);
        }
    }

    fn buffer_ended(&self, epoch: u64) {
        let mut core = self.lock_core();
        let speaking = match core.run.as_mut() {
            Some(run) if run.epoch == epoch => match run.scheduler.as_mut() {
                Some(scheduler) => scheduler.buffer_ended(),
                None => return,
            },
            _ => return,
        };
        if !speaking && core.state == SessionState::Speaking {
            self.transition(&mut core, SessionState::Listening);
        }
    }
}

/// Synchronous half of teardown: stop pumps, release microphone and output.
/// Failures are logged so every step still runs.
fn release_devices(run: ActiveRun) {
    let ActiveRun {
        scheduler,
        capture,
        shutdown,
        epoch: _,
    } = run;

    let _ = shutdown.send(true);

    if let Some(mut capture) = capture {
        if let Err(e) = capture.stop() {
            log::warn!("Teardown: microphone release failed: {e}");
        }
    }
    if let Some(mut scheduler) = scheduler {
        if let Err(e) = scheduler.close() {
            log::warn!("Teardown: output context release failed: {e}");
        }
    }
}

/// Drop a device handle on the blocking pool; its Drop joins a thread.
async fn release_blocking<T: Send + 'static>(resource: T) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(resource)).await {
        log::warn!("Device release task failed: {e}");
    }
}

async fn outbound_pump(
    shared: Arc<Shared>,
    epoch: u64,
    mut chunks: mpsc::Receiver<String>,
    sample_rate: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sent: u64 = 0;
    loop {
        let encoded = tokio::select! {
            _ = shutdown.changed() => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let result = {
            let mut slot = shared.connection.lock().await;
            match slot.as_mut() {
                Some((owner, connection)) if *owner == epoch => {
                    connection
                        .send_media(MediaChunk::pcm(encoded, sample_rate))
                        .await
                }
                _ => break,
            }
        };

        if let Err(e) = result {
            log::error!("Live session send failed: {e}");
            shared
                .teardown(Some(epoch), SessionState::Error(e.to_string()))
                .await;
            break;
        }
        sent += 1;
        log::debug!("Sent capture frame #{sent}");
    }
    log::debug!("Outbound pump for run {epoch} ended after {sent} frames");
}

async fn inbound_pump(
    shared: Arc<Shared>,
    epoch: u64,
    mut inbound: InboundRx,
    ended_tx: mpsc::UnboundedSender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = inbound.recv() => event,
        };

        match event {
            Some(Ok(ServerEvent::Audio { data })) => shared.play(epoch, &data, &ended_tx),
            Some(Ok(ServerEvent::TurnComplete)) => log::debug!("Eco-Coach turn complete"),
            Some(Ok(ServerEvent::Interrupted)) => log::debug!("Eco-Coach interrupted"),
            Some(Ok(ServerEvent::SetupComplete)) => {}
            Some(Err(e)) => {
                log::error!("Live session transport error: {e}");
                shared
                    .teardown(Some(epoch), SessionState::Error(e.to_string()))
                    .await;
                return;
            }
            None => {
                log::info!("Live session closed by remote");
                shared.teardown(Some(epoch), SessionState::Closed).await;
                return;
            }
        }
    }
}

async fn playback_pump(
    shared: Arc<Shared>,
    epoch: u64,
    mut ended: mpsc::UnboundedReceiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            done = ended.recv() => match done {
                Some(()) => shared.buffer_ended(epoch),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states_reject_start() {
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Listening.is_active());
        assert!(SessionState::Speaking.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Closed.is_active());
        assert!(!SessionState::Error("x".into()).is_active());
    }

    #[test]
    fn only_listening_and_speaking_are_open() {
        assert!(SessionState::Listening.is_open());
        assert!(SessionState::Speaking.is_open());
        assert!(!SessionState::Connecting.is_open());
    }

    #[test]
    fn permission_denied_maps_to_session_error() {
        let err: SessionError = AudioError::PermissionDenied("declined".into()).into();
        assert!(matches!(err, SessionError::PermissionDenied(ref m) if m == "declined"));

        let err: SessionError = AudioError::Device("gone".into()).into();
        assert!(matches!(err, SessionError::Audio(_)));
    }

    #[test]
    fn connection_error_display_is_transparent() {
        let err: SessionError = AiError::ConnectionError("refused".into()).into();
        assert_eq!(err.to_string(), "Connection failed: refused");
    }
}
