//! Capture orchestrator
//!
//! Both capture paths route through one mutex that guards the encoder and
//! the active gate:
//!
//! ```text
//! camera thread ──┐
//!                 ├──▶ lock(pipeline) ──▶ gate Active? ──▶ encoder.encode_*
//! audio thread  ──┘                        └─ Inactive ──▶ drop
//! ```
//!
//! Whoever takes the lock first is encoded first; nothing is queued or
//! reordered. `close` stops and drains both sources before it takes the lock
//! to shut the encoder down, so shutdown can never overlap an encode call.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, error, info, warn};

use super::session::{SessionCounters, StreamSession};
use super::{StreamError, StreamState, StreamStatus};
use crate::capture::{
    AudioFrame, AudioSource, FrameSize, MicrophoneProvider, SharedCamera, VideoFrame,
    VideoSource, AUDIO_CHANNELS,
};
use crate::crash::log_critical_operation;
use crate::encoder::{Encoder, EncoderParams};

/// Encoder errors are logged on the first occurrence and then every Nth
const ERROR_LOG_INTERVAL: u64 = 100;

/// Whether captured frames reach the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Inactive,
    Active,
}

/// State shared by both routing paths; only touched with the lock held
struct Pipeline {
    gate: Gate,
    encoder: Box<dyn Encoder>,
    counters: SessionCounters,
}

impl Pipeline {
    fn route_video(&mut self, frame: &VideoFrame<'_>) {
        if self.gate == Gate::Inactive {
            self.counters.video_dropped += 1;
            return;
        }
        match self.encoder.encode_video(frame) {
            Ok(bytes) => {
                self.counters.video_encoded += 1;
                self.counters.bytes += bytes as u64;
            }
            Err(e) => {
                self.counters.video_errors += 1;
                if self.counters.video_errors % ERROR_LOG_INTERVAL == 1 {
                    warn!("Video encode failed ({} so far): {}", self.counters.video_errors, e);
                }
            }
        }
    }

    fn route_audio(&mut self, frame: &AudioFrame<'_>) {
        if self.gate == Gate::Inactive {
            self.counters.audio_dropped += 1;
            return;
        }
        match self.encoder.encode_audio(frame) {
            Ok(bytes) => {
                self.counters.audio_encoded += 1;
                self.counters.bytes += bytes as u64;
            }
            Err(e) => {
                self.counters.audio_errors += 1;
                if self.counters.audio_errors % ERROR_LOG_INTERVAL == 1 {
                    warn!("Audio encode failed ({} so far): {}", self.counters.audio_errors, e);
                }
            }
        }
    }
}

fn lock_pipeline(pipeline: &Mutex<Pipeline>) -> MutexGuard<'_, Pipeline> {
    pipeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sources owned by the control path
struct Control {
    video: VideoSource,
    audio: AudioSource,
}

/// Observable lifecycle, readable while an open or close is in progress
#[derive(Default)]
struct Status {
    state: StreamState,
    session: Option<StreamSession>,
}

/// Routes camera and microphone output into a single encoder
pub struct CaptureOrchestrator {
    pipeline: Arc<Mutex<Pipeline>>,
    control: Mutex<Control>,
    status: Mutex<Status>,
    microphones: Arc<dyn MicrophoneProvider>,
}

impl CaptureOrchestrator {
    pub fn new(encoder: Box<dyn Encoder>, microphones: Arc<dyn MicrophoneProvider>) -> Self {
        Self {
            pipeline: Arc::new(Mutex::new(Pipeline {
                gate: Gate::Inactive,
                encoder,
                counters: SessionCounters::default(),
            })),
            control: Mutex::new(Control {
                video: VideoSource::new(),
                audio: AudioSource::new(),
            }),
            status: Mutex::new(Status::default()),
            microphones,
        }
    }

    /// Start both sources and the encoder.
    ///
    /// Device failures stop whatever was already started and are returned.
    /// An encoder that fails to initialize does not fail the call: the sources
    /// keep running with the gate closed and [`StreamStatus::StartedNotEncoding`]
    /// is returned.
    pub fn open(
        &self,
        url: &str,
        camera: SharedCamera,
        frame_size: FrameSize,
        sample_rate: u32,
    ) -> Result<StreamStatus, StreamError> {
        let mut control = self.try_control()?;

        if self.state() != StreamState::Closed {
            return Err(StreamError::AlreadyOpen);
        }
        self.set_state(StreamState::Opening);
        log_critical_operation(&format!("stream_open: {} {} {}Hz", url, frame_size, sample_rate));

        {
            let mut pipeline = lock_pipeline(&self.pipeline);
            pipeline.gate = Gate::Inactive;
            pipeline.counters = SessionCounters::default();
        }

        let video_pipeline = Arc::clone(&self.pipeline);
        let negotiated = match control.video.start(
            camera,
            frame_size,
            Box::new(move |frame: VideoFrame<'_>| {
                lock_pipeline(&video_pipeline).route_video(&frame);
            }),
        ) {
            Ok(size) => size,
            Err(e) => {
                error!("Failed to start video source: {}", e);
                self.set_state(StreamState::Closed);
                return Err(e.into());
            }
        };

        let audio_pipeline = Arc::clone(&self.pipeline);
        if let Err(e) = control.audio.start(
            self.microphones.as_ref(),
            sample_rate,
            Box::new(move |frame: AudioFrame<'_>| {
                lock_pipeline(&audio_pipeline).route_audio(&frame);
            }),
        ) {
            error!("Failed to start audio source: {}", e);
            control.video.stop();
            self.set_state(StreamState::Closed);
            return Err(e.into());
        }

        let params = EncoderParams {
            frame_size: negotiated,
            pixel_format: control.video.pixel_format(),
            sample_rate,
            channels: AUDIO_CHANNELS,
            url: url.to_string(),
        };

        let encoding = {
            let mut pipeline = lock_pipeline(&self.pipeline);
            match pipeline.encoder.init(&params) {
                Ok(()) => {
                    pipeline.gate = Gate::Active;
                    true
                }
                Err(e) => {
                    error!("Encoder failed to initialize, frames will be discarded: {}", e);
                    false
                }
            }
        };

        {
            let mut status = self.lock_status();
            status.state = StreamState::Streaming { encoding };
            status.session = Some(StreamSession::new(url, negotiated, sample_rate, encoding));
        }

        info!(
            "Stream open: {} {} {}Hz{}",
            url,
            negotiated,
            sample_rate,
            if encoding { "" } else { " (not encoding)" }
        );

        Ok(if encoding {
            StreamStatus::Encoding
        } else {
            StreamStatus::StartedNotEncoding
        })
    }

    /// Stop both sources, then shut the encoder down.
    ///
    /// Returns the finished session, or `None` when nothing was open. The
    /// encoder is shut down even if it never initialized.
    pub fn close(&self) -> Result<Option<StreamSession>, StreamError> {
        let mut control = self.try_control()?;

        if self.state() == StreamState::Closed {
            return Ok(None);
        }
        self.set_state(StreamState::Closing);
        log_critical_operation("stream_close");

        // Both threads must be gone before the encoder is torn down
        control.video.stop();
        control.audio.stop();

        let counters = {
            let mut pipeline = lock_pipeline(&self.pipeline);
            pipeline.gate = Gate::Inactive;
            pipeline.encoder.shutdown();
            pipeline.counters
        };
        debug!("Encoder shut down");

        let mut status = self.lock_status();
        status.state = StreamState::Closed;
        let session = status.session.take().map(|mut session| {
            session.finish(counters);
            session
        });

        if let Some(session) = &session {
            info!(
                "Stream closed after {:.1}s: {} video / {} audio frames encoded, {} / {} dropped",
                session.duration_secs(),
                counters.video_encoded,
                counters.audio_encoded,
                counters.video_dropped,
                counters.audio_dropped
            );
        }
        Ok(session)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state(), StreamState::Streaming { .. })
    }

    pub fn state(&self) -> StreamState {
        self.lock_status().state
    }

    /// Snapshot of the open session with its live counters
    pub fn session(&self) -> Option<StreamSession> {
        let mut session = self.lock_status().session.clone()?;
        session.counters = lock_pipeline(&self.pipeline).counters;
        Some(session)
    }

    fn try_control(&self) -> Result<MutexGuard<'_, Control>, StreamError> {
        match self.control.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(StreamError::Busy),
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: StreamState) {
        debug!("Stream state: {}", state);
        self.lock_status().state = state;
    }
}

impl Drop for CaptureOrchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close stream on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::{
        ManualCamera, ManualCameraHandle, MicProbe, ReadStep, ScriptedMicrophoneProvider,
    };
    use crate::capture::{share_camera, PixelFormat};
    use crate::encoder::EncoderError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::{Duration, Instant};

    const URL: &str = "rtmp://localhost/live/test";
    const VGA: FrameSize = FrameSize::new(640, 480);

    /// What the stub encoder saw
    #[derive(Default)]
    struct EncoderProbe {
        inits: Mutex<Vec<EncoderParams>>,
        video: AtomicUsize,
        audio: AtomicUsize,
        shutdowns: AtomicUsize,
        inside: AtomicBool,
        overlaps: AtomicUsize,
        /// Result of the `sources_stopped` check at each shutdown
        stopped_at_shutdown: Mutex<Vec<bool>>,
    }

    struct StubEncoder {
        probe: Arc<EncoderProbe>,
        init_ok: bool,
        work: Duration,
        sources_stopped: Option<Box<dyn Fn() -> bool + Send>>,
    }

    impl StubEncoder {
        fn new(init_ok: bool) -> (Self, Arc<EncoderProbe>) {
            let probe = Arc::new(EncoderProbe::default());
            (
                Self {
                    probe: Arc::clone(&probe),
                    init_ok,
                    work: Duration::ZERO,
                    sources_stopped: None,
                },
                probe,
            )
        }

        /// Simulate a call into the encoder; flags concurrent entry
        fn enter(&self) {
            if self.probe.inside.swap(true, Ordering::SeqCst) {
                self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            if !self.work.is_zero() {
                thread::sleep(self.work);
            }
            self.probe.inside.store(false, Ordering::SeqCst);
        }
    }

    impl Encoder for StubEncoder {
        fn init(&mut self, params: &EncoderParams) -> Result<(), EncoderError> {
            self.enter();
            self.probe.inits.lock().unwrap().push(params.clone());
            if self.init_ok {
                Ok(())
            } else {
                Err(EncoderError::Init("stub refused".into()))
            }
        }

        fn encode_video(&mut self, frame: &VideoFrame<'_>) -> Result<usize, EncoderError> {
            self.enter();
            self.probe.video.fetch_add(1, Ordering::SeqCst);
            Ok(frame.len())
        }

        fn encode_audio(&mut self, frame: &AudioFrame<'_>) -> Result<usize, EncoderError> {
            self.enter();
            self.probe.audio.fetch_add(1, Ordering::SeqCst);
            Ok(frame.len() * 2)
        }

        fn shutdown(&mut self) {
            self.enter();
            if let Some(check) = &self.sources_stopped {
                self.probe.stopped_at_shutdown.lock().unwrap().push(check());
            }
            self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        orchestrator: CaptureOrchestrator,
        encoder: Arc<EncoderProbe>,
        mic: MicProbe,
        camera: ManualCameraHandle,
        shared_camera: SharedCamera,
    }

    impl Fixture {
        fn new(init_ok: bool, microphones: ScriptedMicrophoneProvider) -> Self {
            let (mut encoder, probe) = StubEncoder::new(init_ok);
            let (camera, handle) = ManualCamera::vga();
            let mic = microphones.probe.clone();

            let check_mic = mic.clone();
            let check_camera = handle.clone();
            encoder.sources_stopped = Some(Box::new(move || {
                check_mic.released.load(Ordering::SeqCst)
                    && !check_camera.previewing.load(Ordering::SeqCst)
                    && !check_camera.dispatch.is_registered()
            }));

            Self {
                orchestrator: CaptureOrchestrator::new(Box::new(encoder), Arc::new(microphones)),
                encoder: probe,
                mic,
                camera: handle,
                shared_camera: share_camera(Box::new(camera)),
            }
        }

        fn open(&self) -> Result<StreamStatus, StreamError> {
            self.orchestrator
                .open(URL, Arc::clone(&self.shared_camera), VGA, 44100)
        }

        fn gate(&self) -> Gate {
            lock_pipeline(&self.orchestrator.pipeline).gate
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_vga_scenario_encodes_every_frame_and_shuts_down_once() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());

        assert_eq!(fx.open().unwrap(), StreamStatus::Encoding);

        let inits = fx.encoder.inits.lock().unwrap().clone();
        assert_eq!(
            inits,
            vec![EncoderParams {
                frame_size: VGA,
                pixel_format: PixelFormat::Yuyv,
                sample_rate: 44100,
                channels: 2,
                url: URL.to_string(),
            }]
        );

        // 640x480 YUYV, two bytes per pixel
        assert_eq!(fx.camera.buffers.take().map(|b| b.len()), Some(640 * 480 * 2));
        fx.camera.buffers.push(vec![0; 640 * 480 * 2]);

        for i in 0..10 {
            assert!(fx.camera.capture(i));
        }
        assert_eq!(fx.encoder.video.load(Ordering::SeqCst), 10);

        let session = fx.orchestrator.close().unwrap().unwrap();
        assert_eq!(fx.encoder.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(*fx.encoder.stopped_at_shutdown.lock().unwrap(), vec![true]);
        assert_eq!(session.counters.video_encoded, 10);
        assert_eq!(session.counters.bytes, 10 * 640 * 480 * 2);
        assert!(session.encoding);
    }

    #[test]
    fn test_init_failure_discards_every_frame() {
        let fx = Fixture::new(
            false,
            ScriptedMicrophoneProvider::new(vec![vec![
                ReadStep::Samples(256, 7),
                ReadStep::Samples(256, 7),
                ReadStep::Samples(256, 7),
            ]]),
        );

        assert_eq!(fx.open().unwrap(), StreamStatus::StartedNotEncoding);
        assert_eq!(
            fx.orchestrator.state(),
            StreamState::Streaming { encoding: false }
        );
        assert!(fx.orchestrator.is_streaming());
        assert_eq!(fx.gate(), Gate::Inactive);

        for i in 0..5 {
            assert!(fx.camera.capture(i));
        }
        assert!(wait_until(|| fx.mic.reads.load(Ordering::SeqCst) >= 4));

        let session = fx.orchestrator.close().unwrap().unwrap();
        assert_eq!(fx.encoder.video.load(Ordering::SeqCst), 0);
        assert_eq!(fx.encoder.audio.load(Ordering::SeqCst), 0);
        assert_eq!(session.counters.video_dropped, 5);
        assert_eq!(session.counters.audio_dropped, 3);
        assert!(!session.encoding);
        // Teardown still runs
        assert_eq!(fx.encoder.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_then_close_leaves_nothing_running() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());

        fx.open().unwrap();
        assert_eq!(fx.gate(), Gate::Active);
        fx.orchestrator.close().unwrap();

        assert!(fx.mic.stopped.load(Ordering::SeqCst));
        assert!(fx.mic.released.load(Ordering::SeqCst));
        assert!(!fx.camera.previewing.load(Ordering::SeqCst));
        assert!(!fx.camera.dispatch.is_registered());
        assert_eq!(fx.gate(), Gate::Inactive);
        assert_eq!(fx.orchestrator.state(), StreamState::Closed);
        assert!(!fx.orchestrator.is_streaming());
    }

    #[test]
    fn test_concurrent_sources_never_overlap_in_encoder() {
        let script = (0..200).map(|i| ReadStep::Samples(64, i)).collect();
        let (mut encoder, probe) = StubEncoder::new(true);
        encoder.work = Duration::from_micros(200);
        let (camera, handle) = ManualCamera::vga();
        let microphones = ScriptedMicrophoneProvider::new(vec![script]);
        let mic = microphones.probe.clone();

        let orchestrator = CaptureOrchestrator::new(Box::new(encoder), Arc::new(microphones));
        orchestrator
            .open(URL, share_camera(Box::new(camera)), VGA, 44100)
            .unwrap();

        // Two "device" threads race for the single buffer
        let barrier = Arc::new(Barrier::new(2));
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let handle = handle.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..200u32 {
                        handle.capture(i as u8);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(wait_until(|| mic.reads.load(Ordering::SeqCst) >= 200));
        orchestrator.close().unwrap();

        assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);
        assert!(probe.video.load(Ordering::SeqCst) > 0);
        assert_eq!(probe.audio.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_late_callbacks_never_reach_encoder() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());
        fx.open().unwrap();
        assert!(fx.camera.capture(1));
        fx.orchestrator.close().unwrap();

        // Device fires after close: callback is gone
        assert!(!fx.camera.capture(2));

        // A callback that got past the device before close still sees the gate
        let data = vec![0u8; 640 * 480 * 2];
        let frame = VideoFrame::new(&data, VGA, PixelFormat::Yuyv);
        let samples = [0i16; 64];
        {
            let mut pipeline = lock_pipeline(&fx.orchestrator.pipeline);
            pipeline.route_video(&frame);
            pipeline.route_audio(&AudioFrame::new(&samples, 44100));
        }

        assert_eq!(fx.encoder.video.load(Ordering::SeqCst), 1);
        assert_eq!(fx.encoder.audio.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_reads_never_encode() {
        let fx = Fixture::new(
            true,
            ScriptedMicrophoneProvider::new(vec![vec![
                ReadStep::Error,
                ReadStep::Empty,
                ReadStep::Error,
                ReadStep::Samples(128, 3),
            ]]),
        );
        fx.open().unwrap();
        assert!(wait_until(|| fx.mic.reads.load(Ordering::SeqCst) >= 5));
        let session = fx.orchestrator.close().unwrap().unwrap();

        assert_eq!(fx.encoder.audio.load(Ordering::SeqCst), 1);
        assert_eq!(session.counters.audio_encoded, 1);
        assert_eq!(session.counters.audio_dropped, 0);
    }

    #[test]
    fn test_repeated_open_close_cycles() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());

        for cycle in 1..=3 {
            assert_eq!(fx.open().unwrap(), StreamStatus::Encoding);
            assert_eq!(fx.gate(), Gate::Active);
            assert!(fx.camera.capture(cycle as u8));

            let session = fx.orchestrator.close().unwrap().unwrap();
            assert_eq!(fx.gate(), Gate::Inactive);
            // Counters start fresh each session
            assert_eq!(session.counters.video_encoded, 1);
            assert_eq!(fx.encoder.inits.lock().unwrap().len(), cycle);
            assert_eq!(fx.encoder.shutdowns.load(Ordering::SeqCst), cycle);
        }
        assert_eq!(
            *fx.encoder.stopped_at_shutdown.lock().unwrap(),
            vec![true, true, true]
        );
    }

    #[test]
    fn test_open_twice_is_rejected() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());
        fx.open().unwrap();

        assert!(matches!(fx.open(), Err(StreamError::AlreadyOpen)));
        assert_eq!(fx.encoder.inits.lock().unwrap().len(), 1);
        fx.orchestrator.close().unwrap();
    }

    #[test]
    fn test_busy_while_control_in_progress() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());
        let _guard = fx.orchestrator.control.lock().unwrap();

        assert!(matches!(fx.open(), Err(StreamError::Busy)));
        assert!(matches!(fx.orchestrator.close(), Err(StreamError::Busy)));
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());
        assert!(fx.orchestrator.close().unwrap().is_none());
        assert_eq!(fx.encoder.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsupported_frame_size_fails_open() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());
        let result = fx.orchestrator.open(
            URL,
            Arc::clone(&fx.shared_camera),
            FrameSize::new(1920, 1080),
            44100,
        );

        assert!(matches!(result, Err(StreamError::Device(_))));
        assert_eq!(fx.orchestrator.state(), StreamState::Closed);
        assert!(fx.encoder.inits.lock().unwrap().is_empty());
        // Video is negotiated before the microphone is touched
        assert_eq!(fx.mic.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_microphone_failure_stops_video() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::failing());

        assert!(matches!(fx.open(), Err(StreamError::Device(_))));
        assert!(!fx.camera.previewing.load(Ordering::SeqCst));
        assert!(!fx.camera.dispatch.is_registered());
        assert_eq!(fx.orchestrator.state(), StreamState::Closed);
        assert!(fx.encoder.inits.lock().unwrap().is_empty());

        // The failure does not poison later attempts
        assert!(matches!(fx.open(), Err(StreamError::Device(_))));
    }

    #[test]
    fn test_session_snapshot_has_live_counters() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());
        assert!(fx.orchestrator.session().is_none());

        fx.open().unwrap();
        fx.camera.capture(1);
        fx.camera.capture(2);

        let session = fx.orchestrator.session().unwrap();
        assert_eq!(session.url, URL);
        assert_eq!(session.counters.video_encoded, 2);
        fx.orchestrator.close().unwrap();
    }

    #[test]
    fn test_drop_closes_open_stream() {
        let fx = Fixture::new(true, ScriptedMicrophoneProvider::idle());
        fx.open().unwrap();

        let encoder = Arc::clone(&fx.encoder);
        let mic = fx.mic.clone();
        drop(fx);

        assert_eq!(encoder.shutdowns.load(Ordering::SeqCst), 1);
        assert!(mic.released.load(Ordering::SeqCst));
    }
}
