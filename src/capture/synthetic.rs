//! Synthetic capture devices
//!
//! A moving test-pattern camera driven by its own thread and a sine tone
//! microphone whose `read` blocks for the duration of the samples it returns.
//! Both behave like real drivers from the pipeline's point of view, which
//! makes them useful for development without hardware.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::device::{
    CallbackBuffers, Camera, CameraFacing, CameraProvider, DeviceError, FrameCallback,
    FrameDispatch, Microphone, MicrophoneProvider,
};
use super::frame::{FrameSize, PixelFormat};

/// Preview sizes offered by the test-pattern camera
pub const TEST_PATTERN_SIZES: [FrameSize; 3] = [
    FrameSize::new(320, 240),
    FrameSize::new(640, 480),
    FrameSize::new(1280, 720),
];

/// Duration of audio returned by one tone read
const TONE_BUFFER_MS: u32 = 40;

/// Frame counters of the test-pattern driver
#[derive(Debug, Default)]
pub struct TestPatternStats {
    pub captured: AtomicU64,
    /// Frames skipped because no callback buffer was free
    pub dropped: AtomicU64,
}

/// Camera generating a scrolling NV21 gradient
pub struct TestPatternCamera {
    name: String,
    fps: u32,
    size: FrameSize,
    buffers: CallbackBuffers,
    dispatch: FrameDispatch,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    stats: Arc<TestPatternStats>,
}

impl TestPatternCamera {
    pub fn new(name: impl Into<String>, fps: u32) -> Self {
        Self {
            name: name.into(),
            fps: fps.max(1),
            size: TEST_PATTERN_SIZES[1],
            buffers: CallbackBuffers::new(),
            dispatch: FrameDispatch::new(),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            stats: Arc::new(TestPatternStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<TestPatternStats> {
        &self.stats
    }
}

impl Camera for TestPatternCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_frame_sizes(&self) -> Vec<FrameSize> {
        TEST_PATTERN_SIZES.to_vec()
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Nv21
    }

    fn set_frame_size(&mut self, size: FrameSize) -> Result<(), DeviceError> {
        if !TEST_PATTERN_SIZES.contains(&size) {
            return Err(DeviceError::UnsupportedFrameSize {
                requested: size,
                supported: TEST_PATTERN_SIZES.to_vec(),
            });
        }
        self.size = size;
        Ok(())
    }

    fn callback_buffers(&self) -> CallbackBuffers {
        self.buffers.clone()
    }

    fn set_frame_callback(&mut self, callback: Option<FrameCallback>) {
        self.dispatch.set(callback);
    }

    fn start_preview(&mut self) -> Result<(), DeviceError> {
        if self.thread_handle.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let buffers = self.buffers.clone();
        let dispatch = self.dispatch.clone();
        let size = self.size;
        let interval = Duration::from_micros(1_000_000 / self.fps as u64);

        let handle = thread::Builder::new()
            .name("camera-driver".into())
            .spawn(move || {
                let mut next = Instant::now();
                let mut frame_num = 0u32;

                while running.load(Ordering::Acquire) {
                    next += interval;
                    if let Some(delay) = next.checked_duration_since(Instant::now()) {
                        thread::sleep(delay);
                    }

                    let Some(mut buffer) = buffers.take() else {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    fill_test_pattern(&mut buffer, size, frame_num);
                    frame_num = frame_num.wrapping_add(1);
                    stats.captured.fetch_add(1, Ordering::Relaxed);

                    if let Err(buffer) = dispatch.dispatch(buffer) {
                        buffers.push(buffer);
                    }
                }
                debug!("Test pattern driver stopped after {} frames", frame_num);
            })?;

        self.thread_handle = Some(handle);
        info!("Test pattern camera {} previewing {} @ {}fps", self.name, size, self.fps);
        Ok(())
    }

    fn stop_preview(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TestPatternCamera {
    fn drop(&mut self) {
        self.stop_preview();
    }
}

/// Fill an NV21 buffer with a diagonal gradient that scrolls each frame
fn fill_test_pattern(buffer: &mut [u8], size: FrameSize, frame_num: u32) {
    let width = size.width as usize;
    let y_len = size.pixels().min(buffer.len());
    let shift = frame_num as usize * 4;

    for (i, luma) in buffer[..y_len].iter_mut().enumerate() {
        let x = i % width;
        let y = i / width;
        *luma = ((x + y + shift) & 0xFF) as u8;
    }
    // Neutral chroma
    buffer[y_len..].iter_mut().for_each(|c| *c = 128);
}

/// Hands out test-pattern cameras for either facing
pub struct TestPatternProvider {
    pub fps: u32,
}

impl CameraProvider for TestPatternProvider {
    fn open(&self, facing: CameraFacing) -> Result<Box<dyn Camera>, DeviceError> {
        let name = match facing {
            CameraFacing::Front => "test-pattern-front",
            CameraFacing::Back => "test-pattern-back",
        };
        Ok(Box::new(TestPatternCamera::new(name, self.fps)))
    }
}

/// Microphone producing a stereo sine tone in real time
pub struct ToneMicrophone {
    sample_rate: u32,
    channels: u16,
    tone_hz: f32,
    sample_idx: u64,
    next_deadline: Option<Instant>,
    recording: bool,
}

impl Microphone for ToneMicrophone {
    fn start_recording(&mut self) -> Result<(), DeviceError> {
        self.recording = true;
        self.next_deadline = Some(Instant::now());
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        if !self.recording {
            return Err(DeviceError::Read("microphone is not recording".into()));
        }

        let channels = self.channels as usize;
        let frames = buf.len() / channels;
        for frame in buf[..frames * channels].chunks_exact_mut(channels) {
            let t = self.sample_idx as f32 / self.sample_rate as f32;
            let value = ((2.0 * PI * self.tone_hz * t).sin() * 0.25 * i16::MAX as f32) as i16;
            frame.iter_mut().for_each(|s| *s = value);
            self.sample_idx += 1;
        }

        // Real devices block until the samples exist
        let duration = Duration::from_secs_f64(frames as f64 / self.sample_rate as f64);
        let deadline = self.next_deadline.unwrap_or_else(Instant::now) + duration;
        if let Some(delay) = deadline.checked_duration_since(Instant::now()) {
            thread::sleep(delay);
        }
        self.next_deadline = Some(deadline);

        Ok(frames * channels)
    }

    fn stop(&mut self) {
        self.recording = false;
    }
}

pub struct ToneMicrophoneProvider {
    pub tone_hz: f32,
}

impl MicrophoneProvider for ToneMicrophoneProvider {
    fn min_buffer_size(&self, sample_rate: u32, channels: u16) -> Result<usize, DeviceError> {
        Ok((sample_rate * TONE_BUFFER_MS / 1000) as usize * channels as usize * 2)
    }

    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        _buffer_bytes: usize,
    ) -> Result<Box<dyn Microphone>, DeviceError> {
        if sample_rate == 0 || channels == 0 {
            return Err(DeviceError::Open(format!(
                "unsupported format {}Hz/{}ch",
                sample_rate, channels
            )));
        }
        info!("Tone microphone: {}Hz tone at {}Hz, {} channels", self.tone_hz, sample_rate, channels);
        Ok(Box::new(ToneMicrophone {
            sample_rate,
            channels,
            tone_hz: self.tone_hz,
            sample_idx: 0,
            next_deadline: None,
            recording: false,
        }))
    }
}
