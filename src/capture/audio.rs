//! Audio frame grabber
//!
//! Opens the microphone at 16-bit stereo PCM and runs a dedicated capture
//! thread that blocks on `read` and hands every non-empty block to a handler.
//!
//! ```text
//! Microphone::read (blocking) ──▶ n > 0 ──▶ handler(AudioFrame)
//!        ▲                        n = 0 ──▶ skip
//!        │                        Err   ──▶ warn, skip
//!        └──── until cancel flag ◀──────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::device::{DeviceError, Microphone, MicrophoneProvider};
use super::frame::{AudioFrame, AUDIO_CHANNELS};

/// Receives each block of samples on the capture thread
pub type AudioHandler = Box<dyn FnMut(AudioFrame<'_>) + Send>;

/// Counters updated from the capture thread
#[derive(Debug, Default)]
pub struct AudioStats {
    pub frames: AtomicU64,
    pub samples: AtomicU64,
    pub empty_reads: AtomicU64,
    pub read_errors: AtomicU64,
}

/// Audio capture source
pub struct AudioSource {
    cancel: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    stats: Arc<AudioStats>,
}

impl AudioSource {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            stats: Arc::new(AudioStats::default()),
        }
    }

    /// Open the microphone and start the capture thread.
    ///
    /// Failing to open the device is returned to the caller; read errors once
    /// the thread runs are logged and skipped.
    pub fn start(
        &mut self,
        provider: &dyn MicrophoneProvider,
        sample_rate: u32,
        handler: AudioHandler,
    ) -> Result<(), DeviceError> {
        if self.thread_handle.is_some() {
            self.stop();
        }

        let buffer_bytes = provider.min_buffer_size(sample_rate, AUDIO_CHANNELS)?;
        info!("Audio input buffer size: {} bytes", buffer_bytes);

        let mut microphone = provider.open(sample_rate, AUDIO_CHANNELS, buffer_bytes)?;
        microphone.start_recording()?;

        // Bytes to 16-bit samples
        let buffer_samples = (buffer_bytes / 2).max(AUDIO_CHANNELS as usize);

        self.cancel = Arc::new(AtomicBool::new(false));
        let cancel = Arc::clone(&self.cancel);
        let stats = Arc::clone(&self.stats);

        let thread_handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                run_capture_loop(microphone, buffer_samples, sample_rate, handler, cancel, stats);
            })?;

        self.thread_handle = Some(thread_handle);
        info!(
            "Audio source started: {}Hz, {} channels, {} samples per read",
            sample_rate, AUDIO_CHANNELS, buffer_samples
        );
        Ok(())
    }

    /// Cancel the capture loop and wait for the thread to exit.
    ///
    /// The loop only checks the flag between reads, so this can block for one
    /// in-flight read. When it returns the microphone has been released.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            debug!("Waiting for audio capture thread to stop...");
            if handle.join().is_err() {
                error!("Audio capture thread panicked");
            }
            info!(
                "Audio source stopped after {} frames",
                self.stats.frames.load(Ordering::Relaxed)
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    pub fn stats(&self) -> &Arc<AudioStats> {
        &self.stats
    }
}

impl Default for AudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_loop(
    mut microphone: Box<dyn Microphone>,
    buffer_samples: usize,
    sample_rate: u32,
    mut handler: AudioHandler,
    cancel: Arc<AtomicBool>,
    stats: Arc<AudioStats>,
) {
    debug!("Audio capture thread running");
    let mut buffer = vec![0i16; buffer_samples];

    while !cancel.load(Ordering::Acquire) {
        match microphone.read(&mut buffer) {
            Ok(0) => {
                stats.empty_reads.fetch_add(1, Ordering::Relaxed);
            }
            Ok(n) => {
                let n = n.min(buffer.len());
                stats.frames.fetch_add(1, Ordering::Relaxed);
                stats.samples.fetch_add(n as u64, Ordering::Relaxed);
                handler(AudioFrame::new(&buffer[..n], sample_rate));
            }
            Err(e) => {
                stats.read_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Microphone read failed: {}", e);
            }
        }
    }

    microphone.stop();
    drop(microphone);
    debug!("Audio capture thread exiting");
}
