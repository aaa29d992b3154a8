//! Hardware capture contracts
//!
//! Cameras and microphones are reached through these narrow traits so the
//! pipeline never depends on a particular driver. A camera delivers frames on
//! a thread it owns; a microphone is polled with a blocking `read`.

use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use serde::{Deserialize, Serialize};

use super::frame::{FrameSize, PixelFormat};

/// Errors reported by capture devices
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {0} device available")]
    NotFound(&'static str),

    #[error("camera cannot deliver {requested} (supported: {supported:?})")]
    UnsupportedFrameSize {
        requested: FrameSize,
        supported: Vec<FrameSize>,
    },

    #[error("failed to open device: {0}")]
    Open(String),

    #[error("device read failed: {0}")]
    Read(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which camera to acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
}

/// Callback invoked by a camera for every captured frame.
///
/// The buffer is one of the camera's callback buffers, already filled. The
/// callback owns it until it hands it back through [`CallbackBuffers::push`].
pub type FrameCallback = Box<dyn FnMut(Vec<u8>) + Send>;

/// Pool of buffers a camera may fill
///
/// A camera only captures into a buffer it can take from this pool. When the
/// pool is empty the frame is dropped by the device, so a slow consumer never
/// builds a backlog.
#[derive(Clone, Default)]
pub struct CallbackBuffers {
    inner: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CallbackBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a buffer (back) to the device
    pub fn push(&self, buffer: Vec<u8>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buffer);
    }

    /// Take a free buffer for the next capture
    pub fn take(&self) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    /// Number of free buffers
    pub fn available(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Registered frame callback of a camera driver.
///
/// Drivers call [`FrameDispatch::dispatch`] from their capture thread. The
/// slot lock is held while the callback runs, so replacing or clearing the
/// callback waits for an in-flight frame to finish.
#[derive(Clone, Default)]
pub struct FrameDispatch {
    slot: Arc<Mutex<Option<FrameCallback>>>,
}

impl FrameDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callback: Option<FrameCallback>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn is_registered(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Deliver a filled buffer. Gives the buffer back when nobody listens.
    pub fn dispatch(&self, buffer: Vec<u8>) -> Result<(), Vec<u8>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(callback) => {
                callback(buffer);
                Ok(())
            }
            None => Err(buffer),
        }
    }
}

/// A video capture device
///
/// Dropping the camera releases it.
pub trait Camera: Send {
    /// Human readable device name
    fn name(&self) -> &str;

    /// Preview sizes the device can deliver
    fn supported_frame_sizes(&self) -> Vec<FrameSize>;

    /// Pixel layout of preview frames
    fn pixel_format(&self) -> PixelFormat;

    /// Select the preview size. Must be one of `supported_frame_sizes`.
    fn set_frame_size(&mut self, size: FrameSize) -> Result<(), DeviceError>;

    /// Pool of buffers the device captures into
    fn callback_buffers(&self) -> CallbackBuffers;

    /// Register or clear the per-frame callback
    fn set_frame_callback(&mut self, callback: Option<FrameCallback>);

    fn start_preview(&mut self) -> Result<(), DeviceError>;

    fn stop_preview(&mut self);
}

/// Acquires cameras by facing
pub trait CameraProvider: Send + Sync {
    fn open(&self, facing: CameraFacing) -> Result<Box<dyn Camera>, DeviceError>;
}

/// An audio input device producing interleaved 16-bit PCM
///
/// Dropping the microphone releases it.
pub trait Microphone: Send {
    fn start_recording(&mut self) -> Result<(), DeviceError>;

    /// Block until samples are available and copy them into `buf`.
    ///
    /// Returns the number of valid samples, which may be fewer than
    /// `buf.len()` and may be zero.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError>;

    fn stop(&mut self);
}

/// Opens microphones
pub trait MicrophoneProvider: Send + Sync {
    /// Smallest buffer, in bytes, the driver accepts for this format
    fn min_buffer_size(&self, sample_rate: u32, channels: u16) -> Result<usize, DeviceError>;

    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        buffer_bytes: usize,
    ) -> Result<Box<dyn Microphone>, DeviceError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-driven devices for pipeline tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Test side of a [`ManualCamera`]: lets any thread "capture" a frame.
    #[derive(Clone)]
    pub struct ManualCameraHandle {
        pub buffers: CallbackBuffers,
        pub dispatch: FrameDispatch,
        pub previewing: Arc<AtomicBool>,
        pub released: Arc<AtomicBool>,
    }

    impl ManualCameraHandle {
        /// Fill a free buffer with `value` and deliver it. Returns false when
        /// the frame was dropped (no free buffer, no callback or not previewing).
        pub fn capture(&self, value: u8) -> bool {
            if !self.previewing.load(Ordering::SeqCst) {
                return false;
            }
            let Some(mut buffer) = self.buffers.take() else {
                return false;
            };
            buffer.iter_mut().for_each(|b| *b = value);
            match self.dispatch.dispatch(buffer) {
                Ok(()) => true,
                Err(buffer) => {
                    self.buffers.push(buffer);
                    false
                }
            }
        }
    }

    pub struct ManualCamera {
        sizes: Vec<FrameSize>,
        format: PixelFormat,
        current: Option<FrameSize>,
        handle: ManualCameraHandle,
    }

    impl ManualCamera {
        pub fn new(sizes: Vec<FrameSize>, format: PixelFormat) -> (Self, ManualCameraHandle) {
            let handle = ManualCameraHandle {
                buffers: CallbackBuffers::new(),
                dispatch: FrameDispatch::new(),
                previewing: Arc::new(AtomicBool::new(false)),
                released: Arc::new(AtomicBool::new(false)),
            };
            (
                Self {
                    sizes,
                    format,
                    current: None,
                    handle: handle.clone(),
                },
                handle,
            )
        }

        pub fn vga() -> (Self, ManualCameraHandle) {
            Self::new(vec![FrameSize::new(640, 480)], PixelFormat::Yuyv)
        }
    }

    impl Camera for ManualCamera {
        fn name(&self) -> &str {
            "manual"
        }

        fn supported_frame_sizes(&self) -> Vec<FrameSize> {
            self.sizes.clone()
        }

        fn pixel_format(&self) -> PixelFormat {
            self.format
        }

        fn set_frame_size(&mut self, size: FrameSize) -> Result<(), DeviceError> {
            self.current = Some(size);
            Ok(())
        }

        fn callback_buffers(&self) -> CallbackBuffers {
            self.handle.buffers.clone()
        }

        fn set_frame_callback(&mut self, callback: Option<FrameCallback>) {
            self.handle.dispatch.set(callback);
        }

        fn start_preview(&mut self) -> Result<(), DeviceError> {
            self.handle.previewing.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop_preview(&mut self) {
            self.handle.previewing.store(false, Ordering::SeqCst);
        }
    }

    impl Drop for ManualCamera {
        fn drop(&mut self) {
            self.handle.released.store(true, Ordering::SeqCst);
        }
    }

    /// One scripted result of `Microphone::read`
    pub enum ReadStep {
        /// Return this many samples, each set to the given value
        Samples(usize, i16),
        Empty,
        Error,
    }

    /// Observable state of a scripted microphone
    #[derive(Clone, Default)]
    pub struct MicProbe {
        pub reads: Arc<AtomicUsize>,
        pub stopped: Arc<AtomicBool>,
        pub released: Arc<AtomicBool>,
    }

    pub struct ScriptedMicrophone {
        script: VecDeque<ReadStep>,
        probe: MicProbe,
    }

    impl Microphone for ScriptedMicrophone {
        fn start_recording(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
            self.probe.reads.fetch_add(1, Ordering::SeqCst);
            match self.script.pop_front() {
                Some(ReadStep::Samples(n, value)) => {
                    let n = n.min(buf.len());
                    buf[..n].iter_mut().for_each(|s| *s = value);
                    Ok(n)
                }
                Some(ReadStep::Error) => Err(DeviceError::Read("scripted failure".into())),
                Some(ReadStep::Empty) => Ok(0),
                None => {
                    // Behave like an idle device: block briefly, deliver nothing
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(0)
                }
            }
        }

        fn stop(&mut self) {
            self.probe.stopped.store(true, Ordering::SeqCst);
        }
    }

    impl Drop for ScriptedMicrophone {
        fn drop(&mut self) {
            self.probe.released.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out scripted microphones; a fresh script per `open`
    pub struct ScriptedMicrophoneProvider {
        scripts: Mutex<VecDeque<Vec<ReadStep>>>,
        pub probe: MicProbe,
        pub fail_open: bool,
        pub min_buffer_bytes: usize,
    }

    impl ScriptedMicrophoneProvider {
        pub fn new(scripts: Vec<Vec<ReadStep>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                probe: MicProbe::default(),
                fail_open: false,
                min_buffer_bytes: 4096,
            }
        }

        pub fn idle() -> Self {
            Self::new(Vec::new())
        }

        pub fn failing() -> Self {
            Self {
                fail_open: true,
                ..Self::idle()
            }
        }
    }

    impl MicrophoneProvider for ScriptedMicrophoneProvider {
        fn min_buffer_size(&self, _sample_rate: u32, _channels: u16) -> Result<usize, DeviceError> {
            Ok(self.min_buffer_bytes)
        }

        fn open(
            &self,
            _sample_rate: u32,
            _channels: u16,
            _buffer_bytes: usize,
        ) -> Result<Box<dyn Microphone>, DeviceError> {
            if self.fail_open {
                return Err(DeviceError::NotFound("microphone"));
            }
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            self.probe.stopped.store(false, Ordering::SeqCst);
            self.probe.released.store(false, Ordering::SeqCst);
            Ok(Box::new(ScriptedMicrophone {
                script: script.into(),
                probe: self.probe.clone(),
            }))
        }
    }
}
