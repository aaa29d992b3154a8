//! Video frame grabber
//!
//! Binds a camera, negotiates the preview size and forwards every captured
//! frame to a handler on the camera's own callback thread. Exactly one
//! buffer is in flight: it is handed back to the camera as soon as the
//! handler returns, so the handler must copy anything it wants to keep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::device::{Camera, DeviceError};
use super::frame::{FrameSize, PixelFormat, VideoFrame};

/// A camera shared between the control layer and the video source
pub type SharedCamera = Arc<Mutex<Box<dyn Camera>>>;

/// Wrap a camera so it can be handed to a [`VideoSource`]
pub fn share_camera(camera: Box<dyn Camera>) -> SharedCamera {
    Arc::new(Mutex::new(camera))
}

/// Receives each frame on the camera's callback thread
pub type VideoHandler = Box<dyn FnMut(VideoFrame<'_>) + Send>;

/// Counters updated from the callback thread
#[derive(Debug, Default)]
pub struct VideoStats {
    pub frames: AtomicU64,
    /// Buffers that came back from the device with an unexpected length
    pub malformed: AtomicU64,
}

/// Video capture source
pub struct VideoSource {
    camera: Option<SharedCamera>,
    pixel_format: PixelFormat,
    stats: Arc<VideoStats>,
}

impl VideoSource {
    pub fn new() -> Self {
        Self {
            camera: None,
            pixel_format: PixelFormat::default(),
            stats: Arc::new(VideoStats::default()),
        }
    }

    /// Bind `camera`, negotiate `requested` and start delivering frames to
    /// `handler`.
    ///
    /// Returns the negotiated frame size. A camera that cannot deliver the
    /// requested size is an error; nothing is retried.
    pub fn start(
        &mut self,
        camera: SharedCamera,
        requested: FrameSize,
        mut handler: VideoHandler,
    ) -> Result<FrameSize, DeviceError> {
        if self.camera.is_some() {
            self.stop();
        }

        let mut device = camera.lock().unwrap_or_else(PoisonError::into_inner);

        let supported = device.supported_frame_sizes();
        if !supported.contains(&requested) {
            warn!(
                "Camera {} cannot deliver {} (supported: {:?})",
                device.name(),
                requested,
                supported
            );
            return Err(DeviceError::UnsupportedFrameSize {
                requested,
                supported,
            });
        }
        device.set_frame_size(requested)?;

        let format = device.pixel_format();
        let frame_len = format.frame_len(requested);
        let buffers = device.callback_buffers();
        buffers.clear();
        buffers.push(vec![0u8; frame_len]);

        info!(
            "Video source bound to {}: {} {:?} ({} bytes per frame)",
            device.name(),
            requested,
            format,
            frame_len
        );

        let stats = Arc::clone(&self.stats);
        let recycle = buffers.clone();
        device.set_frame_callback(Some(Box::new(move |buffer: Vec<u8>| {
            if buffer.len() == frame_len {
                stats.frames.fetch_add(1, Ordering::Relaxed);
                handler(VideoFrame::new(&buffer, requested, format));
            } else {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Discarding video buffer of {} bytes (expected {})",
                    buffer.len(),
                    frame_len
                );
            }
            recycle.push(buffer);
        })));

        if let Err(e) = device.start_preview() {
            device.set_frame_callback(None);
            buffers.clear();
            return Err(e);
        }

        drop(device);
        self.camera = Some(camera);
        self.pixel_format = format;
        Ok(requested)
    }

    /// Stop delivering frames and unbind the camera.
    ///
    /// A frame captured while this runs either completes its handler call
    /// before this returns or is dropped.
    pub fn stop(&mut self) {
        let Some(camera) = self.camera.take() else {
            return;
        };

        let mut device = camera.lock().unwrap_or_else(PoisonError::into_inner);
        device.stop_preview();
        device.set_frame_callback(None);
        device.callback_buffers().clear();

        info!(
            "Video source stopped after {} frames",
            self.stats.frames.load(Ordering::Relaxed)
        );
    }

    pub fn is_running(&self) -> bool {
        self.camera.is_some()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn stats(&self) -> &Arc<VideoStats> {
        &self.stats
    }
}

impl Default for VideoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.stop();
    }
}
