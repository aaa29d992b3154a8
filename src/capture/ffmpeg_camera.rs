//! V4L2 camera read through an ffmpeg subprocess
//!
//! ffmpeg opens the device and writes raw NV21 frames to stdout. A reader
//! thread cuts the stream into frames with `read_exact` and acts as the
//! camera's callback thread.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::device::{
    CallbackBuffers, Camera, CameraFacing, CameraProvider, DeviceError, FrameCallback,
    FrameDispatch,
};
use super::frame::{FrameSize, PixelFormat};

/// Sizes most UVC webcams offer
pub const COMMON_FRAME_SIZES: [FrameSize; 4] = [
    FrameSize::new(320, 240),
    FrameSize::new(640, 480),
    FrameSize::new(1280, 720),
    FrameSize::new(1920, 1080),
];

pub struct FfmpegCamera {
    name: String,
    ffmpeg: PathBuf,
    device: String,
    fps: u32,
    sizes: Vec<FrameSize>,
    size: FrameSize,
    buffers: CallbackBuffers,
    dispatch: FrameDispatch,
    running: Arc<AtomicBool>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl FfmpegCamera {
    pub fn new(ffmpeg: PathBuf, device: String, fps: u32, sizes: Vec<FrameSize>) -> Self {
        let size = sizes
            .iter()
            .copied()
            .find(|s| *s == FrameSize::new(640, 480))
            .or_else(|| sizes.first().copied())
            .unwrap_or(FrameSize::new(640, 480));
        Self {
            name: format!("v4l2:{}", device),
            ffmpeg,
            device,
            fps: fps.max(1),
            sizes,
            size,
            buffers: CallbackBuffers::new(),
            dispatch: FrameDispatch::new(),
            running: Arc::new(AtomicBool::new(false)),
            child: None,
            reader: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("video4linux2")
            .arg("-framerate")
            .arg(self.fps.to_string())
            .arg("-video_size")
            .arg(self.size.to_string())
            .arg("-i")
            .arg(&self.device)
            .arg("-pix_fmt")
            .arg(PixelFormat::Nv21.ffmpeg_name())
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd
    }
}

impl Camera for FfmpegCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_frame_sizes(&self) -> Vec<FrameSize> {
        self.sizes.clone()
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Nv21
    }

    fn set_frame_size(&mut self, size: FrameSize) -> Result<(), DeviceError> {
        if !self.sizes.contains(&size) {
            return Err(DeviceError::UnsupportedFrameSize {
                requested: size,
                supported: self.sizes.clone(),
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
        if self.child.is_some() {
            return Ok(());
        }

        let mut cmd = self.build_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("Spawning camera reader: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| DeviceError::Open(format!("{}: {}", self.ffmpeg.display(), e)))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DeviceError::Open("failed to capture ffmpeg stdout".into()));
        };

        if let Some(stderr) = child.stderr.take() {
            let device = self.device.clone();
            thread::Builder::new()
                .name("camera-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        warn!("ffmpeg ({}): {}", device, line);
                    }
                })?;
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let buffers = self.buffers.clone();
        let dispatch = self.dispatch.clone();
        let dropped = Arc::clone(&self.dropped);
        let frame_len = PixelFormat::Nv21.frame_len(self.size);

        let reader = thread::Builder::new()
            .name("camera-reader".into())
            .spawn(move || read_frames(stdout, frame_len, running, buffers, dispatch, dropped));

        match reader {
            Ok(handle) => {
                self.reader = Some(handle);
                self.child = Some(child);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        }

        info!("Camera {} previewing {} @ {}fps", self.name, self.size, self.fps);
        Ok(())
    }

    fn stop_preview(&mut self) {
        self.running.store(false, Ordering::Release);

        // Killing ffmpeg closes stdout, which ends the blocked read
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }

        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            info!("Camera {} dropped {} frames while busy", self.name, dropped);
        }
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.stop_preview();
    }
}

fn read_frames(
    mut stdout: ChildStdout,
    frame_len: usize,
    running: Arc<AtomicBool>,
    buffers: CallbackBuffers,
    dispatch: FrameDispatch,
    dropped: Arc<AtomicU64>,
) {
    let mut scratch = vec![0u8; frame_len];

    while running.load(Ordering::Acquire) {
        // The pipe has to keep draining even when nobody can take the frame
        let Some(mut buffer) = buffers.take() else {
            if stdout.read_exact(&mut scratch).is_err() {
                break;
            }
            dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        buffer.resize(frame_len, 0);
        if let Err(e) = stdout.read_exact(&mut buffer) {
            if running.load(Ordering::Acquire) {
                warn!("Camera stream ended: {}", e);
            }
            buffers.push(buffer);
            break;
        }

        if let Err(buffer) = dispatch.dispatch(buffer) {
            buffers.push(buffer);
        }
    }
    debug!("Camera reader exiting");
}

/// Opens V4L2 devices by facing
pub struct FfmpegCameraProvider {
    pub ffmpeg: PathBuf,
    pub front_device: String,
    pub back_device: Option<String>,
    pub fps: u32,
    pub sizes: Vec<FrameSize>,
}

impl CameraProvider for FfmpegCameraProvider {
    fn open(&self, facing: CameraFacing) -> Result<Box<dyn Camera>, DeviceError> {
        let device = match facing {
            CameraFacing::Front => Some(&self.front_device),
            CameraFacing::Back => self.back_device.as_ref(),
        }
        .ok_or(DeviceError::NotFound("camera"))?;

        if !Path::new(device).exists() {
            return Err(DeviceError::NotFound("camera"));
        }

        let sizes = if self.sizes.is_empty() {
            COMMON_FRAME_SIZES.to_vec()
        } else {
            self.sizes.clone()
        };

        Ok(Box::new(FfmpegCamera::new(
            self.ffmpeg.clone(),
            device.clone(),
            self.fps,
            sizes,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> FfmpegCamera {
        FfmpegCamera::new(
            PathBuf::from("ffmpeg"),
            "/dev/video0".into(),
            15,
            COMMON_FRAME_SIZES.to_vec(),
        )
    }

    #[test]
    fn test_command_requests_nv21_at_negotiated_size() {
        let mut cam = camera();
        cam.set_frame_size(FrameSize::new(1280, 720)).unwrap();

        let cmd = cam.build_command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");

        assert!(joined.contains("-f video4linux2"));
        assert!(joined.contains("-video_size 1280x720"));
        assert!(joined.contains("-framerate 15"));
        assert!(joined.contains("-i /dev/video0"));
        assert!(joined.contains("-pix_fmt nv21"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_defaults_to_vga_when_offered() {
        let cam = camera();
        assert_eq!(cam.size, FrameSize::new(640, 480));
    }

    #[test]
    fn test_missing_binary_fails_preview() {
        let mut cam = FfmpegCamera::new(
            PathBuf::from("/nonexistent/ffmpeg"),
            "/dev/video0".into(),
            15,
            COMMON_FRAME_SIZES.to_vec(),
        );
        assert!(matches!(cam.start_preview(), Err(DeviceError::Open(_))));
        // Stopping an unstarted camera is harmless
        cam.stop_preview();
    }

    #[test]
    fn test_provider_reports_missing_device() {
        let provider = FfmpegCameraProvider {
            ffmpeg: PathBuf::from("ffmpeg"),
            front_device: "/dev/does-not-exist".into(),
            back_device: None,
            fps: 15,
            sizes: Vec::new(),
        };
        assert!(matches!(
            provider.open(CameraFacing::Front),
            Err(DeviceError::NotFound("camera"))
        ));
        assert!(matches!(
            provider.open(CameraFacing::Back),
            Err(DeviceError::NotFound("camera"))
        ));
    }
}
