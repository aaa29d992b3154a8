//! Camera and microphone capture
//!
//! Devices are reached through the traits in [`device`]. [`VideoSource`] and
//! [`AudioSource`] turn them into streams of borrowed frames delivered on
//! capture-owned threads.

mod audio;
mod device;
mod ffmpeg_camera;
mod frame;
mod synthetic;
mod video;

#[cfg(feature = "cpal")]
mod cpal_mic;

pub use audio::{AudioHandler, AudioSource, AudioStats};
pub use device::{
    CallbackBuffers, Camera, CameraFacing, CameraProvider, DeviceError, FrameCallback,
    FrameDispatch, Microphone, MicrophoneProvider,
};
pub use ffmpeg_camera::{FfmpegCamera, FfmpegCameraProvider, COMMON_FRAME_SIZES};
pub use frame::{AudioFrame, FrameSize, PixelFormat, VideoFrame, AUDIO_CHANNELS};
pub use synthetic::{TestPatternCamera, TestPatternProvider, ToneMicrophoneProvider};
pub use video::{share_camera, SharedCamera, VideoHandler, VideoSource, VideoStats};

#[cfg(feature = "cpal")]
pub use cpal_mic::CpalMicrophoneProvider;

#[cfg(test)]
pub(crate) use device::testing;
