//! Streamer service - control layer that owns the camera and drives the
//! capture orchestrator from commands

mod streamer;

pub use streamer::{create_service_channels, StreamerService};

use anyhow::Result;
use std::sync::Arc;

use crate::capture::{
    CameraProvider, FfmpegCameraProvider, MicrophoneProvider, TestPatternProvider,
    ToneMicrophoneProvider,
};
use crate::config::{AudioBackend, Config, VideoBackend};

/// Commands that can be sent to the streamer service
#[derive(Debug, Clone)]
pub enum ServiceCommand {
    /// Start streaming; without a URL the configured one is used
    StartStreaming { url: Option<String> },
    /// Stop streaming and keep the camera
    StopStreaming,
    /// Release the camera (refused while streaming)
    ReleaseCamera,
    /// Stop streaming, release the camera and exit
    Shutdown,
}

/// Status updates from the streamer service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Not streaming
    Idle,
    /// Sources are running; `encoding` is false when the encoder failed to start
    Streaming { encoding: bool },
    /// An error occurred
    Error(String),
}

/// Create the camera provider selected in the config
pub fn create_camera_provider(config: &Config) -> Box<dyn CameraProvider> {
    match config.video.backend {
        VideoBackend::TestPattern => {
            tracing::info!("Using test pattern camera");
            Box::new(TestPatternProvider {
                fps: config.video.fps,
            })
        }
        VideoBackend::V4l2 => {
            tracing::info!("Using V4L2 camera {}", config.video.device);
            Box::new(FfmpegCameraProvider {
                ffmpeg: config.encoder.ffmpeg.clone(),
                front_device: config.video.device.clone(),
                back_device: config.video.back_device.clone(),
                fps: config.video.fps,
                sizes: Vec::new(),
            })
        }
    }
}

/// Create the microphone provider selected in the config
pub fn create_microphone_provider(config: &Config) -> Result<Arc<dyn MicrophoneProvider>> {
    match config.audio.backend {
        AudioBackend::Tone => {
            tracing::info!("Using {}Hz test tone microphone", config.audio.tone_hz);
            Ok(Arc::new(ToneMicrophoneProvider {
                tone_hz: config.audio.tone_hz,
            }))
        }
        #[cfg(feature = "cpal")]
        AudioBackend::Cpal => {
            tracing::info!("Using default input device via cpal");
            Ok(Arc::new(crate::capture::CpalMicrophoneProvider))
        }
        #[cfg(not(feature = "cpal"))]
        AudioBackend::Cpal => {
            anyhow::bail!("audio backend \"cpal\" requires building with --features cpal")
        }
    }
}
