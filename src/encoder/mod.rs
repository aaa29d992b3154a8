//! Encoder / network sink contract
//!
//! The encoder is stateful and must never be entered from two threads at
//! once. The pipeline guarantees that by calling it only with its lock held.

mod convert;
mod ffmpeg;

pub use convert::{nv21_to_i420, yuyv_to_i420};
pub use ffmpeg::{FfmpegEncoder, FfmpegSettings};

use thiserror::Error;

use crate::capture::{AudioFrame, FrameSize, PixelFormat, VideoFrame};

/// Everything the encoder needs to set up a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderParams {
    pub frame_size: FrameSize,
    pub pixel_format: PixelFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder is not initialized")]
    NotInitialized,

    #[error("encoder initialization failed: {0}")]
    Init(String),

    #[error("unexpected frame: {0}")]
    InvalidFrame(String),

    #[error("encoder output closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Native codec + muxer + network sink
pub trait Encoder: Send {
    /// Prepare codecs and connect to the destination
    fn init(&mut self, params: &EncoderParams) -> Result<(), EncoderError>;

    /// Encode one video frame; returns the number of bytes produced or queued
    fn encode_video(&mut self, frame: &VideoFrame<'_>) -> Result<usize, EncoderError>;

    /// Encode one block of samples; returns the number of bytes produced or queued
    fn encode_audio(&mut self, frame: &AudioFrame<'_>) -> Result<usize, EncoderError>;

    /// Flush and disconnect. Must be safe to call when `init` failed.
    fn shutdown(&mut self);
}
