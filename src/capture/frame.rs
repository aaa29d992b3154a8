//! Frame types handed from capture sources to the encoder
//!
//! Both frame types are borrowed views over a buffer owned by the source.
//! They are only valid for the duration of the callback that receives them;
//! anything that needs the data later has to copy it out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of interleaved channels produced by the audio source (stereo)
pub const AUDIO_CHANNELS: u16 = 2;

/// Dimensions of a captured video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel layout of camera preview frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Y plane followed by interleaved V/U at quarter resolution (camera default)
    #[default]
    Nv21,
    /// Packed 4:2:2, two bytes per pixel
    Yuyv,
}

impl PixelFormat {
    pub fn bits_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Nv21 => 12,
            PixelFormat::Yuyv => 16,
        }
    }

    /// Size in bytes of one frame of the given dimensions
    pub fn frame_len(&self, size: FrameSize) -> usize {
        size.pixels() * self.bits_per_pixel() / 8
    }

    /// Name understood by ffmpeg's `-pix_fmt`
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Nv21 => "nv21",
            PixelFormat::Yuyv => "yuyv422",
        }
    }
}

/// One captured video frame
#[derive(Debug, Clone, Copy)]
pub struct VideoFrame<'a> {
    pub data: &'a [u8],
    pub size: FrameSize,
    pub format: PixelFormat,
}

impl<'a> VideoFrame<'a> {
    pub fn new(data: &'a [u8], size: FrameSize, format: PixelFormat) -> Self {
        Self { data, size, format }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One block of interleaved stereo samples
///
/// `samples` holds only the valid part of the read; the underlying buffer
/// may be larger.
#[derive(Debug, Clone, Copy)]
pub struct AudioFrame<'a> {
    pub samples: &'a [i16],
    pub sample_rate: u32,
}

impl<'a> AudioFrame<'a> {
    pub fn new(samples: &'a [i16], sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Number of valid samples (all channels)
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / AUDIO_CHANNELS as usize
    }
}
