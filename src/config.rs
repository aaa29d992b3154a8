//! Configuration management for the livecast agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::capture::{CameraFacing, FrameSize};
use crate::encoder::FfmpegSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Streaming destination
    #[serde(default)]
    pub stream: StreamConfig,

    /// Camera configuration
    #[serde(default)]
    pub video: VideoConfig,

    /// Microphone configuration
    #[serde(default)]
    pub audio: AudioConfig,

    /// Encoder (ffmpeg) configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Session bookkeeping
    #[serde(default)]
    pub session: SessionConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// RTMP URL to publish to; streaming needs one, from here or `--url`
    pub url: Option<String>,

    /// Start streaming as soon as the camera is acquired
    #[serde(default)]
    pub autostart: bool,
}

/// Camera driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoBackend {
    /// Generated moving gradient
    #[default]
    TestPattern,
    /// Video4Linux device read through ffmpeg
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default)]
    pub backend: VideoBackend,

    /// Which camera to acquire
    #[serde(default)]
    pub facing: CameraFacing,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// V4L2 device for the front camera
    #[serde(default = "default_device")]
    pub device: String,

    /// V4L2 device for the back camera
    pub back_device: Option<String>,
}

/// Microphone driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioBackend {
    /// Generated sine tone
    #[default]
    Tone,
    /// Default input device via cpal (requires the `cpal` feature)
    Cpal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub backend: AudioBackend,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Frequency of the test tone
    #[serde(default = "default_tone_hz")]
    pub tone_hz: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Video bitrate in Kbps
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: u32,

    /// Audio bitrate in Kbps
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u32,

    /// Keyframe interval in frames
    #[serde(default = "default_gop")]
    pub gop: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Where to write a JSON summary of each finished session (none = skip)
    #[serde(default = "default_summary_dir")]
    pub summary_dir: Option<PathBuf>,
}

// Default value functions
fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_fps() -> u32 {
    15
}

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_tone_hz() -> f32 {
    440.0
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_video_bitrate() -> u32 {
    3200
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_gop() -> u32 {
    12
}

fn default_summary_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "livecast", "agent")
        .map(|dirs| dirs.data_dir().join("sessions"))
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            backend: VideoBackend::default(),
            facing: CameraFacing::default(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            device: default_device(),
            back_device: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: AudioBackend::default(),
            sample_rate: default_sample_rate(),
            tone_hz: default_tone_hz(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
            gop: default_gop(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            summary_dir: default_summary_dir(),
        }
    }
}

impl VideoConfig {
    pub fn frame_size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path()?)
    }

    /// Load configuration from `path`, writing defaults there if it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;

            config.config_path = Some(path.to_path_buf());
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(path.to_path_buf()),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "livecast", "agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Encoder settings derived from the `[encoder]` and `[video]` sections
    pub fn ffmpeg_settings(&self) -> FfmpegSettings {
        FfmpegSettings {
            binary: self.encoder.ffmpeg.clone(),
            fps: self.video.fps,
            video_bitrate: self.encoder.video_bitrate,
            audio_bitrate: self.encoder.audio_bitrate,
            gop: self.encoder.gop,
            ..FfmpegSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_camera_preview() {
        let config = Config::default();
        assert_eq!(config.video.frame_size(), FrameSize::new(640, 480));
        assert_eq!(config.video.facing, CameraFacing::Front);
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.encoder.gop, 12);
        assert!(config.stream.url.is_none());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.config_path().unwrap(), path);

        // And it parses back
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.video.width, 640);
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[stream]
url = "rtmp://live.example.com/app/key"

[video]
backend = "v4l2"
facing = "back"
back_device = "/dev/video2"

[audio]
backend = "cpal"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.stream.url.as_deref(), Some("rtmp://live.example.com/app/key"));
        assert_eq!(config.video.backend, VideoBackend::V4l2);
        assert_eq!(config.video.facing, CameraFacing::Back);
        assert_eq!(config.video.back_device.as_deref(), Some("/dev/video2"));
        assert_eq!(config.video.fps, 15);
        assert_eq!(config.audio.backend, AudioBackend::Cpal);
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.encoder.video_bitrate, 3200);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[video]\nwidth = \"wide\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_ffmpeg_settings_follow_config() {
        let mut config = Config::default();
        config.encoder.video_bitrate = 1500;
        config.video.fps = 30;

        let settings = config.ffmpeg_settings();
        assert_eq!(settings.video_bitrate, 1500);
        assert_eq!(settings.fps, 30);
        assert_eq!(settings.preset, "ultrafast");
    }
}
