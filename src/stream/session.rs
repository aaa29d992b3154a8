//! Per-session bookkeeping

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::capture::FrameSize;

/// Frame counters, updated under the pipeline lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub video_encoded: u64,
    /// Frames that arrived while the encoder was inactive
    pub video_dropped: u64,
    pub video_errors: u64,
    pub audio_encoded: u64,
    pub audio_dropped: u64,
    pub audio_errors: u64,
    /// Bytes the encoder reported as produced or queued
    pub bytes: u64,
}

/// One open-to-close lifetime of a stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamSession {
    pub id: Uuid,
    pub url: String,
    pub frame_size: FrameSize,
    pub sample_rate: u32,
    pub encoding: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub counters: SessionCounters,
}

impl StreamSession {
    pub fn new(url: &str, frame_size: FrameSize, sample_rate: u32, encoding: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            frame_size,
            sample_rate,
            encoding,
            started_at: Utc::now(),
            ended_at: None,
            counters: SessionCounters::default(),
        }
    }

    pub fn finish(&mut self, counters: SessionCounters) {
        self.counters = counters;
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_secs(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Write `session_<id>.json` into `dir`, creating it if needed
    pub fn write_summary(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create summary directory {:?}", dir))?;

        let path = dir.join(format!("session_{}.json", self.id));
        let json = serde_json::to_string_pretty(self).context("Failed to serialize session")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write session summary {:?}", path))?;

        info!("Session summary written to {:?}", path);
        Ok(path)
    }
}
