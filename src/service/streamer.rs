//! Streamer service
//!
//! Owns the camera across sessions and turns commands into orchestrator
//! calls. Opening and closing block on device threads, so they run under
//! `block_in_place` to keep the runtime responsive.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::capture::{share_camera, CameraProvider, SharedCamera};
use crate::config::Config;
use crate::stream::{CaptureOrchestrator, StreamStatus};

use super::{ServiceCommand, ServiceStatus};

/// How often counters of a running session are logged
const STATS_INTERVAL: Duration = Duration::from_secs(30);

pub struct StreamerService {
    /// Configuration
    config: Config,
    orchestrator: CaptureOrchestrator,
    cameras: Box<dyn CameraProvider>,
    /// Acquired camera, kept between sessions
    camera: Option<SharedCamera>,
    /// Command receiver
    cmd_rx: mpsc::Receiver<ServiceCommand>,
    /// Status broadcaster
    status_tx: broadcast::Sender<ServiceStatus>,
}

impl StreamerService {
    pub fn new(
        config: Config,
        orchestrator: CaptureOrchestrator,
        cameras: Box<dyn CameraProvider>,
        cmd_rx: mpsc::Receiver<ServiceCommand>,
        status_tx: broadcast::Sender<ServiceStatus>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            cameras,
            camera: None,
            cmd_rx,
            status_tx,
        }
    }

    /// Run the service main loop until `Shutdown` or until every command
    /// sender is gone
    pub async fn run(&mut self) -> Result<()> {
        info!("Streamer service starting");

        // The camera is acquired up front, like an app grabbing it on launch
        if let Err(e) = self.acquire_camera() {
            warn!("Camera not available yet: {}", e);
        }

        let _ = self.status_tx.send(ServiceStatus::Idle);

        if self.config.stream.autostart {
            info!("Autostart streaming enabled");
            self.start_streaming(None);
        }

        let mut stats_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + STATS_INTERVAL, STATS_INTERVAL);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ServiceCommand::StartStreaming { url }) => self.start_streaming(url),
                        Some(ServiceCommand::StopStreaming) => self.stop_streaming(),
                        Some(ServiceCommand::ReleaseCamera) => self.release_camera(),
                        Some(ServiceCommand::Shutdown) => {
                            info!("Shutdown command received");
                            break;
                        }
                        None => {
                            debug!("Command channel closed");
                            break;
                        }
                    }
                }

                _ = stats_timer.tick() => {
                    if let Some(session) = self.orchestrator.session() {
                        let c = session.counters;
                        info!(
                            "Streaming {:.0}s: video {} encoded / {} dropped, audio {} encoded / {} dropped, {} bytes",
                            session.duration_secs(),
                            c.video_encoded,
                            c.video_dropped,
                            c.audio_encoded,
                            c.audio_dropped,
                            c.bytes
                        );
                    }
                }
            }
        }

        self.stop_streaming();
        self.release_camera();
        info!("Streamer service stopped");
        Ok(())
    }

    fn acquire_camera(&mut self) -> Result<SharedCamera> {
        if let Some(camera) = &self.camera {
            return Ok(camera.clone());
        }
        let camera = self.cameras.open(self.config.video.facing)?;
        info!("Acquired camera {}", camera.name());
        let camera = share_camera(camera);
        self.camera = Some(camera.clone());
        Ok(camera)
    }

    fn start_streaming(&mut self, url: Option<String>) {
        if self.orchestrator.is_streaming() {
            warn!("Already streaming");
            return;
        }

        let Some(url) = url.or_else(|| self.config.stream.url.clone()) else {
            error!("Cannot start streaming: no stream URL configured");
            let _ = self
                .status_tx
                .send(ServiceStatus::Error("No stream URL configured".to_string()));
            return;
        };

        let camera = match self.acquire_camera() {
            Ok(camera) => camera,
            Err(e) => {
                error!("Cannot start streaming: {}", e);
                let _ = self.status_tx.send(ServiceStatus::Error(e.to_string()));
                return;
            }
        };

        info!("Starting stream to {}", url);
        let frame_size = self.config.video.frame_size();
        let sample_rate = self.config.audio.sample_rate;
        let orchestrator = &self.orchestrator;
        let result = tokio::task::block_in_place(|| {
            orchestrator.open(&url, camera, frame_size, sample_rate)
        });

        let status = match result {
            Ok(StreamStatus::Encoding) => ServiceStatus::Streaming { encoding: true },
            Ok(StreamStatus::StartedNotEncoding) => {
                warn!("Capture is running but the encoder did not start; nothing is being sent");
                ServiceStatus::Streaming { encoding: false }
            }
            Err(e) => {
                error!("Failed to start streaming: {}", e);
                ServiceStatus::Error(e.to_string())
            }
        };
        let _ = self.status_tx.send(status);
    }

    fn stop_streaming(&mut self) {
        if !self.orchestrator.is_streaming() {
            debug!("Not streaming");
            return;
        }

        info!("Stopping stream...");
        let orchestrator = &self.orchestrator;
        match tokio::task::block_in_place(|| orchestrator.close()) {
            Ok(Some(session)) => {
                if let Some(dir) = &self.config.session.summary_dir {
                    if let Err(e) = session.write_summary(dir) {
                        warn!("Failed to write session summary: {:#}", e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("Failed to stop streaming: {}", e);
                let _ = self.status_tx.send(ServiceStatus::Error(e.to_string()));
                return;
            }
        }

        let _ = self.status_tx.send(ServiceStatus::Idle);
    }

    fn release_camera(&mut self) {
        if self.orchestrator.is_streaming() {
            warn!("Cannot release camera while streaming");
            return;
        }
        if self.camera.take().is_some() {
            info!("Camera released");
        }
    }
}

/// Create command and status channels for the service
pub fn create_service_channels() -> (
    mpsc::Sender<ServiceCommand>,
    mpsc::Receiver<ServiceCommand>,
    broadcast::Sender<ServiceStatus>,
    broadcast::Receiver<ServiceStatus>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = broadcast::channel(16);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}
