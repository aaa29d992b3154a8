//! livecast Agent
//!
//! Captures camera video and microphone audio and streams both live through
//! a single encoder to an RTMP endpoint.

mod capture;
mod config;
mod crash;
mod encoder;
mod logging;
mod service;
mod stream;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{error, info, warn};

use config::Config;
use encoder::FfmpegEncoder;
use service::{
    create_camera_provider, create_microphone_provider, create_service_channels, ServiceCommand,
    ServiceStatus, StreamerService,
};
use stream::CaptureOrchestrator;

/// Command line options
#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    url: Option<String>,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "-c" | "--config" => {
                let path = args.next().context("--config requires a path")?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            "-u" | "--url" => {
                parsed.url = Some(args.next().context("--url requires a URL")?);
            }
            other => bail!("Unknown argument: {} (see --help)", other),
        }
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    let _log_guard = logging::init_logging()?;
    let log_dir = logging::get_log_dir()?;
    match crash::init_crash_handler(&log_dir) {
        Ok(path) => info!("Crash log: {:?}", path),
        Err(e) => warn!("Failed to set up crash log: {}", e),
    }

    info!("livecast Agent starting...");

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path()?);

    let microphones = create_microphone_provider(&config)?;
    let cameras = create_camera_provider(&config);
    let encoder = FfmpegEncoder::new(config.ffmpeg_settings());
    let orchestrator = CaptureOrchestrator::new(Box::new(encoder), microphones);

    let runtime = tokio::runtime::Runtime::new()?;

    let (cmd_tx, cmd_rx, status_tx, mut status_rx) = create_service_channels();
    let mut service = StreamerService::new(config, orchestrator, cameras, cmd_rx, status_tx);

    // Must run on a worker thread: open/close use block_in_place
    let service_handle = runtime.spawn(async move { service.run().await });

    // Mirror status changes into the log
    runtime.spawn(async move {
        while let Ok(status) = status_rx.recv().await {
            match status {
                ServiceStatus::Idle => info!("Status: idle"),
                ServiceStatus::Streaming { encoding: true } => info!("Status: streaming"),
                ServiceStatus::Streaming { encoding: false } => {
                    warn!("Status: capturing but not encoding")
                }
                ServiceStatus::Error(e) => error!("Status: error: {}", e),
            }
        }
    });

    if let Some(url) = args.url {
        let tx = cmd_tx.clone();
        runtime.block_on(async move {
            let _ = tx.send(ServiceCommand::StartStreaming { url: Some(url) }).await;
        });
    }

    // Set up Ctrl+C handler that sends shutdown command
    let ctrl_c_tx = cmd_tx.clone();
    let ctrl_c_runtime = runtime.handle().clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let tx = ctrl_c_tx.clone();
        ctrl_c_runtime.spawn(async move {
            let _ = tx.send(ServiceCommand::Shutdown).await;
        });
    })?;

    info!("Press Ctrl+C to exit...");
    match runtime.block_on(service_handle) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Streamer service error: {:#}", e),
        Err(e) => error!("Streamer service task failed: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_help() {
    println!("livecast Agent - Live camera and microphone streaming");
    println!();
    println!("USAGE:");
    println!("    livecast [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Print this help message");
    println!("    -c, --config <PATH>  Use this config file instead of the default");
    println!("    -u, --url <URL>      Start streaming to this RTMP URL right away");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG             Set log level (e.g., debug, info, warn)");
    println!("    LIVECAST_LOG_PATH    Directory for log files");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let parsed = args(&["--config", "/tmp/livecast.toml", "-u", "rtmp://host/app/key"]).unwrap();
        assert_eq!(parsed.config_path, Some(PathBuf::from("/tmp/livecast.toml")));
        assert_eq!(parsed.url.as_deref(), Some("rtmp://host/app/key"));
        assert!(!parsed.help);

        assert!(args(&["-h"]).unwrap().help);
        assert!(args(&[]).unwrap().url.is_none());
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--url"]).is_err());
        assert!(args(&["--bogus"]).is_err());
    }
}
