//! RTMP sink backed by an ffmpeg subprocess
//!
//! ffmpeg does the H.264/AAC encoding and FLV muxing; this side only feeds
//! it raw planes and samples.
//!
//! ```text
//! encode_video ──▶ I420 ──▶ [bounded chan] ──▶ writer thread ──▶ ffmpeg stdin
//! encode_audio ──▶ s16le ──▶ [bounded chan] ──▶ writer thread ──▶ named FIFO
//!                                                     ffmpeg ──▶ flv ──▶ rtmp://
//! ```
//!
//! A full channel blocks the caller for up to `write_timeout`, which keeps
//! backpressure on the capture thread without letting a dead ffmpeg hang it.

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::convert::{i420_len, nv21_to_i420, yuyv_to_i420};
use super::{Encoder, EncoderError, EncoderParams};
use crate::capture::{AudioFrame, PixelFormat, VideoFrame};

/// Encoder tuning passed to ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    /// ffmpeg executable
    pub binary: PathBuf,
    /// Nominal input frame rate
    pub fps: u32,
    /// Video bitrate in Kbps
    pub video_bitrate: u32,
    /// Audio bitrate in Kbps
    pub audio_bitrate: u32,
    /// Keyframe interval in frames
    pub gop: u32,
    /// x264 preset
    pub preset: String,
    /// Frames buffered between the capture threads and ffmpeg
    pub queue_depth: usize,
    /// Longest an encode call may block on a full queue
    pub write_timeout: Duration,
    /// Time ffmpeg gets to flush and exit on shutdown before it is killed
    pub shutdown_timeout: Duration,
    /// Window in which an ffmpeg that exits right away fails `init`
    pub startup_grace: Duration,
    /// Directory for the audio FIFO
    pub fifo_dir: PathBuf,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            fps: 15,
            video_bitrate: 3200,
            audio_bitrate: 128,
            gop: 12,
            preset: "ultrafast".to_string(),
            queue_depth: 4,
            write_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            startup_grace: Duration::from_millis(50),
            fifo_dir: std::env::temp_dir(),
        }
    }
}

/// Channels and threads feeding a running ffmpeg
struct Feeders {
    video_tx: Sender<Vec<u8>>,
    audio_tx: Option<Sender<Vec<u8>>>,
    recycle_rx: Receiver<Vec<u8>>,
    writers: Vec<JoinHandle<()>>,
}

/// A running ffmpeg process and its feeders
struct Pipeline {
    params: EncoderParams,
    child: Child,
    video_tx: Option<Sender<Vec<u8>>>,
    audio_tx: Option<Sender<Vec<u8>>>,
    /// Buffers the video writer hands back for reuse
    recycle_rx: Receiver<Vec<u8>>,
    writers: Vec<JoinHandle<()>>,
    audio_path: Option<PathBuf>,
    /// Removes the FIFO once the pipeline is gone
    #[cfg(unix)]
    _fifo: AudioFifo,
}

/// Encoder that streams through an `ffmpeg` child process
pub struct FfmpegEncoder {
    settings: FfmpegSettings,
    pipeline: Option<Pipeline>,
}

impl FfmpegEncoder {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self {
            settings,
            pipeline: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }

    fn build_command(&self, params: &EncoderParams, audio_input: Option<&str>) -> Command {
        let s = &self.settings;
        let mut cmd = Command::new(&s.binary);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-video_size")
            .arg(params.frame_size.to_string())
            .arg("-framerate")
            .arg(s.fps.to_string())
            .arg("-use_wallclock_as_timestamps")
            .arg("1")
            .arg("-i")
            .arg("pipe:0");

        if let Some(path) = audio_input {
            cmd.arg("-f")
                .arg("s16le")
                .arg("-ar")
                .arg(params.sample_rate.to_string())
                .arg("-ac")
                .arg(params.channels.to_string())
                .arg("-i")
                .arg(path);
        }

        cmd.arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg(&s.preset)
            .arg("-tune")
            .arg("zerolatency")
            .arg("-profile:v")
            .arg("main")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-g")
            .arg(s.gop.to_string())
            .arg("-b:v")
            .arg(format!("{}k", s.video_bitrate));

        if audio_input.is_some() {
            cmd.arg("-c:a")
                .arg("aac")
                .arg("-b:a")
                .arg(format!("{}k", s.audio_bitrate));
        } else {
            cmd.arg("-an");
        }

        cmd.arg("-f").arg("flv").arg(&params.url);
        cmd
    }

    fn send(
        tx: &Sender<Vec<u8>>,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, EncoderError> {
        let len = data.len();
        match tx.send_timeout(data, timeout) {
            Ok(()) => Ok(len),
            Err(SendTimeoutError::Timeout(_)) => {
                Err(EncoderError::Io(std::io::ErrorKind::TimedOut.into()))
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(EncoderError::Closed),
        }
    }

    /// Attach the feeders to a fresh child, killing and reaping it on failure
    fn start_feeders(
        &self,
        child: &mut Child,
        audio_path: Option<PathBuf>,
    ) -> Result<Feeders, EncoderError> {
        let feeders = self.spawn_feeders(child, audio_path);
        if feeders.is_err() {
            let _ = child.kill();
            let _ = child.wait();
        }
        feeders
    }

    fn spawn_feeders(
        &self,
        child: &mut Child,
        audio_path: Option<PathBuf>,
    ) -> Result<Feeders, EncoderError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Init("failed to capture ffmpeg stdin".into()))?;

        if let Some(stderr) = child.stderr.take() {
            thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        warn!(target: "ffmpeg", "{}", line);
                    }
                })?;
        }

        let depth = self.settings.queue_depth.max(1);
        let (video_tx, video_rx) = bounded::<Vec<u8>>(depth);
        let (recycle_tx, recycle_rx) = bounded::<Vec<u8>>(depth);
        let mut writers = vec![thread::Builder::new()
            .name("ffmpeg-video".into())
            .spawn(move || write_video(stdin, video_rx, recycle_tx))?];

        let audio_tx = match audio_path {
            Some(path) => {
                let (audio_tx, audio_rx) = bounded::<Vec<u8>>(depth * 4);
                writers.push(
                    thread::Builder::new()
                        .name("ffmpeg-audio".into())
                        .spawn(move || write_audio(path, audio_rx))?,
                );
                Some(audio_tx)
            }
            None => None,
        };

        Ok(Feeders {
            video_tx,
            audio_tx,
            recycle_rx,
            writers,
        })
    }
}

impl Encoder for FfmpegEncoder {
    fn init(&mut self, params: &EncoderParams) -> Result<(), EncoderError> {
        if self.pipeline.is_some() {
            self.shutdown();
        }

        if params.frame_size.width % 2 != 0 || params.frame_size.height % 2 != 0 {
            return Err(EncoderError::Init(format!(
                "frame size {} must be even",
                params.frame_size
            )));
        }

        #[cfg(unix)]
        let fifo = AudioFifo::create(&self.settings.fifo_dir)?;
        #[cfg(unix)]
        let audio_path = Some(fifo.path.clone());
        #[cfg(not(unix))]
        let audio_path: Option<PathBuf> = None;

        let audio_input = audio_path.as_ref().map(|p| p.to_string_lossy().into_owned());
        let mut cmd = self.build_command(params, audio_input.as_deref());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        info!(
            "Starting ffmpeg: {} {:?} -> {}",
            params.frame_size, params.pixel_format, params.url
        );
        debug!("ffmpeg command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            EncoderError::Init(format!(
                "failed to spawn {}: {}. Is it installed?",
                self.settings.binary.display(),
                e
            ))
        })?;

        let feeders = self.start_feeders(&mut child, audio_path.clone())?;

        // ffmpeg exits right away on a bad URL or codec
        let exited = match wait_for_exit(&mut child, self.settings.startup_grace) {
            Ok(status) => status.map(|s| s.to_string()),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Some(e.to_string())
            }
        };
        if let Some(reason) = exited {
            drop(feeders.video_tx);
            drop(feeders.audio_tx);
            join_writers(feeders.writers, audio_path.as_deref());
            return Err(EncoderError::Init(format!("ffmpeg exited early: {}", reason)));
        }

        self.pipeline = Some(Pipeline {
            params: params.clone(),
            child,
            video_tx: Some(feeders.video_tx),
            audio_tx: feeders.audio_tx,
            recycle_rx: feeders.recycle_rx,
            writers: feeders.writers,
            audio_path,
            #[cfg(unix)]
            _fifo: fifo,
        });

        info!("ffmpeg encoder ready");
        Ok(())
    }

    fn encode_video(&mut self, frame: &VideoFrame<'_>) -> Result<usize, EncoderError> {
        let pipeline = self.pipeline.as_mut().ok_or(EncoderError::NotInitialized)?;

        if frame.size != pipeline.params.frame_size {
            return Err(EncoderError::InvalidFrame(format!(
                "got {} but stream is {}",
                frame.size, pipeline.params.frame_size
            )));
        }
        if frame.len() != frame.format.frame_len(frame.size) {
            return Err(EncoderError::InvalidFrame(format!(
                "{} bytes for a {} {:?} frame",
                frame.len(),
                frame.size,
                frame.format
            )));
        }

        let mut planes = pipeline
            .recycle_rx
            .try_recv()
            .unwrap_or_else(|_| Vec::with_capacity(i420_len(frame.size)));
        match frame.format {
            PixelFormat::Nv21 => nv21_to_i420(frame.data, frame.size, &mut planes),
            PixelFormat::Yuyv => yuyv_to_i420(frame.data, frame.size, &mut planes),
        }

        let tx = pipeline.video_tx.as_ref().ok_or(EncoderError::Closed)?;
        Self::send(tx, planes, self.settings.write_timeout)
    }

    fn encode_audio(&mut self, frame: &AudioFrame<'_>) -> Result<usize, EncoderError> {
        let pipeline = self.pipeline.as_mut().ok_or(EncoderError::NotInitialized)?;
        let Some(tx) = pipeline.audio_tx.as_ref() else {
            return Ok(0);
        };

        let mut pcm = Vec::with_capacity(frame.len() * 2);
        for sample in frame.samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        Self::send(tx, pcm, self.settings.write_timeout)
    }

    fn shutdown(&mut self) {
        let Some(mut pipeline) = self.pipeline.take() else {
            debug!("ffmpeg encoder not running, nothing to shut down");
            return;
        };

        info!("Shutting down ffmpeg encoder");

        // Closing the inputs lets ffmpeg write the trailer and exit
        pipeline.video_tx.take();
        pipeline.audio_tx.take();

        match wait_for_exit(&mut pipeline.child, self.settings.shutdown_timeout) {
            Ok(Some(status)) => info!("ffmpeg exited: {}", status),
            Ok(None) => {
                warn!(
                    "ffmpeg did not exit within {:?}, killing it",
                    self.settings.shutdown_timeout
                );
                let _ = pipeline.child.kill();
                let _ = pipeline.child.wait();
            }
            Err(e) => {
                error!("Failed to wait for ffmpeg: {}", e);
                let _ = pipeline.child.kill();
                let _ = pipeline.child.wait();
            }
        }

        // With ffmpeg gone a writer stuck on a full pipe fails with EPIPE
        let writers = std::mem::take(&mut pipeline.writers);
        join_writers(writers, pipeline.audio_path.as_deref());
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll `child` until it exits or `timeout` passes
fn wait_for_exit(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Join the writer threads once ffmpeg has exited.
///
/// The audio writer can still be parked on the FIFO, in `open` when ffmpeg
/// never attached or on a full pipe nobody reads. Holding a read end and
/// draining it releases both.
fn join_writers(writers: Vec<JoinHandle<()>>, audio_path: Option<&Path>) {
    #[cfg(unix)]
    let mut reader = audio_path.and_then(open_fifo_reader);
    #[cfg(not(unix))]
    let _ = audio_path;

    for handle in writers {
        while !handle.is_finished() {
            #[cfg(unix)]
            {
                if let Some(reader) = reader.as_mut() {
                    drain_fifo(reader);
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            error!("ffmpeg writer thread panicked");
        }
    }
}

fn write_video(mut stdin: ChildStdin, rx: Receiver<Vec<u8>>, recycle: Sender<Vec<u8>>) {
    let mut frames = 0u64;
    while let Ok(planes) = rx.recv() {
        if let Err(e) = stdin.write_all(&planes) {
            warn!("ffmpeg video pipe closed: {}", e);
            break;
        }
        frames += 1;
        let _ = recycle.try_send(planes);
    }
    debug!("ffmpeg video writer done after {} frames", frames);
}

fn write_audio(path: PathBuf, rx: Receiver<Vec<u8>>) {
    // Blocks until ffmpeg opens the FIFO for reading
    let mut fifo = match std::fs::OpenOptions::new().write(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Failed to open audio FIFO {:?}: {}", path, e);
            return;
        }
    };
    while let Ok(pcm) = rx.recv() {
        if let Err(e) = fifo.write_all(&pcm) {
            warn!("ffmpeg audio pipe closed: {}", e);
            break;
        }
    }
    debug!("ffmpeg audio writer done");
}

/// Named pipe carrying raw PCM to ffmpeg's second input
#[cfg(unix)]
struct AudioFifo {
    path: PathBuf,
}

#[cfg(unix)]
impl AudioFifo {
    fn create(dir: &Path) -> Result<Self, EncoderError> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = dir.join(format!("livecast-audio-{}.pcm", uuid::Uuid::new_v4()));
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| EncoderError::Init(format!("invalid FIFO path: {}", e)))?;

        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(EncoderError::Io(std::io::Error::last_os_error()));
        }
        debug!("Created audio FIFO {:?}", path);
        Ok(Self { path })
    }
}

#[cfg(unix)]
impl Drop for AudioFifo {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Non-blocking read end, so a writer stuck in `open` can proceed
#[cfg(unix)]
fn open_fifo_reader(path: &Path) -> Option<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .ok()
}

#[cfg(unix)]
fn drain_fifo(reader: &mut std::fs::File) {
    use std::io::Read;

    let mut scratch = [0u8; 4096];
    while let Ok(n) = reader.read(&mut scratch) {
        if n == 0 {
            break;
        }
    }
}
