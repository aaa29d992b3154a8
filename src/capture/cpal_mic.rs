//! Default input device through cpal
//!
//! cpal delivers samples from its own callback and its streams are not
//! `Send`, so the stream lives on a dedicated thread and forwards blocks over
//! a channel. `read` blocks on that channel, which gives the capture loop the
//! same shape as a driver-level blocking read.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use super::device::{DeviceError, Microphone, MicrophoneProvider};

/// Buffer duration reported as the device minimum
const CPAL_BUFFER_MS: u32 = 20;

/// Longest a single `read` waits for samples
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Callback blocks held while the capture loop is busy; newer ones are dropped
const QUEUE_BLOCKS: usize = 32;

enum StreamControl {
    Play,
    Pause,
}

/// Producer half, owned by the cpal callback
#[derive(Clone)]
struct BlockSender {
    tx: Sender<Vec<i16>>,
    dropped: Arc<AtomicU64>,
}

impl BlockSender {
    /// Never blocks the audio callback; a full queue sheds the block
    fn push(&self, block: Vec<i16>) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(block) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Consumer half, giving the capture loop a blocking `read`
struct BlockReader {
    rx: Receiver<Vec<i16>>,
    /// Remainder of a block larger than the caller's buffer
    pending: VecDeque<i16>,
}

impl BlockReader {
    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, DeviceError> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(block) => self.pending.extend(block),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DeviceError::Read("audio stream closed".into()))
                }
            }
        }
        // Top up only to the caller's size so `pending` stays under one block past it
        while self.pending.len() < buf.len() {
            match self.rx.try_recv() {
                Ok(block) => self.pending.extend(block),
                Err(_) => break,
            }
        }

        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

fn block_queue(capacity: usize) -> (BlockSender, BlockReader, Arc<AtomicU64>) {
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        BlockSender {
            tx,
            dropped: Arc::clone(&dropped),
        },
        BlockReader {
            rx,
            pending: VecDeque::new(),
        },
        dropped,
    )
}

pub struct CpalMicrophone {
    samples: BlockReader,
    dropped: Arc<AtomicU64>,
    control: Option<Sender<StreamControl>>,
    stream_thread: Option<JoinHandle<()>>,
}

impl Microphone for CpalMicrophone {
    fn start_recording(&mut self) -> Result<(), DeviceError> {
        self.control
            .as_ref()
            .and_then(|c| c.send(StreamControl::Play).ok())
            .ok_or_else(|| DeviceError::Open("audio stream thread exited".into()))
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        self.samples.read(buf, READ_TIMEOUT)
    }

    fn stop(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(StreamControl::Pause);
        }
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            warn!("Dropped {} audio blocks while capture was behind", dropped);
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        // Closing the control channel ends the stream thread
        self.control.take();
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }
}

pub struct CpalMicrophoneProvider;

impl MicrophoneProvider for CpalMicrophoneProvider {
    fn min_buffer_size(&self, sample_rate: u32, channels: u16) -> Result<usize, DeviceError> {
        cpal::default_host()
            .default_input_device()
            .ok_or(DeviceError::NotFound("microphone"))?;
        Ok((sample_rate * CPAL_BUFFER_MS / 1000) as usize * channels as usize * 2)
    }

    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        _buffer_bytes: usize,
    ) -> Result<Box<dyn Microphone>, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(DeviceError::NotFound("microphone"))?;
        let sample_format = device
            .default_input_config()
            .map_err(|e| DeviceError::Open(e.to_string()))?
            .sample_format();

        info!(
            "Audio device: {:?} ({}Hz, {}ch, {:?})",
            device.name().unwrap_or_default(),
            sample_rate,
            channels,
            sample_format
        );

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (samples_tx, samples_rx, dropped) = block_queue(QUEUE_BLOCKS);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = bounded(1);

        let stream_thread = thread::Builder::new()
            .name("cpal-stream".into())
            .spawn(move || {
                run_stream(device, config, sample_format, samples_tx, control_rx, ready_tx)
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalMicrophone {
                samples: samples_rx,
                dropped,
                control: Some(control_tx),
                stream_thread: Some(stream_thread),
            })),
            Ok(Err(e)) => {
                let _ = stream_thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = stream_thread.join();
                Err(DeviceError::Open("audio stream thread exited".into()))
            }
        }
    }
}

fn run_stream(
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    samples: BlockSender,
    control: Receiver<StreamControl>,
    ready: Sender<Result<(), DeviceError>>,
) {
    let on_error = |err| error!("Audio stream error: {}", err);

    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                samples.push(data.to_vec());
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::I32 => device.build_input_stream(
            &config,
            move |data: &[i32], _: &cpal::InputCallbackInfo| {
                samples.push(data.iter().map(|&s| (s >> 16) as i16).collect());
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                samples.push(
                    data.iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                        .collect(),
                );
            },
            on_error,
            None,
        ),
        fmt => {
            let _ = ready.send(Err(DeviceError::Open(format!(
                "unsupported sample format {:?}",
                fmt
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(DeviceError::Open(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    for command in control.iter() {
        let result = match command {
            StreamControl::Play => stream.play().map_err(|e| e.to_string()),
            StreamControl::Pause => stream.pause().map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            warn!("Audio stream control failed: {}", e);
        }
    }
}
