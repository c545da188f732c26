//! Audio capture module using cpal for cross-platform microphone access
//!
//! Captures audio from the default input device at its native sample rate,
//! downmixed to mono 16-bit PCM. Blocks land in a [`SharedChunkBuffer`]
//! that the voice coordinator drains on every flush.

pub(crate) mod buffer;
mod types;

pub(crate) use buffer::SharedChunkBuffer;
pub(crate) use types::{AudioCaptureError, CaptureDevice, CaptureStream};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Convert one float sample in [-1, 1] to i16 (negative side scales by 32768)
pub(crate) fn float_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Average interleaved frames down to one channel
pub(crate) fn downmix(data: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Gate between the device callback and the shared buffer
///
/// The connected flag is checked while holding the buffer lock, so once
/// [`SampleTap::disconnect`] returns no callback can push another block.
#[derive(Clone)]
struct SampleTap {
    buffer: SharedChunkBuffer,
    connected: Arc<AtomicBool>,
}

impl SampleTap {
    fn deliver(&self, block: Vec<i16>) {
        let mut buffer = self.buffer.lock();
        if self.connected.load(Ordering::SeqCst) {
            buffer.push(block);
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        drop(self.buffer.lock());
    }
}

/// The system default microphone
#[derive(Debug, Default)]
pub(crate) struct CpalCaptureDevice;

#[async_trait::async_trait]
impl CaptureDevice for CpalCaptureDevice {
    async fn open(
        &self,
        buffer: SharedChunkBuffer,
    ) -> Result<Box<dyn CaptureStream>, AudioCaptureError> {
        let tap = SampleTap {
            buffer,
            connected: Arc::new(AtomicBool::new(true)),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        // cpal streams are not Send, so the stream lives on its own thread
        let thread_tap = tap.clone();
        let thread_handle = thread::spawn(move || {
            run_capture(thread_tap, ready_tx, stop_rx);
        });

        let sample_rate = match ready_rx.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => return Err(AudioCaptureError::ThreadExited),
        };

        Ok(Box::new(CpalCapture {
            tap,
            sample_rate,
            stop_tx: Some(stop_tx),
            thread_handle: Some(thread_handle),
        }))
    }
}

/// Open cpal input stream owned by a capture thread
struct CpalCapture {
    tap: SampleTap,
    sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn disconnect(&mut self) {
        self.tap.disconnect();
    }

    fn close(&mut self) {
        self.tap.disconnect();
        // Dropping the sender wakes the capture thread
        self.stop_tx.take();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            info!("Audio capture stopped");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build and run the input stream until the stop channel closes
fn run_capture(
    tap: SampleTap,
    ready_tx: oneshot::Sender<Result<u32, AudioCaptureError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let stream = match build_stream(tap) {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            stream
        }
        Err(e) => {
            error!("Audio capture error: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Blocks until the handle sends or is dropped
    let _ = stop_rx.recv();
    drop(stream);
}

fn build_stream(tap: SampleTap) -> Result<(cpal::Stream, u32), AudioCaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AudioCaptureError::NoInputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio input device: {}", device_name);

    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    info!("Audio config: {} channels, {} Hz", channels, sample_rate);

    let err_callback = |err| {
        warn!("Audio stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                tap.deliver(downmix(data, channels));
            },
            err_callback,
            None,
        )?,
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                let samples: Vec<i16> = data.iter().map(|&s| float_to_i16(s)).collect();
                tap.deliver(downmix(&samples, channels));
            },
            err_callback,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _| {
                let samples: Vec<i16> = data
                    .iter()
                    .map(|&s| (s as i32 - 32768) as i16)
                    .collect();
                tap.deliver(downmix(&samples, channels));
            },
            err_callback,
            None,
        )?,
        sample_format => {
            return Err(AudioCaptureError::UnsupportedFormat(format!(
                "{:?}",
                sample_format
            )));
        }
    };

    stream.play()?;
    info!("Audio capture started");

    Ok((stream, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_conversion_is_asymmetric_and_clamped() {
        assert_eq!(float_to_i16(-1.0), -32768);
        assert_eq!(float_to_i16(1.0), 32767);
        assert_eq!(float_to_i16(0.0), 0);
        assert_eq!(float_to_i16(2.5), 32767);
        assert_eq!(float_to_i16(-7.0), -32768);
    }

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[10, 20, -4, 4], 2), vec![15, 0]);
        assert_eq!(downmix(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn test_tap_drops_blocks_after_disconnect() {
        let buffer = SharedChunkBuffer::new();
        let tap = SampleTap {
            buffer: buffer.clone(),
            connected: Arc::new(AtomicBool::new(true)),
        };
        tap.deliver(vec![1, 2]);
        tap.disconnect();
        tap.deliver(vec![3, 4]);
        assert_eq!(buffer.drain(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cpal_device_open() {
        // Only succeeds on machines with audio input
        match CpalCaptureDevice.open(SharedChunkBuffer::new()).await {
            Ok(mut stream) => {
                assert!(stream.sample_rate() > 0);
                stream.close();
                stream.close();
            }
            Err(AudioCaptureError::NoInputDevice) => {
                println!("No audio input device available (expected in CI)");
            }
            Err(e) => {
                println!("Audio device unavailable: {}", e);
            }
        }
    }
}
