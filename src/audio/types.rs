//! Capture seams and error definitions

use super::buffer::SharedChunkBuffer;

/// A source of microphone audio
///
/// Opening the device starts delivering mono 16-bit sample blocks into the
/// given buffer until the returned stream is disconnected.
#[async_trait::async_trait]
pub(crate) trait CaptureDevice: Send + Sync {
    async fn open(
        &self,
        buffer: SharedChunkBuffer,
    ) -> Result<Box<dyn CaptureStream>, AudioCaptureError>;
}

/// Handle to an open capture device
pub(crate) trait CaptureStream: Send {
    /// Native sample rate of the delivered blocks
    fn sample_rate(&self) -> u32;

    /// Stop delivering samples. No block reaches the buffer after this returns.
    fn disconnect(&mut self);

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Errors that can occur while acquiring the capture device
#[derive(Debug, thiserror::Error)]
pub enum AudioCaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio capture thread exited before the device was ready")]
    ThreadExited,

    #[error("Audio stream error: {0}")]
    StreamError(#[from] cpal::BuildStreamError),

    #[error("Audio play error: {0}")]
    PlayError(#[from] cpal::PlayStreamError),

    #[error("Default config error: {0}")]
    DefaultConfigError(#[from] cpal::DefaultStreamConfigError),
}
