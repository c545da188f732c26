//! Live voice dictation
//!
//! Owns the capture device, the periodic flush timer and the upload
//! serialization. Captured audio is drained every flush tick and uploaded
//! for incremental transcription; the cumulative transcript is merged into
//! the pending input buffer on every response.
//!
//! # Upload ordering
//! At most one upload is in flight per coordinator. Periodic flushes skip
//! their tick while an upload is running. The finalize flush issued by
//! [`VoiceCoordinator::stop`] instead waits for the running upload, so the
//! terminal upload is always last and is never dropped.

pub(crate) mod upload;

use crate::audio::buffer::pcm_bytes;
use crate::audio::{CaptureDevice, CaptureStream, SharedChunkBuffer};
use crate::config::FALLBACK_SAMPLE_RATE;
use crate::error::{RecorderError, UploadError};
use crate::session::VoiceSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use upload::{SpeechBackend, TranscriptUpdate, UploadRequest};

/// Capture lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CapturePhase {
    Idle,
    /// Device acquisition in progress
    Starting,
    Capturing,
    /// Stop requested, terminal upload pending
    Finalizing,
}

/// The outgoing message text, shared with the chat front end
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingInput {
    inner: Arc<Mutex<String>>,
}

impl PendingInput {
    fn lock(&self) -> MutexGuard<'_, String> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn get(&self) -> String {
        self.lock().clone()
    }

    pub(crate) fn set(&self, text: impl Into<String>) {
        *self.lock() = text.into();
    }

    pub(crate) fn take(&self) -> String {
        std::mem::take(&mut *self.lock())
    }
}

/// Input text while dictating: what was typed before recording plus the live transcript
fn compose_input(base: &str, transcript: &str) -> String {
    let combined = if transcript.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        transcript.to_string()
    } else {
        format!("{} {}", base, transcript)
    };
    combined.trim_start().to_string()
}

/// Tunables for the flush loop
#[derive(Debug, Clone, Copy)]
pub(crate) struct VoiceTiming {
    pub(crate) flush_interval: Duration,
    pub(crate) finalize_poll: Duration,
}

struct VoiceState {
    phase: CapturePhase,
    /// Bumped on every start so late work can tell its capture apart
    generation: u64,
    transcribing: bool,
    base_input: String,
    session: VoiceSession,
    live_transcript: String,
    recorder_error: Option<String>,
    stream: Option<Box<dyn CaptureStream>>,
    ticker: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<VoiceState>,
    upload_in_flight: AtomicBool,
    buffer: SharedChunkBuffer,
    device: Arc<dyn CaptureDevice>,
    backend: Arc<dyn SpeechBackend>,
    input: PendingInput,
    chat_active: watch::Receiver<bool>,
    timing: VoiceTiming,
}

/// The capture an upload belongs to, fixed before the upload is built
#[derive(Debug, Clone, Copy)]
struct CaptureTag {
    generation: u64,
    session: VoiceSession,
    sample_rate: u32,
}

fn capture_tag(st: &VoiceState) -> CaptureTag {
    CaptureTag {
        generation: st.generation,
        session: st.session,
        sample_rate: st
            .stream
            .as_ref()
            .map(|s| s.sample_rate())
            .unwrap_or(FALLBACK_SAMPLE_RATE),
    }
}

/// Clears the in-flight flag even if the upload future is dropped
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Coordinates capture, flushing and transcript merging for dictation
#[derive(Clone)]
pub(crate) struct VoiceCoordinator {
    inner: Arc<Inner>,
}

impl VoiceCoordinator {
    pub(crate) fn new(
        device: Arc<dyn CaptureDevice>,
        backend: Arc<dyn SpeechBackend>,
        input: PendingInput,
        chat_active: watch::Receiver<bool>,
        timing: VoiceTiming,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(VoiceState {
                    phase: CapturePhase::Idle,
                    generation: 0,
                    transcribing: false,
                    base_input: String::new(),
                    session: VoiceSession::new(),
                    live_transcript: String::new(),
                    recorder_error: None,
                    stream: None,
                    ticker: None,
                }),
                upload_in_flight: AtomicBool::new(false),
                buffer: SharedChunkBuffer::new(),
                device,
                backend,
                input,
                chat_active,
                timing,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, VoiceState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Voice state mutex was poisoned, recovering data");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn phase(&self) -> CapturePhase {
        self.state().phase
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.phase() == CapturePhase::Capturing
    }

    pub(crate) fn is_transcribing(&self) -> bool {
        self.state().transcribing
    }

    pub(crate) fn live_transcript(&self) -> String {
        self.state().live_transcript.clone()
    }

    pub(crate) fn recorder_error(&self) -> Option<String> {
        self.state().recorder_error.clone()
    }

    /// Acquire the microphone and begin periodic flushing
    ///
    /// Snapshots the pending input as the text dictation is appended to and
    /// issues a fresh voice session.
    ///
    /// # Errors
    /// Returns `RecorderError` if:
    /// - A chat reply is streaming (`ChatActive`)
    /// - Capture is not idle (`AlreadyRecording`)
    /// - The capture device cannot be opened (`Capture`), in which case the
    ///   coordinator is back to idle with the error recorded
    #[instrument(skip(self))]
    pub(crate) async fn start(&self) -> Result<(), RecorderError> {
        if *self.inner.chat_active.borrow() {
            return Err(RecorderError::ChatActive);
        }

        {
            let mut st = self.state();
            if st.phase != CapturePhase::Idle {
                return Err(RecorderError::AlreadyRecording);
            }
            st.phase = CapturePhase::Starting;
            st.generation += 1;
            st.recorder_error = None;
            st.base_input = self.inner.input.get();
            st.live_transcript.clear();
            st.session.rotate();
        }
        self.inner.buffer.clear();

        let stream = match self.inner.device.open(self.inner.buffer.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start audio capture: {}", e);
                let mut st = self.state();
                st.phase = CapturePhase::Idle;
                st.transcribing = false;
                st.base_input.clear();
                st.recorder_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        let mut st = self.state();
        info!(
            session = %st.session,
            sample_rate = stream.sample_rate(),
            "Recording started"
        );
        st.stream = Some(stream);
        st.ticker = Some(spawn_flush_ticker(
            Arc::downgrade(&self.inner),
            self.inner.timing.flush_interval,
        ));
        st.phase = CapturePhase::Capturing;
        st.transcribing = true;
        Ok(())
    }

    /// Drain buffered audio and upload it
    ///
    /// Non-final calls are skipped while another upload is in flight or
    /// when nothing was captured. A finalize call waits for the in-flight
    /// upload and always uploads, sending an empty terminal payload if needed.
    ///
    /// # Arguments
    /// - `finalize` - Mark this upload as the last one of the voice session
    ///
    /// # Errors
    /// Returns `RecorderError::Upload` if the speech endpoint fails. The
    /// capture is torn down unless it was already replaced by a newer one.
    #[instrument(skip(self))]
    pub(crate) async fn flush(&self, finalize: bool) -> Result<(), RecorderError> {
        if finalize {
            let tag = capture_tag(&self.state());
            return self.finalize(tag).await;
        }

        if self.phase() != CapturePhase::Capturing || self.inner.buffer.lock().is_empty() {
            return Ok(());
        }
        let Some(_guard) = self.try_claim_upload() else {
            debug!("Upload in flight, skipping flush tick");
            return Ok(());
        };

        let tag = capture_tag(&self.state());
        let samples = self.inner.buffer.drain();
        if samples.is_empty() {
            return Ok(());
        }
        self.upload(tag, samples, false).await
    }

    /// Terminal upload for the capture identified by `tag`
    ///
    /// Waits for any in-flight upload. If that capture ended in the meantime
    /// (failed upload, or replaced by a newer start) only an empty terminal
    /// marker goes out and nothing of the current capture is touched.
    async fn finalize(&self, tag: CaptureTag) -> Result<(), RecorderError> {
        let _guard = loop {
            if let Some(guard) = self.try_claim_upload() {
                break guard;
            }
            tokio::time::sleep(self.inner.timing.finalize_poll).await;
        };

        let samples = if self.is_current(&tag) {
            self.inner.buffer.drain()
        } else {
            warn!(session = %tag.session, "Capture ended before its finalize, sending terminal marker only");
            Vec::new()
        };
        self.upload(tag, samples, true).await
    }

    fn try_claim_upload(&self) -> Option<InFlightGuard<'_>> {
        let in_flight = &self.inner.upload_in_flight;
        in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then(|| InFlightGuard(in_flight))
    }

    /// True while the tagged capture is still the live one
    fn is_current(&self, tag: &CaptureTag) -> bool {
        let st = self.state();
        st.generation == tag.generation && st.phase != CapturePhase::Idle
    }

    async fn upload(
        &self,
        tag: CaptureTag,
        samples: Vec<i16>,
        finalize: bool,
    ) -> Result<(), RecorderError> {
        let request = UploadRequest {
            session: tag.session,
            sample_rate: tag.sample_rate,
            finalize,
            pcm: pcm_bytes(&samples),
        };

        match self.inner.backend.upload(request).await {
            Ok(update) => {
                self.apply_transcript(&tag, update, finalize);
                Ok(())
            }
            Err(e) => Err(self.fail_upload(&tag, e)),
        }
    }

    fn apply_transcript(&self, tag: &CaptureTag, update: TranscriptUpdate, finalize: bool) {
        let mut st = self.state();
        if st.generation != tag.generation || st.phase == CapturePhase::Idle {
            debug!(session = %tag.session, "Dropping transcript of an ended capture");
            return;
        }

        if st.phase == CapturePhase::Capturing || finalize {
            self.inner
                .input
                .set(compose_input(&st.base_input, &update.text));
        }
        st.live_transcript = update.text;

        if finalize {
            st.transcribing = false;
            st.base_input.clear();
            st.session.rotate();
            info!("Voice session finalized");
        }
    }

    fn fail_upload(&self, tag: &CaptureTag, e: UploadError) -> RecorderError {
        error!("Speech upload failed: {}", e);
        let mut st = self.state();
        if st.generation == tag.generation {
            st.recorder_error = Some(e.to_string());
            self.teardown_locked(&mut st);
        }
        e.into()
    }

    /// Stop capturing, upload the remainder as the terminal chunk and release the device
    ///
    /// The sample callback is disconnected before the terminal upload is
    /// issued. A no-op unless capturing.
    ///
    /// # Errors
    /// Returns `RecorderError::Upload` if the terminal upload fails. The
    /// device is released either way, unless a newer capture was started
    /// while this one was finalizing.
    #[instrument(skip(self))]
    pub(crate) async fn stop(&self) -> Result<(), RecorderError> {
        let tag = {
            let mut st = self.state();
            if st.phase != CapturePhase::Capturing {
                return Ok(());
            }
            st.phase = CapturePhase::Finalizing;
            if let Some(ticker) = st.ticker.take() {
                ticker.abort();
            }
            if let Some(stream) = st.stream.as_mut() {
                stream.disconnect();
            }
            capture_tag(&st)
        };

        let result = self.finalize(tag).await;

        let mut st = self.state();
        if st.generation == tag.generation {
            self.teardown_locked(&mut st);
            info!("Recording stopped");
        } else {
            info!("A newer recording started while finalizing, leaving it running");
        }
        result
    }

    /// Release everything capture holds. Idempotent and safe from idle.
    pub(crate) fn teardown(&self) {
        let mut st = self.state();
        self.teardown_locked(&mut st);
    }

    fn teardown_locked(&self, st: &mut VoiceState) {
        if let Some(ticker) = st.ticker.take() {
            ticker.abort();
        }
        if let Some(mut stream) = st.stream.take() {
            stream.disconnect();
            stream.close();
        }
        self.inner.buffer.clear();
        st.phase = CapturePhase::Idle;
        st.transcribing = false;
    }
}

/// Periodically spawn non-final flushes until the coordinator goes away
///
/// Each flush runs as its own task so aborting the ticker never cancels an
/// upload midway.
fn spawn_flush_ticker(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let coordinator = VoiceCoordinator { inner };
            tokio::spawn(async move {
                if let Err(e) = coordinator.flush(false).await {
                    debug!("Flush tick ended with error: {}", e);
                }
            });
        }
    })
}
