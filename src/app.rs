//! The chat session a front end drives
//!
//! Ties the chat and voice coordinators to one pending input buffer and
//! enforces the rules between them: no sending while dictating or while a
//! reply is streaming, no dictating while a reply is streaming.

use crate::chat::{ChatCoordinator, TransportKind};
use crate::conversation::TranscriptAccumulator;
use crate::error::{ChatError, RecorderError};
use crate::voice::{CapturePhase, PendingInput, VoiceCoordinator};
use std::fmt;
use tracing::debug;

/// What the session is busy with, for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionStatus {
    /// Transport is unknown until the reply headers arrive
    Streaming(Option<TransportKind>),
    Listening,
    Transcribing,
    Idle,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Streaming(Some(kind)) => write!(f, "Streaming via {}", kind),
            SessionStatus::Streaming(None) => write!(f, "Streaming"),
            SessionStatus::Listening => write!(f, "Listening"),
            SessionStatus::Transcribing => write!(f, "Transcribing"),
            SessionStatus::Idle => write!(f, "Idle"),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ChatSession {
    transcript: TranscriptAccumulator,
    chat: ChatCoordinator,
    voice: VoiceCoordinator,
    input: PendingInput,
}

impl ChatSession {
    pub(crate) fn new(
        transcript: TranscriptAccumulator,
        chat: ChatCoordinator,
        voice: VoiceCoordinator,
        input: PendingInput,
    ) -> Self {
        Self {
            transcript,
            chat,
            voice,
            input,
        }
    }

    pub(crate) fn transcript(&self) -> &TranscriptAccumulator {
        &self.transcript
    }

    pub(crate) fn input(&self) -> &PendingInput {
        &self.input
    }

    pub(crate) fn chat(&self) -> &ChatCoordinator {
        &self.chat
    }

    pub(crate) fn voice(&self) -> &VoiceCoordinator {
        &self.voice
    }

    /// True when the pending input may be sent right now
    pub(crate) fn can_send(&self) -> bool {
        !self.input.get().trim().is_empty()
            && !self.chat.is_streaming()
            && self.voice.phase() == CapturePhase::Idle
    }

    /// Send the pending input
    ///
    /// The input is taken, trimmed and handed to the chat coordinator.
    ///
    /// # Returns
    /// `Ok(true)` once sent, `Ok(false)` without sending when the input is blank.
    ///
    /// # Errors
    /// Returns `ChatError::Busy` while a reply streams or the microphone is
    /// live, and any error of [`ChatCoordinator::send`].
    pub(crate) async fn submit(&self) -> Result<bool, ChatError> {
        if self.input.get().trim().is_empty() {
            debug!("Nothing to send");
            return Ok(false);
        }
        if self.chat.is_streaming() || self.voice.phase() != CapturePhase::Idle {
            return Err(ChatError::Busy);
        }

        let text = self.input.take();
        self.chat.clear_last_error();
        self.chat.send(text.trim()).await?;
        Ok(true)
    }

    /// Start dictation when idle, stop it when capturing
    ///
    /// # Returns
    /// Whether the microphone is live afterwards.
    ///
    /// # Errors
    /// Returns `RecorderError::AlreadyRecording` while a start or stop is in
    /// progress, otherwise whatever the voice coordinator's start or stop returns.
    pub(crate) async fn toggle_recording(&self) -> Result<bool, RecorderError> {
        match self.voice.phase() {
            CapturePhase::Capturing => {
                self.voice.stop().await?;
                Ok(false)
            }
            CapturePhase::Idle => {
                if !self.chat.is_streaming() {
                    self.chat.clear_last_error();
                }
                self.voice.start().await?;
                Ok(true)
            }
            CapturePhase::Starting | CapturePhase::Finalizing => {
                Err(RecorderError::AlreadyRecording)
            }
        }
    }

    pub(crate) fn stop_streaming(&self) {
        self.chat.stop();
    }

    pub(crate) fn status(&self) -> SessionStatus {
        if self.chat.is_streaming() {
            SessionStatus::Streaming(self.chat.last_transport())
        } else if self.voice.is_capturing() {
            SessionStatus::Listening
        } else if self.voice.is_transcribing() {
            SessionStatus::Transcribing
        } else {
            SessionStatus::Idle
        }
    }

    /// Release the microphone and abort any reply
    pub(crate) fn shutdown(&self) {
        self.chat.stop();
        self.voice.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioCaptureError, CaptureDevice, CaptureStream, SharedChunkBuffer};
    use crate::chat::backend::{ChatBackend, ChatReply, ChatRequest};
    use crate::error::{PlaybackError, UploadError};
    use crate::playback::AudioPlayer;
    use crate::session::HistoryClearScheduler;
    use crate::voice::upload::{SpeechBackend, TranscriptUpdate, UploadRequest};
    use crate::voice::VoiceTiming;
    use futures_util::{stream, StreamExt};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct EchoChat {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ChatBackend for EchoChat {
        async fn send(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
            self.sent.lock().unwrap().push(request.message.clone());
            let body = format!("echo: {}", request.message).into_bytes();
            Ok(ChatReply {
                content_type: "text/plain".to_string(),
                body: stream::iter(vec![Ok(body)]).boxed(),
            })
        }
    }

    struct PendingChat;

    #[async_trait::async_trait]
    impl ChatBackend for PendingChat {
        async fn send(&self, _request: &ChatRequest) -> Result<ChatReply, ChatError> {
            std::future::pending().await
        }
    }

    struct Mute;

    impl AudioPlayer for Mute {
        fn play(&self, _audio_base64: &str, _mime_type: &str) -> Result<(), PlaybackError> {
            Ok(())
        }
    }

    struct SilentStream;

    impl CaptureStream for SilentStream {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn disconnect(&mut self) {}

        fn close(&mut self) {}
    }

    struct SilentDevice;

    #[async_trait::async_trait]
    impl CaptureDevice for SilentDevice {
        async fn open(
            &self,
            _buffer: SharedChunkBuffer,
        ) -> Result<Box<dyn CaptureStream>, AudioCaptureError> {
            Ok(Box::new(SilentStream))
        }
    }

    struct FixedSpeech(&'static str);

    #[async_trait::async_trait]
    impl SpeechBackend for FixedSpeech {
        async fn upload(&self, _request: UploadRequest) -> Result<TranscriptUpdate, UploadError> {
            Ok(TranscriptUpdate {
                text: self.0.to_string(),
            })
        }
    }

    fn session_with(backend: Arc<dyn ChatBackend>) -> ChatSession {
        let transcript = TranscriptAccumulator::new();
        let input = PendingInput::default();
        let chat = ChatCoordinator::new(
            transcript.clone(),
            backend,
            Arc::new(Mute),
            HistoryClearScheduler::new(transcript.clone(), Duration::from_secs(10)),
            false,
        );
        let voice = VoiceCoordinator::new(
            Arc::new(SilentDevice),
            Arc::new(FixedSpeech("dictated words")),
            input.clone(),
            chat.streaming(),
            VoiceTiming {
                flush_interval: Duration::from_secs(60),
                finalize_poll: Duration::from_millis(5),
            },
        );
        ChatSession::new(transcript, chat, voice, input)
    }

    #[tokio::test]
    async fn test_submit_sends_trimmed_input_and_clears_it() {
        let backend = Arc::new(EchoChat {
            sent: Mutex::new(Vec::new()),
        });
        let session = session_with(backend.clone());
        session.input().set("  hello  ");

        assert!(session.submit().await.unwrap());

        assert_eq!(*backend.sent.lock().unwrap(), vec!["hello".to_string()]);
        assert!(session.input().get().is_empty());
        let messages = session.transcript().snapshot();
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "echo: hello");
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_blank_input_is_not_sent() {
        let session = session_with(Arc::new(EchoChat {
            sent: Mutex::new(Vec::new()),
        }));
        session.input().set("   ");
        assert!(!session.can_send());
        assert!(!session.submit().await.unwrap());
        assert!(session.transcript().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_submit_refused_while_recording() {
        let session = session_with(Arc::new(EchoChat {
            sent: Mutex::new(Vec::new()),
        }));
        session.input().set("typed");
        assert!(session.toggle_recording().await.unwrap());
        assert_eq!(session.status(), SessionStatus::Listening);

        assert!(matches!(session.submit().await, Err(ChatError::Busy)));
        assert!(session.transcript().snapshot().is_empty());

        assert!(!session.toggle_recording().await.unwrap());
        assert_eq!(session.input().get(), "typed dictated words");
        assert!(session.can_send());
    }

    #[tokio::test]
    async fn test_streaming_blocks_submit_and_recording() {
        let session = session_with(Arc::new(PendingChat));
        session.input().set("first");
        let sending = {
            let session = session.clone();
            tokio::spawn(async move { session.submit().await })
        };
        let mut streaming = session.chat().streaming();
        streaming.wait_for(|s| *s).await.unwrap();

        assert_eq!(session.status(), SessionStatus::Streaming(None));
        session.input().set("second");
        assert!(matches!(session.submit().await, Err(ChatError::Busy)));
        assert!(matches!(
            session.toggle_recording().await,
            Err(RecorderError::ChatActive)
        ));

        session.stop_streaming();
        assert!(sending.await.unwrap().unwrap());
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.transcript().read(|c| c.open_assistant_count()), 0);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(
            SessionStatus::Streaming(Some(TransportKind::EventStream)).to_string(),
            "Streaming via event stream"
        );
        assert_eq!(SessionStatus::Listening.to_string(), "Listening");
    }
}
